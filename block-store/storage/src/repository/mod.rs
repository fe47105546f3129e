pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocksdb;
