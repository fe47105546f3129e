//! Repository and local-availability collaborators for the block store
//! pipeline.

pub mod pending;
pub mod repository;

pub use pending::{LocalAvailability, PendingBlocks, PendingBlocksSettings};
pub use repository::memory::MemoryRepository;
#[cfg(feature = "rocksdb-backend")]
pub use repository::rocksdb::{RocksRepository, RocksRepositoryError, RocksRepositorySettings};

pub(crate) const LOG_TARGET: &str = "block_store::storage";
