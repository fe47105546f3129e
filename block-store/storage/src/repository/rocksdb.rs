use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use block_store_pipeline::{BlockRepository, BlockUnit, ChainPosition, HeaderId};
use bytes::Bytes;
use rocksdb::{ColumnFamily, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::LOG_TARGET;

const BLOCK_PREFIX: &[u8] = b"block/";
const STORE_TIP_KEY: &[u8] = b"meta/store_tip";
const ENCODED_POSITION_LEN: usize = 8 + 32;

/// Rocks repository settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RocksRepositorySettings {
    /// Directory of the database
    pub db_path: PathBuf,
    pub read_only: bool,
    pub column_family: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RocksRepositoryError {
    #[error(transparent)]
    Rocks(#[from] rocksdb::Error),
    #[error("Column family `{0}` is not open")]
    MissingColumnFamily(String),
    #[error("Stored tip is {0} bytes long, expected {ENCODED_POSITION_LEN}")]
    CorruptedTip(usize),
}

fn encode_position(position: &ChainPosition) -> [u8; ENCODED_POSITION_LEN] {
    let mut encoded = [0; ENCODED_POSITION_LEN];
    encoded[..8].copy_from_slice(&position.height().to_be_bytes());
    encoded[8..].copy_from_slice(position.id().as_ref());
    encoded
}

fn decode_position(raw: &[u8]) -> Result<ChainPosition, RocksRepositoryError> {
    let corrupted = || RocksRepositoryError::CorruptedTip(raw.len());
    let (height, id) = raw.split_first_chunk::<8>().ok_or_else(corrupted)?;
    let id = HeaderId::try_from(id).map_err(|_| corrupted())?;
    Ok(ChainPosition::new(u64::from_be_bytes(*height), id))
}

/// Big-endian heights keep blocks sorted by chain order on disk.
fn block_key(position: &ChainPosition) -> Vec<u8> {
    [BLOCK_PREFIX, encode_position(position).as_slice()].concat()
}

/// Block repository backed by rocksdb.
///
/// Every batch, store tip included, is written with a single `WriteBatch`.
/// Writers are serialized so the tip is only ever replaced by a higher one.
pub struct RocksRepository {
    rocks: Arc<DB>,
    column_family: Option<String>,
    write_lock: Mutex<()>,
}

impl RocksRepository {
    pub fn new(settings: RocksRepositorySettings) -> Result<Self, RocksRepositoryError> {
        let RocksRepositorySettings {
            db_path,
            read_only,
            column_family,
        } = settings;

        let db = match (read_only, column_family.as_deref()) {
            (true, None) => {
                let mut opts = Options::default();
                opts.create_if_missing(false);
                DB::open_for_read_only(&opts, db_path, false)?
            }
            (true, Some(cf)) => {
                let mut opts = Options::default();
                opts.create_if_missing(false);
                DB::open_cf_for_read_only(&opts, db_path, [cf], false)?
            }
            (false, None) => {
                let mut opts = Options::default();
                opts.create_if_missing(true);
                opts.create_missing_column_families(true);
                DB::open(&opts, db_path)?
            }
            (false, Some(cf)) => {
                let mut opts = Options::default();
                opts.create_if_missing(true);
                opts.create_missing_column_families(true);
                DB::open_cf(&opts, db_path, [cf])?
            }
        };

        Ok(Self {
            rocks: Arc::new(db),
            column_family,
            write_lock: Mutex::new(()),
        })
    }

    fn column_family(&self) -> Result<Option<&ColumnFamily>, RocksRepositoryError> {
        self.column_family
            .as_deref()
            .map(|name| {
                self.rocks
                    .cf_handle(name)
                    .ok_or_else(|| RocksRepositoryError::MissingColumnFamily(name.to_owned()))
            })
            .transpose()
    }

    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, RocksRepositoryError> {
        let value = match self.column_family()? {
            Some(cf) => self.rocks.get_cf(cf, key)?,
            None => self.rocks.get(key)?,
        };
        Ok(value)
    }

    fn write_units(&self, units: &[BlockUnit<Bytes>]) -> Result<(), RocksRepositoryError> {
        let Some(highest) = units.iter().map(BlockUnit::position).max_by_key(|p| p.height())
        else {
            return Ok(());
        };
        let current_tip = self.load(STORE_TIP_KEY)?.as_deref().map(decode_position).transpose()?;
        let cf = self.column_family()?;
        let mut batch = WriteBatch::default();
        let mut put = |key: &[u8], value: &[u8]| match cf {
            Some(cf) => batch.put_cf(cf, key, value),
            None => batch.put(key, value),
        };
        for unit in units {
            put(&block_key(unit.position()), unit.payload());
        }
        if current_tip.is_none_or(|tip| tip.height() < highest.height()) {
            put(STORE_TIP_KEY, &encode_position(highest));
        }
        self.rocks.write(batch)?;
        Ok(())
    }
}

impl core::fmt::Debug for RocksRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksRepository")
            .field("rocks", &self.rocks)
            .field("column_family", &self.column_family)
            .finish()
    }
}

#[async_trait]
impl BlockRepository for RocksRepository {
    type Block = Bytes;
    type Error = RocksRepositoryError;

    async fn insert_batch(
        &self,
        units: Vec<BlockUnit<Self::Block>>,
    ) -> Result<(), (Self::Error, Vec<BlockUnit<Self::Block>>)> {
        let _guard = self.write_lock.lock().await;
        match self.write_units(&units) {
            Ok(()) => {
                debug!(target: LOG_TARGET, count = units.len(), "Wrote block batch to rocksdb");
                Ok(())
            }
            Err(error) => Err((error, units)),
        }
    }

    async fn get_block(
        &self,
        position: &ChainPosition,
    ) -> Result<Option<Self::Block>, Self::Error> {
        Ok(self.load(&block_key(position))?.map(Bytes::from))
    }

    async fn store_tip(&self) -> Result<Option<ChainPosition>, Self::Error> {
        self.load(STORE_TIP_KEY)?
            .as_deref()
            .map(decode_position)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use block_store_pipeline::mock::header_id;
    use tempfile::TempDir;

    use super::*;

    fn settings(
        dir: &TempDir,
        read_only: bool,
        column_family: Option<&str>,
    ) -> RocksRepositorySettings {
        RocksRepositorySettings {
            db_path: dir.path().to_path_buf(),
            read_only,
            column_family: column_family.map(ToOwned::to_owned),
        }
    }

    fn unit(height: u64) -> BlockUnit<Bytes> {
        BlockUnit::new(
            ChainPosition::new(height, header_id(height)),
            Bytes::from(format!("block {height}")),
        )
    }

    #[tokio::test]
    async fn test_insert_and_load() -> Result<(), RocksRepositoryError> {
        let temp_path = TempDir::new().unwrap();
        let repository = RocksRepository::new(settings(&temp_path, false, None))?;

        assert_eq!(repository.store_tip().await?, None);
        repository
            .insert_batch(vec![unit(0), unit(1), unit(2)])
            .await
            .map_err(|(error, _)| error)?;

        let position = ChainPosition::new(1, header_id(1));
        assert_eq!(
            repository.get_block(&position).await?,
            Some(Bytes::from_static(b"block 1"))
        );
        assert_eq!(
            repository.get_block(&ChainPosition::new(3, header_id(3))).await?,
            None
        );
        assert_eq!(
            repository.store_tip().await?,
            Some(ChainPosition::new(2, header_id(2)))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_reinsert_is_idempotent() -> Result<(), RocksRepositoryError> {
        let temp_path = TempDir::new().unwrap();
        let repository = RocksRepository::new(settings(&temp_path, false, Some("blocks")))?;

        let older = vec![unit(4), unit(5)];
        for batch in [older.clone(), vec![unit(6), unit(7)], older] {
            repository
                .insert_batch(batch)
                .await
                .map_err(|(error, _)| error)?;
        }

        assert_eq!(
            repository.get_block(&ChainPosition::new(4, header_id(4))).await?,
            Some(Bytes::from_static(b"block 4"))
        );
        assert_eq!(
            repository.store_tip().await?,
            Some(ChainPosition::new(7, header_id(7)))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_tip_survives_reopen() -> Result<(), RocksRepositoryError> {
        let temp_path = TempDir::new().unwrap();
        {
            let repository = RocksRepository::new(settings(&temp_path, false, Some("blocks")))?;
            repository
                .insert_batch(vec![unit(0), unit(1)])
                .await
                .map_err(|(error, _)| error)?;
        }

        let repository = RocksRepository::new(settings(&temp_path, false, Some("blocks")))?;
        assert_eq!(
            repository.store_tip().await?,
            Some(ChainPosition::new(1, header_id(1)))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_read_only_rejects_batches_and_keeps_them() -> Result<(), RocksRepositoryError> {
        let temp_path = TempDir::new().unwrap();
        let writer = RocksRepository::new(settings(&temp_path, false, None))?;
        writer
            .insert_batch(vec![unit(0)])
            .await
            .map_err(|(error, _)| error)?;

        let reader = RocksRepository::new(settings(&temp_path, true, None))?;
        assert_eq!(
            reader.get_block(&ChainPosition::new(0, header_id(0))).await?,
            Some(Bytes::from_static(b"block 0"))
        );

        let (_, returned) = reader
            .insert_batch(vec![unit(1), unit(2)])
            .await
            .expect_err("read-only database accepted a write");
        assert_eq!(returned.len(), 2);
        assert_eq!(returned[1].position().height(), 2);
        Ok(())
    }

    #[test]
    fn test_corrupted_tip_is_reported() {
        assert!(matches!(
            decode_position(&[0; 12]),
            Err(RocksRepositoryError::CorruptedTip(12))
        ));
    }
}
