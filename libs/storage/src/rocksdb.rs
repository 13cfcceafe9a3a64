//! RocksDB-backed storage implementation.
use crate::kv::{BatchOp, KeyValueStore, WriteBatch};
use anyhow::Context as _;
use async_trait::async_trait;
use std::{fmt, path::Path, sync::RwLock};
use zksync_concurrency::{ctx, scope};

/// Persistent store on top of RocksDB. The `RwLock` is not needed for
/// memory safety, it just linearizes writes with respect to each other.
pub struct RocksdbStore(RwLock<rocksdb::DB>);

impl RocksdbStore {
    /// Opens the database at `path`, creating it if missing.
    pub async fn open(_ctx: &ctx::Ctx, path: &Path) -> ctx::Result<Self> {
        let path = path.to_owned();
        let db = scope::wait_blocking(move || {
            let mut options = rocksdb::Options::default();
            options.create_if_missing(true);
            rocksdb::DB::open(&options, path).context("failed opening RocksDB")
        })
        .await?;
        Ok(Self(RwLock::new(db)))
    }
}

impl fmt::Debug for RocksdbStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RocksdbStore")
    }
}

#[async_trait]
impl KeyValueStore for RocksdbStore {
    async fn get(&self, _ctx: &ctx::Ctx, key: &[u8]) -> ctx::Result<Option<Vec<u8>>> {
        let value = scope::wait_blocking(|| {
            let db = self.0.read().expect("DB lock is poisoned");
            db.get(key).context("RocksDB read failed")
        })
        .await?;
        Ok(value)
    }

    async fn write(&self, _ctx: &ctx::Ctx, batch: WriteBatch) -> ctx::Result<()> {
        scope::wait_blocking(|| {
            let db = self.0.write().expect("DB lock is poisoned");
            let mut inner = rocksdb::WriteBatch::default();
            for op in batch.ops {
                match op {
                    BatchOp::Put(key, value) => inner.put(key, value),
                    BatchOp::Delete(key) => inner.delete(key),
                }
            }
            let mut options = rocksdb::WriteOptions::default();
            options.set_sync(true);
            db.write_opt(inner, &options)
                .context("RocksDB write failed")
        })
        .await?;
        Ok(())
    }
}
