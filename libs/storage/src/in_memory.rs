//! In-memory storage implementation.
use crate::kv::{BatchOp, KeyValueStore, WriteBatch};
use async_trait::async_trait;
use std::collections::BTreeMap;
use zksync_concurrency::{ctx, sync};

/// In-memory store. Used in tests and for ephemeral nodes; the batch is
/// applied under one lock so readers never observe a torn write.
#[derive(Debug, Default)]
pub struct InMemoryStore(sync::Mutex<BTreeMap<Vec<u8>, Vec<u8>>>);

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, _ctx: &ctx::Ctx, key: &[u8]) -> ctx::Result<Option<Vec<u8>>> {
        Ok(self.0.lock().await.get(key).cloned())
    }

    async fn write(&self, _ctx: &ctx::Ctx, batch: WriteBatch) -> ctx::Result<()> {
        let mut map = self.0.lock().await;
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}
