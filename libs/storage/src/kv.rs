//! Key-value storage abstraction.
use async_trait::async_trait;
use std::fmt;
use zksync_concurrency::ctx;

/// An ordered group of writes applied atomically.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<BatchOp>,
}

#[derive(Debug)]
pub(crate) enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteBatch {
    /// Queues a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Storage backend contract. A `write` is atomic and must not return
/// before the batch is durable; the consensus driver relies on this when
/// it acknowledges a commit.
#[async_trait]
pub trait KeyValueStore: fmt::Debug + Send + Sync {
    /// Reads the value stored under `key`.
    async fn get(&self, ctx: &ctx::Ctx, key: &[u8]) -> ctx::Result<Option<Vec<u8>>>;

    /// Atomically applies the batch and flushes it to durable storage.
    async fn write(&self, ctx: &ctx::Ctx, batch: WriteBatch) -> ctx::Result<()>;
}
