//! Persistence for the consensus node: a minimal key-value abstraction
//! with atomic, durably-flushed batches, and the state store built on top
//! of it that keeps per-height chain state, validator sets, consensus
//! parameters and application responses.
mod in_memory;
mod kv;
mod rocksdb;
mod state_store;
pub mod testonly;

pub use crate::{
    in_memory::InMemoryStore,
    kv::{KeyValueStore, WriteBatch},
    rocksdb::RocksdbStore,
    state_store::StateStore,
};
