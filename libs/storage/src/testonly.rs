//! Test utilities.
use crate::{InMemoryStore, StateStore};
use std::sync::Arc;

/// A state store over a fresh in-memory backend.
pub fn new_store() -> StateStore {
    StateStore::new(Arc::new(InMemoryStore::new()))
}
