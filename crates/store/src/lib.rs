//! Atomic key-value store adapter for persisted bandit state.
//!
//! Every call to [`AtomicStore::execute_batch`] is one transaction: all of
//! its operations apply or none do. Two batches are never atomic with respect
//! to each other.

#![warn(clippy::unwrap_used)]

pub mod batch;
pub mod memory;
pub mod redis_store;

pub use batch::{AtomicStore, Batch, Replies, StoreOp, StoreValue};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
