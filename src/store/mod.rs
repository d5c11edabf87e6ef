//! Shared counter stores for the fixed window strategy.
//!
//! A store keeps one integer counter per key with a time-to-live. The only
//! write path is [`CounterStore::admit`], which must run its check, increment
//! and conditional expire as a single atomic step so that concurrent limiter
//! instances sharing the store never admit past the limit.

mod memory;
mod redis_store;

pub use memory::MemoryCounterStore;
pub use redis_store::RedisCounterStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// A key-value counter store with native TTL support.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically admit one request against `key`.
    ///
    /// Reads the counter (missing means 0); if it is already at `limit`
    /// returns `false` without writing. Otherwise increments it and, when the
    /// increment created the key, sets its TTL to `window`. The TTL is never
    /// extended by later increments.
    async fn admit(&self, key: &str, limit: u64, window: Duration) -> Result<bool>;

    /// Delete the counter for `key`.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Drop expired keys for stores without native expiry. Returns how many
    /// were removed.
    fn purge_expired(&self) -> usize {
        0
    }
}
