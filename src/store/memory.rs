//! In-process counter store with clock-driven expiry.
//!
//! Behaves like a single-node key-value store: suitable for one limiter
//! instance, and for exercising the fixed window strategy under a
//! [`ManualClock`](crate::clock::ManualClock).

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::CounterStore;
use crate::clock::Clock;
use crate::error::{Result, TollgateError};

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

/// Counter store held in a sharded map.
pub struct MemoryCounterStore {
    entries: DashMap<String, Counter>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Current count for a key, treating expired keys as absent.
    pub fn count(&self, key: &str) -> u64 {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|counter| counter.expires_at > now)
            .map(|counter| counter.count)
            .unwrap_or(0)
    }

    /// Remaining time to live for a key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|counter| counter.expires_at > now)
            .map(|counter| counter.expires_at - now)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn admit(&self, key: &str, limit: u64, window: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = now.checked_add(window).ok_or_else(|| {
            TollgateError::InvalidPolicy(format!("window {:?} is out of range", window))
        })?;

        // The entry guard holds the shard lock for the whole check-and-increment.
        let admitted = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let counter = occupied.get_mut();
                if counter.expires_at <= now {
                    *counter = Counter {
                        count: 1,
                        expires_at,
                    };
                    true
                } else if counter.count >= limit {
                    false
                } else {
                    counter.count += 1;
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Counter {
                    count: 1,
                    expires_at,
                });
                true
            }
        };

        Ok(admitted)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, counter| counter.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (MemoryCounterStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryCounterStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_admit_up_to_limit() {
        let (store, _clock) = setup();
        let window = Duration::from_secs(10);

        for _ in 0..3 {
            assert!(store.admit("rate:a", 3, window).await.unwrap());
        }
        assert!(!store.admit("rate:a", 3, window).await.unwrap());
        assert_eq!(store.count("rate:a"), 3);
    }

    #[tokio::test]
    async fn test_ttl_not_extended_by_increments() {
        let (store, clock) = setup();
        let window = Duration::from_secs(10);

        store.admit("rate:a", 5, window).await.unwrap();
        clock.advance(Duration::from_secs(4));
        store.admit("rate:a", 5, window).await.unwrap();

        assert_eq!(store.ttl("rate:a"), Some(Duration::from_secs(6)));
    }

    #[tokio::test]
    async fn test_counter_resets_after_expiry() {
        let (store, clock) = setup();
        let window = Duration::from_secs(10);

        assert!(store.admit("rate:a", 1, window).await.unwrap());
        assert!(!store.admit("rate:a", 1, window).await.unwrap());

        clock.advance(window);
        assert_eq!(store.count("rate:a"), 0);
        assert!(store.admit("rate:a", 1, window).await.unwrap());
        assert_eq!(store.ttl("rate:a"), Some(window));
    }

    #[tokio::test]
    async fn test_out_of_range_window_is_an_error() {
        let (store, _clock) = setup();

        let result = store.admit("rate:a", 1, Duration::MAX).await;
        assert!(matches!(result, Err(TollgateError::InvalidPolicy(_))));
        assert_eq!(store.count("rate:a"), 0);
    }

    #[tokio::test]
    async fn test_remove_and_purge() {
        let (store, clock) = setup();

        store.admit("rate:a", 1, Duration::from_secs(1)).await.unwrap();
        store.admit("rate:b", 1, Duration::from_secs(100)).await.unwrap();

        store.remove("rate:b").await.unwrap();
        assert_eq!(store.count("rate:b"), 0);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
    }
}
