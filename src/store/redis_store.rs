//! Redis-backed counter store.
//!
//! Lets several limiter instances share one fixed window per client. The
//! check, increment and first-write expiry run inside one Lua script, so
//! Redis executes them atomically and two instances can never both observe
//! `count < limit` for the last free slot.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::fmt;
use std::time::Duration;
use tracing::info;

use super::CounterStore;
use crate::error::{Result, TollgateError};

/// KEYS[1] = counter key, ARGV[1] = limit, ARGV[2] = window in milliseconds.
/// Returns 1 when admitted, 0 when the window is full.
const ADMIT_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return 0
end
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 1
"#;

fn unavailable(e: RedisError) -> TollgateError {
    TollgateError::BackendUnavailable(e.to_string())
}

/// Counter store on a Redis server.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    admit_script: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    ///
    /// # Errors
    /// Returns `BackendUnavailable` if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(unavailable)?;
        let connection = ConnectionManager::new(client).await.map_err(unavailable)?;

        info!(url = %url, "Connected to Redis counter store");

        Ok(Self {
            connection,
            admit_script: Script::new(ADMIT_SCRIPT),
        })
    }

    /// Round-trip a PING to check the server is reachable.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn admit(&self, key: &str, limit: u64, window: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let window_ms = window.as_millis().clamp(1, u64::MAX as u128) as u64;

        let admitted: i64 = self
            .admit_script
            .key(key)
            .arg(limit)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(admitted == 1)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await.map_err(unavailable)?;
        Ok(())
    }
}
