//! Fixed window counter backed by a shared store.
//!
//! All limiter instances pointed at the same store share one counter per
//! client, keyed `{prefix}{identity}`. The window starts with the first
//! admitted request and ends when the store expires the key.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::backend::WindowCounter;
use super::identity::ClientIdentity;
use super::policy::{LimitPolicyStore, Policy};
use crate::error::{Result, TollgateError};
use crate::store::CounterStore;

/// Default prefix for counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "rate:";
/// Default bound on a single store round trip.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Store-backed fixed window counter.
pub struct FixedWindowCounter {
    store: Arc<dyn CounterStore>,
    key_prefix: String,
    backend_timeout: Duration,
}

impl FixedWindowCounter {
    /// Create a counter over `store` with the default prefix and timeout.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    /// Use a different key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Bound each store call by `backend_timeout`.
    pub fn with_backend_timeout(mut self, backend_timeout: Duration) -> Self {
        self.backend_timeout = backend_timeout;
        self
    }

    /// The store key for an identity.
    pub fn key(&self, identity: &ClientIdentity) -> String {
        format!("{}{}", self.key_prefix, identity)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match timeout(self.backend_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                debug!(
                    operation,
                    timeout = ?self.backend_timeout,
                    "Counter store call timed out"
                );
                Err(TollgateError::BackendUnavailable(format!(
                    "{} timed out after {:?}",
                    operation, self.backend_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl WindowCounter for FixedWindowCounter {
    async fn evaluate(&self, identity: &ClientIdentity, policy: &Policy) -> Result<bool> {
        let key = self.key(identity);
        trace!(key = %key, limit = policy.limit(), "Evaluating fixed window");

        self.bounded(
            "admit",
            self.store.admit(&key, policy.limit(), policy.window()),
        )
        .await
    }

    async fn reset(&self, identity: &ClientIdentity) -> Result<()> {
        let key = self.key(identity);
        self.bounded("remove", self.store.remove(&key)).await
    }

    /// Expiry was fixed when each key was created, so the store decides.
    fn sweep(&self, _policies: &LimitPolicyStore) -> usize {
        self.store.purge_expired()
    }

    fn strategy(&self) -> &'static str {
        "fixed_window"
    }
}
