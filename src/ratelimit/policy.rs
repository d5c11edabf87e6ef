//! Per-client limit policies.
//!
//! Policies are resolved per identity: an override installed at runtime (or
//! preloaded from a YAML file) wins, otherwise the process-wide default applies.
//! The store also owns the striped locks that keep policy updates and window
//! evaluations for the same identity from interleaving.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{RwLock as AsyncRwLock, RwLockReadGuard};
use tracing::{debug, info};

use super::backend::WindowCounter;
use super::identity::ClientIdentity;
use crate::error::{Result, TollgateError};

/// Number of lock stripes shared by all identities.
const LOCK_STRIPES: usize = 64;

/// Longest window a policy may use (one year).
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A validated `(limit, window)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    limit: u64,
    window: Duration,
}

impl Policy {
    /// Create a policy, rejecting a zero limit or a window that is empty or
    /// longer than [`MAX_WINDOW`].
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(TollgateError::InvalidPolicy(
                "limit must be at least 1".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TollgateError::InvalidPolicy(
                "window must be greater than zero".to_string(),
            ));
        }
        if window > MAX_WINDOW {
            return Err(TollgateError::InvalidPolicy(format!(
                "window must be at most {} seconds",
                MAX_WINDOW.as_secs()
            )));
        }
        Ok(Self { limit, window })
    }

    /// Maximum admissions per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Length of the window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Overrides loaded from a file at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub overrides: Vec<OverrideRule>,
}

/// A single identity override as written in the overrides file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRule {
    /// Client identity (usually an IP address)
    pub identity: String,
    /// Requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl PolicyOverrides {
    /// Load overrides from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy overrides");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load overrides from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse policy overrides: {}", e)))
    }

    /// Validate every rule, yielding typed identities and policies.
    pub fn resolve(&self) -> Result<Vec<(ClientIdentity, Policy)>> {
        self.overrides
            .iter()
            .map(|rule| {
                let policy = Policy::new(rule.limit, Duration::from_secs(rule.window_secs))
                    .map_err(|e| {
                        TollgateError::Config(format!("override for {}: {}", rule.identity, e))
                    })?;
                Ok((ClientIdentity::new(rule.identity.clone()), policy))
            })
            .collect()
    }
}

/// A resolved policy plus a shared hold on the identity's stripe.
///
/// While a lease is alive, no policy update for an identity on the same
/// stripe can complete.
pub struct PolicyLease<'a> {
    pub policy: Policy,
    _guard: RwLockReadGuard<'a, ()>,
}

/// Resolves the policy for each identity.
pub struct LimitPolicyStore {
    default: RwLock<Policy>,
    overrides: DashMap<ClientIdentity, Policy>,
    stripes: Box<[AsyncRwLock<()>]>,
    hasher: RandomState,
}

impl LimitPolicyStore {
    /// Create a store with the given default policy and no overrides.
    pub fn new(default: Policy) -> Self {
        Self {
            default: RwLock::new(default),
            overrides: DashMap::new(),
            stripes: (0..LOCK_STRIPES).map(|_| AsyncRwLock::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    /// Create a store preloaded with overrides.
    pub fn with_overrides(default: Policy, overrides: Vec<(ClientIdentity, Policy)>) -> Self {
        let store = Self::new(default);
        for (identity, policy) in overrides {
            store.overrides.insert(identity, policy);
        }
        store
    }

    /// The policy in force for an identity.
    pub fn get(&self, identity: &ClientIdentity) -> Policy {
        self.overrides
            .get(identity)
            .map(|entry| *entry)
            .unwrap_or_else(|| *self.default.read())
    }

    /// Resolve the policy while holding the identity's stripe for reading.
    pub async fn lease(&self, identity: &ClientIdentity) -> PolicyLease<'_> {
        let guard = self.stripe(identity).read().await;
        PolicyLease {
            policy: self.get(identity),
            _guard: guard,
        }
    }

    /// Install an override and reset the identity's window state.
    ///
    /// The reset and the write happen under the stripe's write lock. If the
    /// reset fails the previous policy stays in force.
    pub async fn set(
        &self,
        identity: &ClientIdentity,
        limit: u64,
        window: Duration,
        counter: &dyn WindowCounter,
    ) -> Result<Policy> {
        let policy = Policy::new(limit, window)?;

        let _guard = self.stripe(identity).write().await;
        counter.reset(identity).await?;
        self.overrides.insert(identity.clone(), policy);

        debug!(
            identity = %identity,
            limit = policy.limit(),
            window = ?policy.window(),
            "Installed policy override"
        );
        Ok(policy)
    }

    /// Remove an override, reverting the identity to the default.
    pub fn remove(&self, identity: &ClientIdentity) -> Option<Policy> {
        self.overrides.remove(identity).map(|(_, policy)| policy)
    }

    /// The process-wide default.
    pub fn default_policy(&self) -> Policy {
        *self.default.read()
    }

    /// Replace the process-wide default. Existing window state is kept.
    pub fn set_default(&self, limit: u64, window: Duration) -> Result<Policy> {
        let policy = Policy::new(limit, window)?;
        *self.default.write() = policy;
        info!(limit, window = ?window, "Default policy changed");
        Ok(policy)
    }

    /// Number of installed overrides.
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }

    fn stripe_index(&self, identity: &ClientIdentity) -> usize {
        (self.hasher.hash_one(identity) as usize) % self.stripes.len()
    }

    fn stripe(&self, identity: &ClientIdentity) -> &AsyncRwLock<()> {
        &self.stripes[self.stripe_index(identity)]
    }
}
