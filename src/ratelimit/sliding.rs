//! In-process sliding window log.
//!
//! Each identity keeps the instants of its admitted requests that are still
//! inside the window. Admission counts exactly what happened during the
//! trailing `window`, so there is no burst at window boundaries. State lives
//! only in this process.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::backend::WindowCounter;
use super::identity::ClientIdentity;
use super::policy::{LimitPolicyStore, Policy};
use crate::clock::Clock;
use crate::error::Result;

/// Admitted request instants for one identity.
#[derive(Debug, Default)]
struct WindowLog {
    stamps: VecDeque<Instant>,
}

impl WindowLog {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.stamps.front() {
            if now.saturating_duration_since(oldest) > window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        match self.stamps.back() {
            Some(&newest) => now.saturating_duration_since(newest) > window,
            None => true,
        }
    }
}

/// Sliding window log counter.
pub struct SlidingLogCounter {
    logs: DashMap<ClientIdentity, WindowLog>,
    clock: Arc<dyn Clock>,
}

impl SlidingLogCounter {
    /// Create an empty counter reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            logs: DashMap::new(),
            clock,
        }
    }

    /// Evaluate at an explicit instant.
    pub fn evaluate_at(&self, identity: &ClientIdentity, policy: &Policy, now: Instant) -> bool {
        let mut log = self.logs.entry(identity.clone()).or_default();
        log.prune(now, policy.window());

        let in_window = log.stamps.len() as u64;
        trace!(
            identity = %identity,
            in_window,
            limit = policy.limit(),
            "Evaluating sliding window"
        );

        if in_window < policy.limit() {
            log.stamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Number of admissions currently recorded for an identity.
    pub fn recorded(&self, identity: &ClientIdentity) -> usize {
        self.logs.get(identity).map(|log| log.stamps.len()).unwrap_or(0)
    }

    /// Number of identities with state.
    pub fn tracked_identities(&self) -> usize {
        self.logs.len()
    }
}

#[async_trait]
impl WindowCounter for SlidingLogCounter {
    async fn evaluate(&self, identity: &ClientIdentity, policy: &Policy) -> Result<bool> {
        Ok(self.evaluate_at(identity, policy, self.clock.now()))
    }

    async fn reset(&self, identity: &ClientIdentity) -> Result<()> {
        self.logs.remove(identity);
        Ok(())
    }

    /// A log is idle once its newest stamp falls outside the window of the
    /// policy now in force for its identity.
    fn sweep(&self, policies: &LimitPolicyStore) -> usize {
        let now = self.clock.now();
        let before = self.logs.len();
        self.logs
            .retain(|identity, log| !log.is_idle(now, policies.get(identity).window()));
        let removed = before.saturating_sub(self.logs.len());
        if removed > 0 {
            debug!(removed, remaining = self.logs.len(), "Swept idle window logs");
        }
        removed
    }

    fn strategy(&self) -> &'static str {
        "sliding_log"
    }
}
