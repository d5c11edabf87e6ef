//! Core rate limiter implementation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::backend::WindowCounter;
use super::identity::{ClientIdentity, ClientKeyResolver, IpKeyResolver, RequestInfo};
use super::policy::{LimitPolicyStore, Policy};
use crate::audit::{self, AuditEntry, AuditSink};
use crate::error::Result;

/// What to decide when the counter backend cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request
    Open,
    /// Reject the request
    #[default]
    Closed,
}

impl FailureMode {
    fn admits(self) -> bool {
        matches!(self, FailureMode::Open)
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The request fit inside the window
    Admitted,
    /// The window was full
    LimitExceeded,
    /// The backend failed and the failure mode decided
    BackendError,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Admitted => "admitted",
            Reason::LimitExceeded => "limit_exceeded",
            Reason::BackendError => "backend_error",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct AllowResult {
    pub identity: ClientIdentity,
    pub admitted: bool,
    pub reason: Reason,
    /// Policy the request was evaluated against
    pub policy: Policy,
}

/// The admission controller.
///
/// Combines identity resolution, policy lookup and window evaluation. This
/// struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    resolver: Arc<dyn ClientKeyResolver>,
    policies: LimitPolicyStore,
    counter: Arc<dyn WindowCounter>,
    failure_mode: FailureMode,
    audit: Option<Arc<dyn AuditSink>>,
}

impl RateLimiter {
    /// Create a rate limiter over `counter` with the given default policy.
    ///
    /// Identities are the peer IP and backend failures reject.
    pub fn new(counter: Arc<dyn WindowCounter>, default_policy: Policy) -> Self {
        Self {
            resolver: Arc::new(IpKeyResolver::new()),
            policies: LimitPolicyStore::new(default_policy),
            counter,
            failure_mode: FailureMode::default(),
            audit: None,
        }
    }

    /// Replace the policy store, e.g. one preloaded with overrides.
    pub fn with_policy_store(mut self, policies: LimitPolicyStore) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ClientKeyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Decide whether a request may proceed.
    pub async fn allow(&self, request: &RequestInfo) -> AllowResult {
        let identity = self.resolve(request);
        self.check(&identity).await
    }

    /// The identity a request is accounted under.
    pub fn resolve(&self, request: &RequestInfo) -> ClientIdentity {
        self.resolver.resolve(request)
    }

    /// Decide for an already-resolved identity.
    ///
    /// Always returns a decision. Backend failures are logged and resolved
    /// by the configured [`FailureMode`].
    pub async fn check(&self, identity: &ClientIdentity) -> AllowResult {
        let result = {
            let lease = self.policies.lease(identity).await;
            let policy = lease.policy;

            trace!(
                identity = %identity,
                limit = policy.limit(),
                window = ?policy.window(),
                "Checking rate limit"
            );

            let (admitted, reason) = match self.counter.evaluate(identity, &policy).await {
                Ok(true) => (true, Reason::Admitted),
                Ok(false) => {
                    debug!(identity = %identity, limit = policy.limit(), "Rate limit exceeded");
                    (false, Reason::LimitExceeded)
                }
                Err(e) => {
                    warn!(
                        identity = %identity,
                        error = %e,
                        failure_mode = ?self.failure_mode,
                        strategy = self.counter.strategy(),
                        "Counter backend failed, applying failure mode"
                    );
                    (self.failure_mode.admits(), Reason::BackendError)
                }
            };

            AllowResult {
                identity: identity.clone(),
                admitted,
                reason,
                policy,
            }
        };

        self.record_audit(&result);
        result
    }

    /// Install a per-identity policy and reset the identity's history.
    ///
    /// Fails with `InvalidPolicy` for a zero limit or window, and with
    /// `BackendUnavailable` if the history could not be reset; in both cases
    /// the previous policy stays in force.
    pub async fn update_policy(
        &self,
        identity: &ClientIdentity,
        limit: u64,
        window: Duration,
    ) -> Result<Policy> {
        match self
            .policies
            .set(identity, limit, window, self.counter.as_ref())
            .await
        {
            Ok(policy) => {
                info!(identity = %identity, limit, window = ?window, "Rate limit policy updated");
                Ok(policy)
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Rate limit policy update failed");
                Err(e)
            }
        }
    }

    /// Change the policy for identities without an override.
    pub fn update_default_policy(&self, limit: u64, window: Duration) -> Result<Policy> {
        self.policies.set_default(limit, window)
    }

    /// The policy currently in force for an identity.
    pub fn policy_for(&self, identity: &ClientIdentity) -> Policy {
        self.policies.get(identity)
    }

    /// Drop window state that can no longer affect a decision.
    pub fn sweep(&self) -> usize {
        self.counter.sweep(&self.policies)
    }

    /// Name of the configured counting strategy.
    pub fn strategy(&self) -> &'static str {
        self.counter.strategy()
    }

    fn record_audit(&self, result: &AllowResult) {
        let Some(sink) = &self.audit else {
            return;
        };

        let (outcome, message) = if result.admitted {
            ("admitted", "request admitted")
        } else {
            ("rejected", "request rejected")
        };
        let entry = AuditEntry::new(message)
            .label("identity", result.identity.as_str())
            .label("outcome", outcome)
            .label("reason", result.reason.as_str())
            .label("strategy", self.counter.strategy());

        audit::dispatch(Arc::clone(sink), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TollgateError;
    use crate::ratelimit::{FixedWindowCounter, SlidingLogCounter};
    use crate::store::{CounterStore, MemoryCounterStore};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn admit(&self, _key: &str, _limit: u64, _window: Duration) -> Result<bool> {
            Err(TollgateError::BackendUnavailable("connection refused".to_string()))
        }

        async fn remove(&self, _key: &str) -> Result<()> {
            Err(TollgateError::BackendUnavailable("connection refused".to_string()))
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<AuditEntry>);

    #[async_trait]
    impl AuditSink for ChannelSink {
        async fn push(&self, entry: AuditEntry) -> Result<()> {
            let _ = self.0.send(entry);
            Ok(())
        }
    }

    #[derive(Clone, Copy, Debug)]
    enum Strategy {
        Log,
        Fixed,
    }

    const STRATEGIES: [Strategy; 2] = [Strategy::Log, Strategy::Fixed];

    fn default_policy() -> Policy {
        Policy::new(2, Duration::from_secs(60)).unwrap()
    }

    fn limiter(strategy: Strategy, default: Policy) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::default();
        let counter: Arc<dyn WindowCounter> = match strategy {
            Strategy::Log => Arc::new(SlidingLogCounter::new(Arc::new(clock.clone()))),
            Strategy::Fixed => Arc::new(FixedWindowCounter::new(Arc::new(
                MemoryCounterStore::new(Arc::new(clock.clone())),
            ))),
        };
        (RateLimiter::new(counter, default), clock)
    }

    fn failing_limiter(mode: FailureMode) -> RateLimiter {
        let counter = Arc::new(FixedWindowCounter::new(Arc::new(FailingStore)));
        RateLimiter::new(counter, default_policy()).with_failure_mode(mode)
    }

    async fn decisions(limiter: &RateLimiter, identity: &ClientIdentity, n: usize) -> Vec<bool> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(limiter.check(identity).await.admitted);
        }
        out
    }

    #[tokio::test]
    async fn test_default_policy_scenario() {
        for strategy in STRATEGIES {
            let (limiter, clock) = limiter(strategy, default_policy());
            let a = ClientIdentity::new("A");

            let mut results = Vec::new();
            for _ in 0..3 {
                results.push(limiter.check(&a).await.admitted);
                clock.advance(Duration::from_millis(300));
            }
            assert_eq!(results, vec![true, true, false], "{:?}", strategy);

            clock.advance(Duration::from_secs(61));
            let fourth = limiter.check(&a).await;
            assert!(fourth.admitted, "{:?}", strategy);
            assert_eq!(fourth.reason, Reason::Admitted);
        }
    }

    #[tokio::test]
    async fn test_rejection_reason_and_policy() {
        let (limiter, _clock) = limiter(Strategy::Log, default_policy());
        let a = ClientIdentity::new("A");

        decisions(&limiter, &a, 2).await;
        let result = limiter.check(&a).await;

        assert!(!result.admitted);
        assert_eq!(result.reason, Reason::LimitExceeded);
        assert_eq!(result.reason.to_string(), "limit_exceeded");
        assert_eq!(result.policy, default_policy());
        assert_eq!(result.identity, a);
    }

    #[tokio::test]
    async fn test_update_policy_scenario() {
        for strategy in STRATEGIES {
            let (limiter, _clock) = limiter(strategy, default_policy());
            let a = ClientIdentity::new("A");

            limiter
                .update_policy(&a, 5, Duration::from_secs(30))
                .await
                .unwrap();

            assert_eq!(
                decisions(&limiter, &a, 6).await,
                vec![true, true, true, true, true, false],
                "{:?}",
                strategy
            );
        }
    }

    #[tokio::test]
    async fn test_update_policy_resets_history() {
        for strategy in STRATEGIES {
            let (limiter, _clock) = limiter(strategy, default_policy());
            let a = ClientIdentity::new("A");

            assert_eq!(decisions(&limiter, &a, 3).await, vec![true, true, false]);

            limiter
                .update_policy(&a, 2, Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(
                decisions(&limiter, &a, 3).await,
                vec![true, true, false],
                "{:?}",
                strategy
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_update_leaves_state_untouched() {
        for strategy in STRATEGIES {
            let (limiter, _clock) = limiter(strategy, default_policy());
            let a = ClientIdentity::new("A");
            decisions(&limiter, &a, 2).await;

            let err = limiter.update_policy(&a, 0, Duration::from_secs(60)).await;
            assert!(matches!(err, Err(TollgateError::InvalidPolicy(_))));
            let err = limiter.update_policy(&a, 10, Duration::ZERO).await;
            assert!(matches!(err, Err(TollgateError::InvalidPolicy(_))));

            assert_eq!(limiter.policy_for(&a), default_policy());
            assert!(!limiter.check(&a).await.admitted, "{:?}", strategy);
        }
    }

    #[tokio::test]
    async fn test_update_only_affects_target_identity() {
        let (limiter, _clock) = limiter(Strategy::Log, default_policy());
        let a = ClientIdentity::new("A");
        let b = ClientIdentity::new("B");

        decisions(&limiter, &b, 2).await;
        limiter.update_policy(&a, 1, Duration::from_secs(10)).await.unwrap();

        assert_eq!(limiter.policy_for(&b), default_policy());
        assert!(!limiter.check(&b).await.admitted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        for strategy in STRATEGIES {
            let (limiter, _clock) =
                limiter(strategy, Policy::new(10, Duration::from_secs(60)).unwrap());
            let limiter = Arc::new(limiter);
            let a = ClientIdentity::new("A");

            let handles: Vec<_> = (0..100)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    let a = a.clone();
                    tokio::spawn(async move { limiter.check(&a).await.admitted })
                })
                .collect();

            let admitted = futures::future::join_all(handles)
                .await
                .into_iter()
                .map(|joined| joined.unwrap())
                .filter(|admitted| *admitted)
                .count();

            assert_eq!(admitted, 10, "{:?}", strategy);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_and_checks() {
        let (limiter, _clock) = limiter(Strategy::Log, default_policy());
        let limiter = Arc::new(limiter);
        let a = ClientIdentity::new("A");

        let mut handles = Vec::new();
        for i in 0..20u64 {
            let limiter = Arc::clone(&limiter);
            let a = a.clone();
            handles.push(tokio::spawn(async move {
                if i % 5 == 0 {
                    limiter.update_policy(&a, 3, Duration::from_secs(60)).await.unwrap();
                } else {
                    limiter.check(&a).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(limiter.policy_for(&a).limit(), 3);
    }

    #[tokio::test]
    async fn test_fail_closed_rejects() {
        let limiter = failing_limiter(FailureMode::Closed);
        let result = limiter.check(&ClientIdentity::new("A")).await;

        assert!(!result.admitted);
        assert_eq!(result.reason, Reason::BackendError);
    }

    #[tokio::test]
    async fn test_fail_open_admits() {
        let limiter = failing_limiter(FailureMode::Open);
        let result = limiter.check(&ClientIdentity::new("A")).await;

        assert!(result.admitted);
        assert_eq!(result.reason, Reason::BackendError);
    }

    #[tokio::test]
    async fn test_update_with_failing_backend_is_not_applied() {
        let limiter = failing_limiter(FailureMode::Closed);
        let a = ClientIdentity::new("A");

        let err = limiter.update_policy(&a, 9, Duration::from_secs(5)).await;
        assert!(matches!(err, Err(TollgateError::BackendUnavailable(_))));
        assert_eq!(limiter.policy_for(&a), default_policy());
    }

    #[tokio::test]
    async fn test_allow_resolves_peer_ip() {
        let (limiter, _clock) = limiter(Strategy::Log, default_policy());
        let first = RequestInfo::from_peer("10.0.0.1:1000".parse().unwrap());
        let same_ip = RequestInfo::from_peer("10.0.0.1:2000".parse().unwrap());
        let other = RequestInfo::from_peer("10.0.0.2:1000".parse().unwrap());

        assert!(limiter.allow(&first).await.admitted);
        assert!(limiter.allow(&same_ip).await.admitted);
        assert!(!limiter.allow(&first).await.admitted);

        let result = limiter.allow(&other).await;
        assert!(result.admitted);
        assert_eq!(result.identity.as_str(), "10.0.0.2");
    }

    #[tokio::test]
    async fn test_update_default_policy() {
        let (limiter, _clock) = limiter(Strategy::Log, default_policy());
        let a = ClientIdentity::new("A");

        limiter.update_default_policy(4, Duration::from_secs(60)).unwrap();
        assert_eq!(decisions(&limiter, &a, 5).await, vec![true, true, true, true, false]);
        assert!(limiter.update_default_policy(0, Duration::from_secs(60)).is_err());
    }

    #[tokio::test]
    async fn test_sweep_delegates_to_counter() {
        let (limiter, clock) = limiter(Strategy::Log, default_policy());
        limiter.check(&ClientIdentity::new("A")).await;

        assert_eq!(limiter.sweep(), 0);
        clock.advance(Duration::from_secs(61));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.strategy(), "sliding_log");
    }

    #[tokio::test]
    async fn test_sweep_honors_lengthened_default_window() {
        let ten_seconds = Policy::new(1, Duration::from_secs(10)).unwrap();
        let (limiter, clock) = limiter(Strategy::Log, ten_seconds);
        let a = ClientIdentity::new("A");

        assert!(limiter.check(&a).await.admitted);
        limiter.update_default_policy(1, Duration::from_secs(60)).unwrap();

        clock.advance(Duration::from_secs(11));
        assert_eq!(limiter.sweep(), 0);
        assert!(!limiter.check(&a).await.admitted);

        clock.advance(Duration::from_secs(50));
        assert_eq!(limiter.sweep(), 1);
        assert!(limiter.check(&a).await.admitted);
    }

    #[tokio::test]
    async fn test_sweep_honors_override_window() {
        let ten_seconds = Policy::new(1, Duration::from_secs(10)).unwrap();
        let (limiter, clock) = limiter(Strategy::Log, ten_seconds);
        let a = ClientIdentity::new("A");

        limiter.update_policy(&a, 1, Duration::from_secs(60)).await.unwrap();
        assert!(limiter.check(&a).await.admitted);

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.sweep(), 0);
        assert!(!limiter.check(&a).await.admitted);
    }

    #[tokio::test]
    async fn test_audit_sink_sees_both_outcomes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (limiter, _clock) = limiter(Strategy::Log, Policy::new(1, Duration::from_secs(60)).unwrap());
        let limiter = limiter.with_audit_sink(Arc::new(ChannelSink(tx)));
        let a = ClientIdentity::new("A");

        limiter.check(&a).await;
        limiter.check(&a).await;

        let mut outcomes = vec![
            rx.recv().await.unwrap().labels["outcome"].clone(),
            rx.recv().await.unwrap().labels["outcome"].clone(),
        ];
        outcomes.sort();
        assert_eq!(outcomes, vec!["admitted", "rejected"]);
    }
}
