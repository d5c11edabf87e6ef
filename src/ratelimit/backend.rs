//! Window counter trait for abstracting in-process and store-backed strategies.

use async_trait::async_trait;

use super::identity::ClientIdentity;
use super::policy::{LimitPolicyStore, Policy};
use crate::error::Result;

/// Tracks request occurrences per identity and decides admission.
///
/// Implementations record an admission only when they grant it; a rejected
/// request never consumes a slot.
#[async_trait]
pub trait WindowCounter: Send + Sync {
    /// Decide whether one more request fits the policy, recording it if so.
    async fn evaluate(&self, identity: &ClientIdentity, policy: &Policy) -> Result<bool>;

    /// Forget all window state for the identity.
    async fn reset(&self, identity: &ClientIdentity) -> Result<()>;

    /// Drop state that can no longer affect a decision under the policies
    /// currently in `policies`. Returns how many entries were removed.
    fn sweep(&self, _policies: &LimitPolicyStore) -> usize {
        0
    }

    /// Short name used in logs.
    fn strategy(&self) -> &'static str;
}
