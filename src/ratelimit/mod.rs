//! Rate limiting logic and state management.

mod backend;
mod fixed;
mod identity;
mod limiter;
mod policy;
mod sliding;

pub use backend::WindowCounter;
pub use fixed::{FixedWindowCounter, DEFAULT_BACKEND_TIMEOUT, DEFAULT_KEY_PREFIX};
pub use identity::{ClientIdentity, ClientKeyResolver, IpKeyResolver, RequestInfo};
pub use limiter::{AllowResult, FailureMode, RateLimiter, Reason};
pub use policy::{
    LimitPolicyStore, OverrideRule, Policy, PolicyLease, PolicyOverrides, MAX_WINDOW,
};
pub use sliding::SlidingLogCounter;
