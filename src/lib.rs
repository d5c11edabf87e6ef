//! Tollgate - Per-Client Admission Control
//!
//! This crate throttles inbound HTTP requests per client identity. Decisions
//! come from one of two interchangeable window counters: an in-process
//! sliding window log, or a fixed window counter kept in a shared store
//! (Redis) so several instances enforce one limit together.

pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
