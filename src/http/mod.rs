//! HTTP surface for the rate limiter.

mod handlers;
mod server;

pub use handlers::{router, LimitForm};
pub use server::HttpServer;
