//! Client identity derivation.

use axum::http::HeaderMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Header consulted when forwarded addresses are trusted.
const FORWARDED_FOR: &str = "x-forwarded-for";

/// Identity used when a request carries no usable address.
const UNKNOWN_CLIENT: &str = "unknown";

/// The key that partitions all rate limit state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Create an identity from any string key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for ClientIdentity {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The parts of an inbound request an identity can be derived from.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Socket address of the connected peer, if known
    pub peer: Option<SocketAddr>,
    /// Request headers
    pub headers: HeaderMap,
}

impl RequestInfo {
    /// Request info for a bare peer address.
    pub fn from_peer(peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            headers: HeaderMap::new(),
        }
    }
}

/// Derives a stable identity from a request.
pub trait ClientKeyResolver: Send + Sync {
    fn resolve(&self, request: &RequestInfo) -> ClientIdentity;
}

/// Resolves the identity to the client's IP address.
///
/// When `trust_forwarded_for` is set, the first entry of `X-Forwarded-For`
/// takes precedence over the socket peer. Only enable this behind a proxy that
/// overwrites the header.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpKeyResolver {
    trust_forwarded_for: bool,
}

impl IpKeyResolver {
    /// Resolver that only looks at the socket peer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver that prefers `X-Forwarded-For`.
    pub fn trusting_forwarded_for() -> Self {
        Self {
            trust_forwarded_for: true,
        }
    }

    fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
        let value = headers.get(FORWARDED_FOR)?.to_str().ok()?;
        value.split(',').next()?.trim().parse().ok()
    }
}

impl ClientKeyResolver for IpKeyResolver {
    fn resolve(&self, request: &RequestInfo) -> ClientIdentity {
        if self.trust_forwarded_for {
            if let Some(ip) = Self::forwarded_ip(&request.headers) {
                return ip.into();
            }
        }

        request
            .peer
            .map(|addr| ClientIdentity::from(addr.ip()))
            .unwrap_or_else(|| ClientIdentity::new(UNKNOWN_CLIENT))
    }
}
