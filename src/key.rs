//! Client key derivation.
//!
//! A [`ClientKey`] names one bucket. Keys are derived from the caller's address, so clients
//! behind one NAT share a bucket.

use http::Request;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Prefix of every bucket key in the shared store.
pub const KEY_PREFIX: &str = "ratelimit:";

/// Bucket key used when a request carries no usable address.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Peer address of the connection a request arrived on.
///
/// Servers insert this into the request extensions before the rate limit layer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Store key of one client's bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn from_ip(ip: IpAddr) -> Self {
        Self(format!("{KEY_PREFIX}{ip}"))
    }

    pub fn unknown() -> Self {
        Self(format!("{KEY_PREFIX}{UNKNOWN_CLIENT}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the bucket key for a request.
pub trait KeyExtractor: Send + Sync + 'static {
    fn extract<B>(&self, req: &Request<B>) -> ClientKey;
}

/// Keys on the peer socket address ([`ClientAddr`] extension).
///
/// Requests without the extension share the `ratelimit:unknown` bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerAddr;

impl KeyExtractor for PeerAddr {
    fn extract<B>(&self, req: &Request<B>) -> ClientKey {
        peer_key(req).unwrap_or_else(ClientKey::unknown)
    }
}

/// Keys on the first `X-Forwarded-For` hop, falling back to the peer address.
///
/// Only sound behind a proxy that overwrites the header; otherwise clients pick their own key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedFor;

impl KeyExtractor for ForwardedFor {
    fn extract<B>(&self, req: &Request<B>) -> ClientKey {
        req.headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok())
            .map(ClientKey::from_ip)
            .or_else(|| peer_key(req))
            .unwrap_or_else(ClientKey::unknown)
    }
}

fn peer_key<B>(req: &Request<B>) -> Option<ClientKey> {
    req.extensions().get::<ClientAddr>().map(|addr| ClientKey::from_ip(normalize(addr.0.ip())))
}

/// IPv4-mapped IPv6 peers (`::ffff:a.b.c.d`) key as their IPv4 address.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
