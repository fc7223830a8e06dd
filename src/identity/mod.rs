//! # Client Identity Resolution
//!
//! Derives a trustworthy client IP from the raw connection peer plus an
//! optional forwarding header, given a configured set of trusted proxies.
//!
//! The trust model is asymmetric on purpose: the forwarding header is only
//! believed when the immediate connection peer is one of the configured
//! proxies. A client talking to the service directly can put anything it
//! wants into `X-Forwarded-For`; unless that connection physically arrived
//! through a trusted proxy, the header is ignored and the peer address wins.

use axum::http::HeaderMap;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use crate::core::types::ClientIdentity;

/// Forwarding header consulted when the peer is trusted
pub const FORWARDED_HEADER: &str = "x-forwarded-for";

/// Resolves a client identity per request
#[derive(Debug, Clone)]
pub struct ClientIdentityResolver {
    trusted_proxies: HashSet<IpAddr>,
}

impl ClientIdentityResolver {
    /// Build a resolver from textual proxy addresses
    ///
    /// Entries must have been validated by configuration loading; anything
    /// unparseable here is skipped rather than trusted by accident.
    pub fn new(trusted_proxies: &[String]) -> Self {
        let trusted_proxies = trusted_proxies
            .iter()
            .filter_map(|raw| raw.trim().parse::<IpAddr>().ok())
            .map(normalize_ip)
            .collect();

        Self { trusted_proxies }
    }

    /// Resolve the client identity for a request
    ///
    /// `peer` is the socket address of the immediate connection;
    /// `forwarded` is the raw forwarding header value, if any.
    pub fn resolve(&self, peer: Option<SocketAddr>, forwarded: Option<&str>) -> ClientIdentity {
        let peer_ip = match peer {
            Some(addr) => normalize_ip(addr.ip()),
            None => return ClientIdentity::unknown(),
        };

        if self.trusted_proxies.contains(&peer_ip) {
            if let Some(forwarded) = forwarded {
                // Left-most entry is the original client as reported by the
                // first proxy in the chain.
                if let Some(first) = forwarded.split(',').next() {
                    let candidate = first.trim().trim_start_matches("::ffff:");
                    if let Ok(ip) = candidate.parse::<IpAddr>() {
                        return ClientIdentity {
                            ip: normalize_ip(ip).to_string(),
                            via_trusted_proxy: true,
                        };
                    }
                }
            }
        }

        ClientIdentity {
            ip: peer_ip.to_string(),
            via_trusted_proxy: false,
        }
    }

    /// Resolve from an axum header map plus the connection peer
    pub fn resolve_from_headers(
        &self,
        peer: Option<SocketAddr>,
        headers: &HeaderMap,
    ) -> ClientIdentity {
        let forwarded = headers
            .get(FORWARDED_HEADER)
            .and_then(|value| value.to_str().ok());
        self.resolve(peer, forwarded)
    }
}

/// Strip the IPv4-mapped IPv6 prefix so `::ffff:203.0.113.1` and
/// `203.0.113.1` compare and render identically
fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
