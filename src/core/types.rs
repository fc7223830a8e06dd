//! # Core Types Module
//!
//! Foundational data structures shared across the protection planes: the
//! resolved client identity, threat signals produced by the scanner, rate
//! limit categories, and the authenticated-principal marker the surrounding
//! application installs before the allow-list gate runs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A trustworthy client identity derived per request
///
/// Produced by the identity resolver from the connection peer address and,
/// when the peer is a configured trusted proxy, the forwarding header.
/// Never persisted; the `ip` field is a normalized textual IPv4/IPv6 address
/// with any IPv4-mapped IPv6 prefix stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Normalized client IP address, or the literal `"unknown"`
    pub ip: String,

    /// Whether the address came from a forwarding header vouched for by a
    /// trusted proxy
    pub via_trusted_proxy: bool,
}

impl ClientIdentity {
    /// Identity used when no address can be determined at all
    pub fn unknown() -> Self {
        Self {
            ip: "unknown".to_string(),
            via_trusted_proxy: false,
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ip)
    }
}

/// Classes of threat the scanner can detect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatKind {
    /// SQL injection signature
    Sqli,
    /// Cross-site scripting signature
    Xss,
    /// Path traversal sequence
    PathTraversal,
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreatKind::Sqli => write!(f, "sql-injection"),
            ThreatKind::Xss => write!(f, "xss"),
            ThreatKind::PathTraversal => write!(f, "path-traversal"),
        }
    }
}

/// A single scanner match, consumed immediately by the gateway
///
/// `matched_pattern` names the signature that fired, not the raw input, so a
/// signal can be audited without echoing attacker-controlled bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreatSignal {
    pub kind: ThreatKind,
    pub matched_pattern: &'static str,
}

/// Rate limiting categories with independent limits and windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitCategory {
    /// Credential-guessing surface: tight limit
    Login,
    /// Everything else
    General,
}

impl RateLimitCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitCategory::Login => "login",
            RateLimitCategory::General => "general",
        }
    }
}

impl fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Authenticated-principal marker installed by the application's auth layer
///
/// The gateway never authenticates anyone itself; it consumes this marker
/// from request extensions. The allow-list gate treats its absence on a
/// privileged path as a fatal pipeline-ordering misconfiguration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    /// Unique principal identifier from the surrounding auth system
    pub principal_id: String,
}

impl PrincipalContext {
    pub fn new<S: Into<String>>(principal_id: S) -> Self {
        Self {
            principal_id: principal_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_identity() {
        let identity = ClientIdentity::unknown();
        assert_eq!(identity.ip, "unknown");
        assert!(!identity.via_trusted_proxy);
    }

    #[test]
    fn test_threat_kind_display() {
        assert_eq!(ThreatKind::Sqli.to_string(), "sql-injection");
        assert_eq!(ThreatKind::Xss.to_string(), "xss");
        assert_eq!(ThreatKind::PathTraversal.to_string(), "path-traversal");
    }

    #[test]
    fn test_category_keys_are_stable() {
        assert_eq!(RateLimitCategory::Login.as_str(), "login");
        assert_eq!(RateLimitCategory::General.as_str(), "general");
    }
}
