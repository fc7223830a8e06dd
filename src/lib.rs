//! # Security Gateway Library
//!
//! A request-security gateway that sits in front of an HTTP service and
//! enforces access-control invariants under concurrency and partial-failure
//! conditions. Four protection planes run per request (client-identity
//! resolution through untrusted proxies, fixed-window rate limiting,
//! double-submit CSRF protection, and payload threat scanning), backed by a
//! persistent per-principal IP allow-list and structured security audit
//! logging.
//!
//! The pipeline fails closed on internal faults (an unexpected error becomes
//! a generic rejection) and fails open per plane on missing optional
//! collaborators (a plane that did not come up is skipped with a warning
//! instead of blocking all traffic).

/// Core functionality: error types, configuration, and shared data structures
pub mod core;

/// Client identity resolution through trusted proxies
pub mod identity;

/// Fixed-window rate limiting with a shared counter store and in-memory fallback
pub mod rate_limit;

/// Double-submit CSRF token issuance and validation
pub mod csrf;

/// Pattern-based threat scanning of bodies and query strings
pub mod threat;

/// Per-principal IP allow-listing: validation, store, and privileged-route gate
pub mod allowlist;

/// Best-effort structured security audit logging
pub mod audit;

/// Pipeline orchestration and server assembly
pub mod gateway;

// Re-export the types most integrations need, so `use security_gateway::...`
// works without knowing the module tree.

pub use crate::core::config::SecurityConfig;
pub use crate::core::error::{SecurityError, SecurityResult};
pub use crate::core::types::{ClientIdentity, PrincipalContext, RateLimitCategory, ThreatKind};

pub use allowlist::{ip_allowlist_gate, AllowedIpEntry, AllowedIpStore, IpAllowlistGate};
pub use audit::{AuditEventType, AuditLog};
pub use csrf::CsrfTokenService;
pub use gateway::{
    allowlist_admin_router, security_gateway_middleware, GatewayComponents, GatewayServer,
    SecurityGateway,
};
pub use identity::ClientIdentityResolver;
pub use rate_limit::RateLimiter;
pub use threat::ThreatScanner;
