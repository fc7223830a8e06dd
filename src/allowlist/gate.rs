//! # IP Allow-list Gate
//!
//! Second, narrower middleware gating privileged routes once a principal is
//! authenticated. Runs after the application's auth layer: the principal
//! marker must already be in request extensions.
//!
//! Auth endpoints under a privileged prefix are exempt, since a principal
//! cannot be allow-list-gated before they have a way to authenticate. A
//! missing principal on any other gated path is treated as a fatal pipeline
//! misconfiguration, not an ordinary unauthorized request.
//!
//! Client identity uses the same proxy-gated resolver as the main pipeline.
//! Trusting the forwarding header outright here would let any direct client
//! spoof its way past the allow-list, so the looser behavior is deliberately
//! not offered.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::allowlist::store::AllowedIpStore;
use crate::audit::{AuditContext, AuditEventType, AuditLog};
use crate::core::config::{path_matches, AllowlistConfig};
use crate::core::error::SecurityError;
use crate::core::types::{ClientIdentity, PrincipalContext};
use crate::identity::ClientIdentityResolver;

/// Gate configuration and collaborators
pub struct IpAllowlistGate {
    store: Arc<AllowedIpStore>,
    resolver: Arc<ClientIdentityResolver>,
    audit: Option<Arc<AuditLog>>,
    privileged_prefixes: Vec<String>,
    auth_exemptions: Vec<String>,
}

impl IpAllowlistGate {
    pub fn new(
        config: &AllowlistConfig,
        store: Arc<AllowedIpStore>,
        resolver: Arc<ClientIdentityResolver>,
        audit: Option<Arc<AuditLog>>,
    ) -> Self {
        Self {
            store,
            resolver,
            audit,
            privileged_prefixes: config.privileged_prefixes.clone(),
            auth_exemptions: config.auth_exemptions.clone(),
        }
    }

    /// Does this path fall under a privileged prefix?
    fn applies_to(&self, path: &str) -> bool {
        self.privileged_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Is this path an exempt auth endpoint?
    fn is_exempt(&self, path: &str) -> bool {
        self.auth_exemptions
            .iter()
            .any(|pattern| path_matches(path, pattern))
    }

    fn audit(&self, event_type: AuditEventType, context: &AuditContext, metadata: serde_json::Value) {
        if let Some(audit) = &self.audit {
            audit.record(event_type, context, metadata);
        }
    }
}

/// Axum middleware enforcing the allow-list on privileged routes
pub async fn ip_allowlist_gate(
    State(gate): State<Arc<IpAllowlistGate>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Result<Response, SecurityError> {
    let path = request.uri().path().to_string();

    if !gate.applies_to(&path) || gate.is_exempt(&path) {
        return Ok(next.run(request).await);
    }

    let method = request.method().to_string();

    // The identity resolved by the gateway pipeline is reused when present;
    // a gate mounted standalone resolves with the same proxy-gated rules.
    let identity = match request.extensions().get::<ClientIdentity>() {
        Some(identity) => identity.clone(),
        None => gate
            .resolver
            .resolve_from_headers(connect_info.map(|ci| ci.0), request.headers()),
    };

    let principal = match request.extensions().get::<PrincipalContext>() {
        Some(principal) => principal.clone(),
        None => {
            // The gate ran before authentication: a wiring bug, not a user
            // error. Failing hard keeps the misconfiguration from silently
            // waving privileged traffic through.
            error!(
                path = %path,
                "Allow-list gate reached without an authenticated principal"
            );
            let context = AuditContext::new(identity.ip.clone(), path, method);
            gate.audit(
                AuditEventType::SystemError,
                &context,
                json!({ "reason": "allow-list gate reached without principal" }),
            );
            return Err(SecurityError::internal(
                "allow-list gate requires an authenticated principal",
            ));
        }
    };

    if gate
        .store
        .is_allowed(&principal.principal_id, &identity.ip)
        .await
    {
        debug!(
            principal = %principal.principal_id,
            ip = %identity.ip,
            "Allow-list check passed"
        );
        return Ok(next.run(request).await);
    }

    warn!(
        principal = %principal.principal_id,
        ip = %identity.ip,
        path = %path,
        "Request blocked: IP not on the principal's allow-list"
    );
    let context = AuditContext::new(identity.ip.clone(), path, method);
    gate.audit(
        AuditEventType::AccessDenied,
        &context,
        json!({
            "principal_id": principal.principal_id,
            "via_trusted_proxy": identity.via_trusted_proxy,
        }),
    );

    Err(SecurityError::access_denied(format!(
        "IP address {} is not on the allow-list for this account",
        identity.ip
    )))
}
