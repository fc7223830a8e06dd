//! # Security Gateway Pipeline
//!
//! The per-request state machine that composes every protection plane.
//! States execute in strict order with short-circuit on rejection:
//!
//! ```text
//! ExcludedPath? -> (yes: PASS untouched)
//! ResolveIdentity -> RateLimit -> SizeCheck -> ScanBody/Query
//!   -> CSRF (state-changing, no bearer) -> SuspiciousRequest? (audit only)
//!   -> forward to the application router
//! ```
//!
//! Every plane except identity resolution is optional. Missing planes are
//! registered at startup and skipped with a warning rather than branching on
//! nullability at each call site: fail open per plane, by explicit choice.
//! An unexpected internal error anywhere in the chain is audited as a system
//! error and converted to a generic rejection: fail closed on faults.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use regex::Regex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{AuditContext, AuditEventType, AuditLog};
use crate::core::config::{path_matches, SecurityConfig};
use crate::core::error::SecurityError;
use crate::core::types::{ClientIdentity, RateLimitCategory, ThreatKind, ThreatSignal};
use crate::csrf::CsrfTokenService;
use crate::gateway::headers::{apply_hardening_headers, apply_rate_limit_headers};
use crate::identity::ClientIdentityResolver;
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::threat::ThreatScanner;

/// User-agents belonging to well-known scanning tools
static SCANNER_AGENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(sqlmap|nikto|nessus|masscan|zgrab|dirbuster|gobuster|wpscan|acunetix|nuclei)")
        .expect("invalid scanner agent pattern")
});

/// Paths probed by automated exploit kits, worth flagging even when the
/// request is otherwise harmless
const SUSPICIOUS_PATHS: &[&str] = &[
    "/.env",
    "/.git",
    "/.aws",
    "/wp-admin",
    "/wp-login.php",
    "/phpmyadmin",
    "/config.php",
    "/server-status",
];

/// Orchestrator composing the protection planes per request
pub struct SecurityGateway {
    resolver: Arc<ClientIdentityResolver>,
    rate_limiter: Option<Arc<RateLimiter>>,
    csrf: Option<Arc<CsrfTokenService>>,
    scanner: Option<Arc<ThreatScanner>>,
    audit: Option<Arc<AuditLog>>,
    excluded_paths: Vec<String>,
    login_paths: Vec<String>,
    max_body_size: usize,
}

impl SecurityGateway {
    /// Start registering capabilities for a gateway
    pub fn builder(config: &SecurityConfig) -> SecurityGatewayBuilder {
        SecurityGatewayBuilder {
            resolver: Arc::new(ClientIdentityResolver::new(&config.identity.trusted_proxies)),
            rate_limiter: None,
            csrf: None,
            scanner: None,
            audit: None,
            excluded_paths: config.effective_excluded_paths(),
            login_paths: config.rate_limit.login_paths.clone(),
            max_body_size: config.server.max_body_size,
        }
    }

    /// Shared identity resolver, reused by the allow-list gate
    pub fn resolver(&self) -> Arc<ClientIdentityResolver> {
        self.resolver.clone()
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths
            .iter()
            .any(|pattern| path_matches(path, pattern))
    }

    fn is_login_path(&self, path: &str) -> bool {
        self.login_paths
            .iter()
            .any(|pattern| path_matches(path, pattern))
    }

    fn audit(&self, event_type: AuditEventType, context: &AuditContext, metadata: serde_json::Value) {
        if let Some(audit) = &self.audit {
            audit.record(event_type, context, metadata);
        }
    }

    /// Attach the headers every gated response carries
    fn finalize(&self, mut response: Response, decision: Option<&RateLimitDecision>) -> Response {
        apply_hardening_headers(response.headers_mut());
        if let Some(decision) = decision {
            apply_rate_limit_headers(response.headers_mut(), decision);
        }
        response
    }
}

/// Capability registration for the gateway
///
/// Each protection plane is registered here once at startup; a plane that is
/// absent (disabled, or its backing service failed to come up) is skipped
/// for the lifetime of the process with a single warning instead of
/// scattered null checks.
pub struct SecurityGatewayBuilder {
    resolver: Arc<ClientIdentityResolver>,
    rate_limiter: Option<Arc<RateLimiter>>,
    csrf: Option<Arc<CsrfTokenService>>,
    scanner: Option<Arc<ThreatScanner>>,
    audit: Option<Arc<AuditLog>>,
    excluded_paths: Vec<String>,
    login_paths: Vec<String>,
    max_body_size: usize,
}

impl SecurityGatewayBuilder {
    pub fn rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn csrf(mut self, csrf: Option<Arc<CsrfTokenService>>) -> Self {
        self.csrf = csrf;
        self
    }

    pub fn scanner(mut self, scanner: Option<Arc<ThreatScanner>>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn audit(mut self, audit: Option<Arc<AuditLog>>) -> Self {
        self.audit = audit;
        self
    }

    pub fn build(self) -> SecurityGateway {
        for (plane, present) in [
            ("rate limiting", self.rate_limiter.is_some()),
            ("CSRF protection", self.csrf.is_some()),
            ("threat scanning", self.scanner.is_some()),
            ("audit logging", self.audit.is_some()),
        ] {
            if !present {
                warn!(
                    plane,
                    "Protection plane not registered; requests will pass without it"
                );
            }
        }

        SecurityGateway {
            resolver: self.resolver,
            rate_limiter: self.rate_limiter,
            csrf: self.csrf,
            scanner: self.scanner,
            audit: self.audit,
            excluded_paths: self.excluded_paths,
            login_paths: self.login_paths,
            max_body_size: self.max_body_size,
        }
    }
}

/// Axum middleware entry point for the security pipeline
pub async fn security_gateway_middleware(
    State(gateway): State<Arc<SecurityGateway>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    // Health checks and static assets bypass the pipeline entirely
    if gateway.is_excluded(&path) {
        return next.run(request).await;
    }

    let identity = gateway
        .resolver
        .resolve_from_headers(connect_info.map(|ci| ci.0), request.headers());
    let context = AuditContext::new(identity.ip.clone(), path, request.method().to_string());

    match handle(&gateway, identity, &context, request, next).await {
        Ok(response) => response,
        Err(err) => {
            // Fail closed: the real cause goes to the audit log, the caller
            // gets the uniform rejection.
            warn!(error = %err, path = %context.path, "Pipeline fault, failing closed");
            gateway.audit(
                AuditEventType::SystemError,
                &context,
                json!({ "error": err.to_string() }),
            );
            gateway.finalize(SecurityError::fail_closed_response(), None)
        }
    }
}

/// The ordered pipeline states; `Err` means an unexpected internal fault
async fn handle(
    gateway: &SecurityGateway,
    identity: ClientIdentity,
    context: &AuditContext,
    mut request: Request,
    next: Next,
) -> Result<Response, SecurityError> {
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let path = context.path.clone();

    // Snapshot what later stages need before the request is moved
    let headers = request.headers().clone();
    let has_bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Bearer "))
        .unwrap_or(false);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let query = request.uri().query().unwrap_or("").to_string();

    request.extensions_mut().insert(identity.clone());

    // --- Rate limiting ---------------------------------------------------
    let mut decision = None;
    if let Some(limiter) = &gateway.rate_limiter {
        let category = if gateway.is_login_path(&path) {
            RateLimitCategory::Login
        } else {
            RateLimitCategory::General
        };

        let checked = limiter.check(&identity.ip, category).await;
        if checked.blocked {
            gateway.audit(
                AuditEventType::RateLimitExceeded,
                context,
                json!({
                    "request_id": request_id,
                    "category": category.as_str(),
                    "limit": checked.limit,
                    "degraded": checked.degraded,
                }),
            );
            let retry_after = checked.retry_after.unwrap_or_default();
            let response = SecurityError::RateLimited { retry_after }.into_response();
            return Ok(gateway.finalize(response, Some(&checked)));
        }
        decision = Some(checked);
    }

    // --- Header validation: declared body size --------------------------
    let declared_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_length.is_some_and(|len| len > gateway.max_body_size) {
        let response = SecurityError::OversizedPayload {
            max_bytes: gateway.max_body_size,
        }
        .into_response();
        return Ok(gateway.finalize(response, decision.as_ref()));
    }

    // --- Body buffering --------------------------------------------------
    // The body is needed both for scanning and for form-encoded CSRF
    // tokens; it is read once, bounded, and handed back to the router.
    let state_changing = is_state_changing(&method);
    let needs_body =
        gateway.scanner.is_some() || (gateway.csrf.is_some() && state_changing && !has_bearer);

    let mut body_text = None;
    if needs_body {
        let (parts, body) = request.into_parts();
        let bytes = match axum::body::to_bytes(body, gateway.max_body_size).await {
            Ok(bytes) => bytes,
            Err(_) => {
                // Streaming bodies larger than the cap land here
                let response = SecurityError::OversizedPayload {
                    max_bytes: gateway.max_body_size,
                }
                .into_response();
                return Ok(gateway.finalize(response, decision.as_ref()));
            }
        };
        body_text = Some(String::from_utf8_lossy(&bytes).into_owned());
        request = Request::from_parts(parts, Body::from(bytes));
    }

    // --- Threat scanning -------------------------------------------------
    if let Some(scanner) = &gateway.scanner {
        let mut findings: Vec<(&'static str, ThreatSignal)> = Vec::new();
        for signal in scanner.scan_query(&query) {
            findings.push(("query", signal));
        }
        if let Some(body) = &body_text {
            for signal in scanner.scan(body) {
                findings.push(("body", signal));
            }
        }

        if let Some((surface, first)) = findings.first().cloned() {
            let patterns: Vec<&str> = findings.iter().map(|(_, s)| s.matched_pattern).collect();
            gateway.audit(
                threat_event_type(first.kind),
                context,
                json!({
                    "request_id": request_id,
                    "surface": surface,
                    "patterns": patterns,
                }),
            );
            let response = SecurityError::ThreatDetected { kind: first.kind }.into_response();
            return Ok(gateway.finalize(response, decision.as_ref()));
        }
    }

    // --- CSRF ------------------------------------------------------------
    // Safe methods never need a token; bearer-authenticated requests are
    // exempt because the credential cannot be attached cross-site.
    if state_changing && !has_bearer {
        if let Some(csrf) = &gateway.csrf {
            let session_id = csrf.session_id(&headers);
            let cookie_value = csrf.cookie_token(&headers);
            let form_body = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .filter(|ct| ct.starts_with("application/x-www-form-urlencoded"))
                .and_then(|_| body_text.as_deref());
            let submitted = csrf.extract_token(&headers, form_body);

            let validation = csrf.validate_request(
                &session_id,
                cookie_value.as_deref(),
                submitted.as_deref(),
            );
            if !validation.valid {
                let reason = validation
                    .error
                    .unwrap_or_else(|| "invalid token".to_string());
                gateway.audit(
                    AuditEventType::CsrfRejected,
                    context,
                    json!({ "request_id": request_id, "reason": reason }),
                );

                // A fresh token rides along so the client can recover with a
                // single retry.
                let replacement = csrf.current_or_generate(&session_id);
                let mut response = SecurityError::csrf(reason).into_response();
                if let Ok(cookie) = csrf.build_cookie(&replacement).parse() {
                    response.headers_mut().append(header::SET_COOKIE, cookie);
                }
                return Ok(gateway.finalize(response, decision.as_ref()));
            }
        }
    }

    // --- Suspicious request heuristics (audit only, non-blocking) --------
    if SCANNER_AGENTS.is_match(&user_agent) {
        gateway.audit(
            AuditEventType::SuspiciousActivity,
            context,
            json!({ "request_id": request_id, "reason": "scanner user-agent", "user_agent": user_agent }),
        );
    } else if SUSPICIOUS_PATHS.iter().any(|probe| path.starts_with(probe)) {
        gateway.audit(
            AuditEventType::SuspiciousActivity,
            context,
            json!({ "request_id": request_id, "reason": "suspicious path" }),
        );
    }

    debug!(
        request_id = %request_id,
        ip = %identity.ip,
        via_proxy = identity.via_trusted_proxy,
        path = %path,
        "Request passed security pipeline"
    );

    // --- Forward to the application router -------------------------------
    let mut response = next.run(request).await;

    // Safe responses deliver the CSRF cookie for sessions without one, so
    // the first state-changing request already has a token to echo.
    if !state_changing {
        if let Some(csrf) = &gateway.csrf {
            let session_id = csrf.session_id(&headers);
            let cookie_is_live = csrf
                .cookie_token(&headers)
                .map(|value| csrf.validate_token(&session_id, &value).valid)
                .unwrap_or(false);
            if !cookie_is_live {
                let token = csrf.current_or_generate(&session_id);
                if let Ok(cookie) = csrf.build_cookie(&token).parse() {
                    response.headers_mut().append(header::SET_COOKIE, cookie);
                }
            }
        }
    }

    Ok(gateway.finalize(response, decision.as_ref()))
}

fn is_state_changing(method: &Method) -> bool {
    *method == Method::POST
        || *method == Method::PUT
        || *method == Method::PATCH
        || *method == Method::DELETE
}

fn threat_event_type(kind: ThreatKind) -> AuditEventType {
    match kind {
        ThreatKind::Sqli => AuditEventType::SqlInjectionAttempt,
        ThreatKind::Xss => AuditEventType::XssAttempt,
        ThreatKind::PathTraversal => AuditEventType::SuspiciousActivity,
    }
}
