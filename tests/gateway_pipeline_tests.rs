//! # Gateway Pipeline Integration Tests
//!
//! End-to-end assertions over the assembled router: excluded paths, the
//! hardening header set, CSRF issuance and double-submit validation, threat
//! blocking on bodies and query strings, login rate limiting, oversized
//! payload rejection, and the allow-list gate on privileged routes.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use http_body_util::BodyExt;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tower::ServiceExt;

use security_gateway::{
    allowlist_admin_router, ip_allowlist_gate, AuditEventType, GatewayComponents, GatewayServer,
    PrincipalContext, SecurityConfig,
};

/// Peer address used by most tests; configured as a trusted proxy
const PROXY_ADDR: &str = "10.0.0.5:52100";

/// Client address reported through the forwarding header
const CLIENT_IP: &str = "203.0.113.7";

struct Harness {
    app: Router,
    components: GatewayComponents,
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

async fn harness_with(mutate: impl FnOnce(&mut SecurityConfig)) -> Harness {
    let mut config = SecurityConfig::default();
    config.server.secure_cookies = false;
    config.identity.trusted_proxies = vec!["10.0.0.5".to_string()];
    config.rate_limit.general.limit = 50;
    mutate(&mut config);
    config.validate().expect("test config must validate");

    let components = GatewayComponents::build(&config).await.unwrap();
    let app = build_test_app(&components);
    let app = GatewayServer::new(&config, app, &components)
        .unwrap()
        .into_router();

    Harness { app, components }
}

/// Application router mirroring a real integration: bearer-based demo auth,
/// a privileged subtree behind the allow-list gate, and the management
/// surface outside it
fn build_test_app(components: &GatewayComponents) -> Router {
    let privileged = Router::new()
        .route("/status", get(|| async { Json(json!({ "admin": true })) }))
        .layer(middleware::from_fn_with_state(
            components.gate.clone(),
            ip_allowlist_gate,
        ));

    Router::new()
        .route("/api/data", get(|| async { Json(json!({ "items": [] })) }))
        .route(
            "/api/echo",
            post(|body: String| async move { body }),
        )
        .route("/api/auth/login", post(|| async { Json(json!({ "token": "t" })) }))
        .nest("/api/admin", privileged)
        .nest(
            "/api/security/allowed-ips",
            allowlist_admin_router(components.allowlist.clone()),
        )
        .layer(middleware::from_fn(test_auth))
}

/// Bearer tokens become principal ids, like the demo application
async fn test_auth(mut request: Request, next: Next) -> Response {
    let principal = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    if let Some(principal_id) = principal {
        request
            .extensions_mut()
            .insert(PrincipalContext::new(principal_id));
    }
    next.run(request).await
}

struct RequestSpec {
    method: &'static str,
    uri: String,
    peer: &'static str,
    forwarded: Option<&'static str>,
    bearer: Option<&'static str>,
    cookie: Option<String>,
    csrf_header: Option<String>,
    content_type: Option<&'static str>,
    body: String,
}

impl RequestSpec {
    fn get(uri: &str) -> Self {
        Self::new("GET", uri)
    }

    fn post(uri: &str) -> Self {
        Self::new("POST", uri)
    }

    fn new(method: &'static str, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            peer: PROXY_ADDR,
            forwarded: Some(CLIENT_IP),
            bearer: None,
            cookie: None,
            csrf_header: None,
            content_type: None,
            body: String::new(),
        }
    }

    fn bearer(mut self, token: &'static str) -> Self {
        self.bearer = Some(token);
        self
    }

    fn csrf(mut self, token: &str) -> Self {
        self.cookie = Some(format!("csrf_token={}", token));
        self.csrf_header = Some(token.to_string());
        self
    }

    fn body(mut self, content_type: &'static str, body: &str) -> Self {
        self.content_type = Some(content_type);
        self.body = body.to_string();
        self
    }

    fn build(self) -> Request<Body> {
        let mut builder = Request::builder().method(self.method).uri(self.uri.as_str());
        if let Some(forwarded) = self.forwarded {
            builder = builder.header("x-forwarded-for", forwarded);
        }
        if let Some(token) = self.bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(cookie) = &self.cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        if let Some(csrf) = &self.csrf_header {
            builder = builder.header("x-csrf-token", csrf);
        }
        if let Some(content_type) = self.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }

        let mut request = builder.body(Body::from(self.body)).unwrap();
        let peer: SocketAddr = self.peer.parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    }
}

/// Pull the issued CSRF token value out of a Set-Cookie header
fn issued_csrf_token(response: &Response) -> Option<String> {
    let set_cookie = response.headers().get(header::SET_COOKIE)?.to_str().ok()?;
    let pair = set_cookie.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    (name == "csrf_token").then(|| value.to_string())
}

/// Wait for the audit writer task to drain an expected event
async fn wait_for_audit(
    components: &GatewayComponents,
    event_type: AuditEventType,
) -> Vec<security_gateway::audit::AuditEvent> {
    let audit = components.audit.as_ref().expect("audit plane enabled");
    for _ in 0..50 {
        let events = audit.recent_by_type(event_type, 10).await;
        if !events.is_empty() {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {:?} audit event", event_type);
}

// ============================================================================
// Excluded paths and hardening headers
// ============================================================================

#[tokio::test]
async fn excluded_path_bypasses_the_pipeline() {
    let harness = harness().await;

    let response = harness
        .app
        .oneshot(RequestSpec::get("/health").build())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    // Untouched: no hardening or rate-limit headers on excluded paths
    assert!(!response.headers().contains_key("x-frame-options"));
    assert!(!response.headers().contains_key("x-ratelimit-limit"));
}

#[tokio::test]
async fn gated_response_carries_hardening_and_rate_limit_headers() {
    let harness = harness().await;

    let response = harness
        .app
        .oneshot(RequestSpec::get("/api/data").build())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert_eq!(response.headers()["x-frame-options"], "DENY");
    assert_eq!(
        response.headers()["referrer-policy"],
        "strict-origin-when-cross-origin"
    );
    assert!(response.headers().contains_key("permissions-policy"));
    assert_eq!(response.headers()["x-ratelimit-limit"], "50");
    assert!(response.headers().contains_key("x-ratelimit-remaining"));
}

// ============================================================================
// CSRF
// ============================================================================

#[tokio::test]
async fn state_changing_request_without_token_is_rejected() {
    let harness = harness().await;

    let response = harness
        .app
        .oneshot(
            RequestSpec::post("/api/echo")
                .body("text/plain", "hello")
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    // The rejection carries a fresh token so the client can retry
    assert!(issued_csrf_token(&response).is_some());

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["type"], "security_rejection");
}

#[tokio::test]
async fn valid_double_submit_token_passes() {
    let harness = harness().await;

    // First a safe request obtains the token
    let response = harness
        .app
        .clone()
        .oneshot(RequestSpec::get("/api/data").build())
        .await
        .unwrap();
    let token = issued_csrf_token(&response).expect("safe response must issue a token");

    // Then the state-changing request echoes it in cookie and header
    let response = harness
        .app
        .oneshot(
            RequestSpec::post("/api/echo")
                .csrf(&token)
                .body("text/plain", "hello")
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello");
}

#[tokio::test]
async fn bearer_requests_are_csrf_exempt() {
    let harness = harness().await;

    let response = harness
        .app
        .oneshot(
            RequestSpec::post("/api/echo")
                .bearer("user-1")
                .body("text/plain", "hello")
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn csrf_rejection_is_audited() {
    let harness = harness().await;

    harness
        .app
        .oneshot(
            RequestSpec::post("/api/echo")
                .body("text/plain", "hello")
                .build(),
        )
        .await
        .unwrap();

    let events = wait_for_audit(&harness.components, AuditEventType::CsrfRejected).await;
    assert_eq!(events[0].actor_ip, CLIENT_IP);
    assert_eq!(events[0].path, "/api/echo");
}

// ============================================================================
// Threat scanning
// ============================================================================

#[tokio::test]
async fn xss_body_is_blocked_and_audited() {
    let harness = harness().await;

    let response = harness
        .app
        .oneshot(
            RequestSpec::post("/api/echo")
                .bearer("user-1")
                .body("application/json", r#"{"bio":"<script>alert(1)</script>"}"#)
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let events = wait_for_audit(&harness.components, AuditEventType::XssAttempt).await;
    assert_eq!(events[0].actor_ip, CLIENT_IP);
}

#[tokio::test]
async fn sql_injection_in_query_is_blocked() {
    let harness = harness().await;

    let response = harness
        .app
        .oneshot(
            RequestSpec::get("/api/data?q=%27%3B%20DROP%20TABLE%20users%3B%20--").build(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    wait_for_audit(&harness.components, AuditEventType::SqlInjectionAttempt).await;
}

#[tokio::test]
async fn benign_traffic_is_not_blocked() {
    let harness = harness().await;

    let response = harness
        .app
        .oneshot(
            RequestSpec::post("/api/echo")
                .bearer("user-1")
                .body("application/json", r#"{"note":"hello world"}"#)
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn login_category_blocks_the_second_attempt() {
    let harness = harness().await;

    let first = harness
        .app
        .clone()
        .oneshot(RequestSpec::post("/api/auth/login").bearer("u").build())
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = harness
        .app
        .oneshot(RequestSpec::post("/api/auth/login").bearer("u").build())
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));
    assert_eq!(second.headers()["x-ratelimit-remaining"], "0");

    wait_for_audit(&harness.components, AuditEventType::RateLimitExceeded).await;
}

#[tokio::test]
async fn login_limit_is_per_identity() {
    let harness = harness().await;

    let mut first = RequestSpec::post("/api/auth/login").bearer("u");
    first.forwarded = Some("203.0.113.7");
    let response = harness.app.clone().oneshot(first.build()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A different client identity gets its own window
    let mut second = RequestSpec::post("/api/auth/login").bearer("u");
    second.forwarded = Some("198.51.100.20");
    let response = harness.app.oneshot(second.build()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// Oversized payloads
// ============================================================================

#[tokio::test]
async fn oversized_body_is_rejected() {
    let harness = harness_with(|config| {
        config.server.max_body_size = 256;
    })
    .await;

    let response = harness
        .app
        .oneshot(
            RequestSpec::post("/api/echo")
                .bearer("user-1")
                .body("text/plain", &"x".repeat(1024))
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// ============================================================================
// Allow-list gate
// ============================================================================

#[tokio::test]
async fn privileged_route_denied_without_allowlist_entry() {
    let harness = harness().await;

    let response = harness
        .app
        .oneshot(
            RequestSpec::get("/api/admin/status")
                .bearer("admin-1")
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let events = wait_for_audit(&harness.components, AuditEventType::AccessDenied).await;
    assert_eq!(events[0].actor_ip, CLIENT_IP);
}

#[tokio::test]
async fn privileged_route_allowed_after_adding_entry() {
    let harness = harness().await;

    harness
        .components
        .allowlist
        .add("admin-1", CLIENT_IP, Some("test".to_string()))
        .await
        .unwrap();

    let response = harness
        .app
        .oneshot(
            RequestSpec::get("/api/admin/status")
                .bearer("admin-1")
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    // The hit updated last-used tracking
    let stats = harness.components.allowlist.stats("admin-1").await;
    assert_eq!(stats.recently_used, 1);
}

#[tokio::test]
async fn privileged_route_without_principal_is_a_hard_failure() {
    let harness = harness().await;

    let response = harness
        .app
        .oneshot(RequestSpec::get("/api/admin/status").build())
        .await
        .unwrap();

    // Misconfigured pipeline ordering, not a user error
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    wait_for_audit(&harness.components, AuditEventType::SystemError).await;
}

#[tokio::test]
async fn allowlist_entry_owned_by_other_principal_does_not_open_the_gate() {
    let harness = harness().await;

    harness
        .components
        .allowlist
        .add("someone-else", CLIENT_IP, None)
        .await
        .unwrap();

    let response = harness
        .app
        .oneshot(
            RequestSpec::get("/api/admin/status")
                .bearer("admin-1")
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// ============================================================================
// Management surface through the full stack
// ============================================================================

#[tokio::test]
async fn management_surface_round_trip() {
    let harness = harness().await;

    let response = harness
        .app
        .clone()
        .oneshot(
            RequestSpec::post("/api/security/allowed-ips")
                .bearer("user-1")
                .body(
                    "application/json",
                    r#"{"ip_address":"198.51.100.10","description":"vpn"}"#,
                )
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = harness
        .app
        .clone()
        .oneshot(
            RequestSpec::get("/api/security/allowed-ips")
                .bearer("user-1")
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let entries: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["ip_address"], "198.51.100.10");

    // Validation errors surface with their specific message
    let response = harness
        .app
        .oneshot(
            RequestSpec::post("/api/security/allowed-ips")
                .bearer("user-1")
                .body("application/json", r#"{"ip_address":"127.0.0.1"}"#)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(parsed["error"]["message"]
        .as_str()
        .unwrap()
        .contains("loopback"));
}

// ============================================================================
// Identity resolution through the stack
// ============================================================================

#[tokio::test]
async fn forwarding_header_ignored_from_untrusted_peer() {
    let harness = harness().await;

    // Peer is not the configured trusted proxy; the spoofed header must not
    // become the audited actor identity
    let mut spec = RequestSpec::post("/api/echo").body("text/plain", "x");
    spec.peer = "192.0.2.44:40000";
    spec.forwarded = Some("203.0.113.7");

    harness.app.oneshot(spec.build()).await.unwrap();

    let events = wait_for_audit(&harness.components, AuditEventType::CsrfRejected).await;
    assert_eq!(events[0].actor_ip, "192.0.2.44");
}
