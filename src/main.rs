//! # Security Gateway - Main Entry Point
//!
//! Starts the security gateway in front of a small demonstration
//! application. The gateway owns the protection pipeline; the application
//! supplies routes, its own authentication layer, and decides where the
//! allow-list gate sits in its privileged subtree.
//!
//! Startup sequence:
//! 1. Initialize structured logging
//! 2. Load and validate configuration (env override, YAML file, defaults)
//! 3. Build the protection components (capability registration)
//! 4. Assemble the application router around those components
//! 5. Serve until a shutdown signal arrives

use axum::{
    extract::Request,
    http::header,
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tracing::{info, warn};

use security_gateway::{
    allowlist_admin_router, ip_allowlist_gate, GatewayComponents, GatewayServer, PrincipalContext,
    SecurityConfig, SecurityResult,
};

#[tokio::main]
async fn main() -> SecurityResult<()> {
    init_observability();

    info!("Starting security gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("SECURITY_GATEWAY_CONFIG")
        .unwrap_or_else(|_| "config/gateway.yaml".to_string());

    let config = match SecurityConfig::load_from_file(&config_path).await {
        Ok(config) => {
            info!(path = %config_path, "Configuration loaded");
            config
        }
        Err(e) => {
            warn!(path = %config_path, error = %e, "Falling back to default configuration");
            SecurityConfig::default()
        }
    };

    let components = GatewayComponents::build(&config).await?;
    let app = build_app(&components);
    let server = GatewayServer::new(&config, app, &components)?;

    info!(addr = %server.bind_addr(), "Security gateway ready");
    server.run().await?;

    info!("Security gateway shutdown complete");
    Ok(())
}

/// Initialize structured logging with env-filter control
fn init_observability() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true).json())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "security_gateway=info,tower_http=warn".into()),
        )
        .init();
}

/// Demonstration application wrapped by the gateway
///
/// The privileged subtree carries the allow-list gate inside the
/// authenticated layer; the allow-list management surface sits outside the
/// gate so a principal can add their first address without already being on
/// the list.
fn build_app(components: &GatewayComponents) -> Router {
    let privileged = Router::new()
        .route("/status", get(admin_status))
        .layer(middleware::from_fn_with_state(
            components.gate.clone(),
            ip_allowlist_gate,
        ));

    Router::new()
        .route("/", get(index))
        .route("/api/auth/login", post(login))
        .nest("/api/admin", privileged)
        .nest(
            "/api/security/allowed-ips",
            allowlist_admin_router(components.allowlist.clone()),
        )
        .layer(middleware::from_fn(demo_auth))
}

/// Demonstration auth layer
///
/// Stands in for the application's real authentication: any bearer token is
/// accepted and its value becomes the principal id. The gateway itself only
/// ever consumes the resulting `PrincipalContext` marker.
async fn demo_auth(mut request: Request, next: Next) -> Response {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    if let Some(principal_id) = bearer {
        request
            .extensions_mut()
            .insert(PrincipalContext::new(principal_id));
    }

    next.run(request).await
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({ "service": "security-gateway", "status": "running" }))
}

async fn login() -> Json<serde_json::Value> {
    // Real credential handling lives in the application; the route exists so
    // the login rate-limit category has something to protect.
    Json(json!({ "token": "demo" }))
}

async fn admin_status() -> Json<serde_json::Value> {
    Json(json!({ "admin": true }))
}
