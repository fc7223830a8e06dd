//! # Gateway Server
//!
//! Builds the protection components from configuration and wraps an
//! application router with the security pipeline. The allow-list gate is
//! handed back to the application so it can be mounted inside the
//! authenticated subtree of privileged routes, after the auth layer has
//! installed the principal marker.

use axum::{middleware, response::Json, routing::get, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::allowlist::{AllowedIpStore, IpAllowlistGate};
use crate::audit::AuditLog;
use crate::core::config::SecurityConfig;
use crate::core::error::{SecurityError, SecurityResult};
use crate::csrf::CsrfTokenService;
use crate::gateway::pipeline::{security_gateway_middleware, SecurityGateway};
use crate::rate_limit::{CounterStore, RateLimiter, RedisCounterStore};
use crate::threat::ThreatScanner;

/// Interval between maintenance sweeps over in-memory state
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Every protection component, built once at startup
///
/// The application needs these before the server exists: the gate goes into
/// its privileged subtree and the store backs the management endpoints.
pub struct GatewayComponents {
    pub gateway: Arc<SecurityGateway>,
    pub gate: Arc<IpAllowlistGate>,
    pub allowlist: Arc<AllowedIpStore>,
    pub audit: Option<Arc<AuditLog>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub csrf: Option<Arc<CsrfTokenService>>,
    pub scanner: Option<Arc<ThreatScanner>>,
}

impl GatewayComponents {
    /// Build all components from configuration
    ///
    /// Optional collaborators that fail to come up degrade their plane
    /// instead of failing startup: an unreachable redis leaves the limiter
    /// on its in-memory store, and a disabled audit section leaves blocked
    /// requests unrecorded (warned about once here).
    pub async fn build(config: &SecurityConfig) -> SecurityResult<Self> {
        let audit = config
            .audit
            .enabled
            .then(|| Arc::new(AuditLog::new(&config.audit)));

        let scanner = config.scanner.enabled.then(|| Arc::new(ThreatScanner::new()));

        let csrf = config.csrf.enabled.then(|| {
            Arc::new(CsrfTokenService::new(
                config.csrf.clone(),
                config.server.secure_cookies,
            ))
        });

        let rate_limiter = if config.rate_limit.enabled {
            let primary: Option<Arc<dyn CounterStore>> = match &config.rate_limit.redis_url {
                Some(url) => match RedisCounterStore::connect(url).await {
                    Ok(store) => {
                        info!("Connected to shared rate-limit counter store");
                        Some(Arc::new(store))
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            "Shared counter store unreachable at startup; rate limiting degrades to per-instance enforcement"
                        );
                        None
                    }
                },
                None => None,
            };
            Some(Arc::new(RateLimiter::new(&config.rate_limit, primary)))
        } else {
            None
        };

        let allowlist = Arc::new(AllowedIpStore::new(config.allowlist.persist_path.clone()));
        let loaded = allowlist.load().await?;
        if loaded > 0 {
            info!(entries = loaded, "Allow-list entries loaded");
        }

        let gateway = Arc::new(
            SecurityGateway::builder(config)
                .rate_limiter(rate_limiter.clone())
                .csrf(csrf.clone())
                .scanner(scanner.clone())
                .audit(audit.clone())
                .build(),
        );

        let gate = Arc::new(IpAllowlistGate::new(
            &config.allowlist,
            allowlist.clone(),
            gateway.resolver(),
            audit.clone(),
        ));

        Ok(Self {
            gateway,
            gate,
            allowlist,
            audit,
            rate_limiter,
            csrf,
            scanner,
        })
    }
}

/// HTTP server wrapping an application router with the security pipeline
pub struct GatewayServer {
    bind_addr: SocketAddr,
    router: Router,
}

impl GatewayServer {
    /// Assemble the final router: health endpoint, application routes, the
    /// pipeline as the outermost gateway layer, request tracing outside it
    pub fn new(
        config: &SecurityConfig,
        app: Router,
        components: &GatewayComponents,
    ) -> SecurityResult<Self> {
        let bind_addr: SocketAddr =
            format!("{}:{}", config.server.bind_address, config.server.port)
                .parse()
                .map_err(|e| SecurityError::config(format!("Invalid bind address: {}", e)))?;

        let router = app
            .route("/health", get(health))
            .layer(middleware::from_fn_with_state(
                components.gateway.clone(),
                security_gateway_middleware,
            ))
            .layer(TraceLayer::new_for_http());

        spawn_maintenance(components);

        Ok(Self { bind_addr, router })
    }

    /// Address the server will listen on
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// The assembled router, for in-process testing
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve until the process receives a shutdown signal
    pub async fn run(self) -> SecurityResult<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Security gateway listening");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| SecurityError::internal(format!("Server error: {}", e)))
    }
}

/// Minimal health endpoint; excluded from the pipeline by configuration
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Periodic cleanup of expired in-memory state
fn spawn_maintenance(components: &GatewayComponents) {
    let limiter = components.rate_limiter.clone();
    let csrf = components.csrf.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Some(limiter) = &limiter {
                limiter.fallback_store().cleanup_expired();
            }
            if let Some(csrf) = &csrf {
                csrf.purge_expired();
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install shutdown handler: {}", e);
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_components_build_with_defaults() {
        let config = SecurityConfig::default();
        let components = GatewayComponents::build(&config).await.unwrap();

        assert!(components.audit.is_some());
        assert!(components.rate_limiter.is_some());
        assert!(components.csrf.is_some());
        assert!(components.scanner.is_some());
    }

    #[tokio::test]
    async fn test_disabled_planes_are_absent() {
        let mut config = SecurityConfig::default();
        config.rate_limit.enabled = false;
        config.csrf.enabled = false;
        config.scanner.enabled = false;
        config.audit.enabled = false;

        let components = GatewayComponents::build(&config).await.unwrap();
        assert!(components.audit.is_none());
        assert!(components.rate_limiter.is_none());
        assert!(components.csrf.is_none());
        assert!(components.scanner.is_none());
    }

    #[tokio::test]
    async fn test_server_assembles_with_valid_bind_addr() {
        let config = SecurityConfig::default();
        let components = GatewayComponents::build(&config).await.unwrap();
        let server = GatewayServer::new(&config, Router::new(), &components).unwrap();
        assert_eq!(server.bind_addr().port(), 8080);
    }

    #[tokio::test]
    async fn test_invalid_bind_addr_rejected() {
        let mut config = SecurityConfig::default();
        config.server.bind_address = "not an address".to_string();
        let components = GatewayComponents::build(&config).await.unwrap();
        assert!(GatewayServer::new(&config, Router::new(), &components).is_err());
    }
}
