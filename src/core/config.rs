//! # Configuration Module
//!
//! Configuration surface for the security gateway, loaded from a YAML file
//! and validated at startup. Each protection plane has its own section with
//! serde defaults, so a partial file (or none at all) yields a working
//! configuration.
//!
//! The configuration deliberately exposes only what operators need to tune:
//! the trusted-proxy list, per-category rate limits, CSRF token lifetime,
//! excluded paths and privileged path prefixes, plus the backing-store
//! locations (redis URL, persistence files).

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::error::{SecurityError, SecurityResult};

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Client identity resolution settings
    pub identity: IdentityConfig,

    /// Rate limiting settings
    pub rate_limit: RateLimitConfig,

    /// CSRF protection settings
    pub csrf: CsrfConfig,

    /// Threat scanner settings
    pub scanner: ScannerConfig,

    /// IP allow-list settings
    pub allowlist: AllowlistConfig,

    /// Security audit log settings
    pub audit: AuditConfig,

    /// Paths that bypass the entire pipeline (exact, or trailing-`*` prefix)
    pub excluded_paths: Vec<String>,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the gateway listener
    pub bind_address: String,

    /// Listener port
    pub port: u16,

    /// Maximum accepted request body size in bytes
    pub max_body_size: usize,

    /// Whether the deployment terminates TLS in front of this service;
    /// controls the `Secure` attribute on issued cookies
    pub secure_cookies: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_body_size: 1024 * 1024, // 1MB
            secure_cookies: true,
        }
    }
}

/// Client identity resolution settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Proxy addresses whose forwarding header is believed
    ///
    /// Comma-separated in the environment override, a list in YAML. A peer
    /// address not in this list has its `X-Forwarded-For` ignored entirely.
    pub trusted_proxies: Vec<String>,
}

/// Rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Master switch for the rate limiting plane
    pub enabled: bool,

    /// Redis connection string for the shared counter store; when absent the
    /// limiter runs on the in-memory store only (single-instance semantics)
    pub redis_url: Option<String>,

    /// Key prefix for counter keys in the shared store
    pub key_prefix: String,

    /// Upper bound on any shared-store round trip before the limiter falls
    /// back to the in-memory store for that check
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,

    /// Limit for the `general` category
    pub general: CategoryLimit,

    /// Limit for the `login` category
    pub login: CategoryLimit,

    /// Paths counted against the `login` category (exact, or trailing-`*`)
    pub login_paths: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            key_prefix: "secgw:rl".to_string(),
            store_timeout: Duration::from_millis(250),
            general: CategoryLimit {
                limit: 300,
                window: Duration::from_secs(60),
            },
            login: CategoryLimit {
                limit: 1,
                window: Duration::from_secs(60),
            },
            login_paths: vec![
                "/api/auth/login".to_string(),
                "/api/auth/register".to_string(),
            ],
        }
    }
}

/// A single category's fixed-window limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CategoryLimit {
    /// Maximum requests per window
    pub limit: u32,

    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// CSRF protection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// Master switch for the CSRF plane
    pub enabled: bool,

    /// Token lifetime
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,

    /// Header carrying the double-submit echo
    pub header_name: String,

    /// Cookie carrying the issued token
    pub cookie_name: String,

    /// Cookie carrying the application session identifier
    pub session_cookie: String,

    /// Form field accepted as an alternative to the header
    pub form_field: String,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_ttl: Duration::from_secs(2 * 60 * 60), // 2 hours
            header_name: "x-csrf-token".to_string(),
            cookie_name: "csrf_token".to_string(),
            session_cookie: "sid".to_string(),
            form_field: "csrf_token".to_string(),
        }
    }
}

/// Threat scanner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Master switch for the scanning plane
    pub enabled: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// IP allow-list settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowlistConfig {
    /// Path prefixes gated by the allow-list once a principal is known
    pub privileged_prefixes: Vec<String>,

    /// Paths under a privileged prefix that stay reachable without an
    /// allow-list hit (a principal cannot be gated before they can log in)
    pub auth_exemptions: Vec<String>,

    /// Snapshot file for allow-list entries; in-memory only when absent
    pub persist_path: Option<PathBuf>,
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self {
            privileged_prefixes: vec!["/api/admin".to_string()],
            auth_exemptions: vec!["/api/admin/auth/*".to_string()],
            persist_path: None,
        }
    }
}

/// Security audit log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Master switch for the audit plane
    pub enabled: bool,

    /// JSON-lines audit file; events are only kept in memory when absent
    pub log_file: Option<PathBuf>,

    /// Capacity of the fire-and-forget channel between the request path and
    /// the writer task; events are dropped (and counted) beyond this
    pub buffer_size: usize,

    /// Number of most-recent events retained in memory for inspection
    pub max_recent: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_file: None,
            buffer_size: 1024,
            max_recent: 1000,
        }
    }
}

impl SecurityConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file(path: &str) -> SecurityResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SecurityError::config(format!("Failed to read {}: {}", path, e)))?;

        let config: SecurityConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration before any component is built
    pub fn validate(&self) -> SecurityResult<()> {
        for proxy in &self.identity.trusted_proxies {
            proxy.parse::<IpAddr>().map_err(|_| {
                SecurityError::config(format!("Invalid trusted proxy address: {}", proxy))
            })?;
        }

        for limit in [&self.rate_limit.general, &self.rate_limit.login] {
            if limit.limit == 0 {
                return Err(SecurityError::config("Rate limit must be at least 1"));
            }
            if limit.window.is_zero() {
                return Err(SecurityError::config("Rate limit window must be non-zero"));
            }
        }

        if self.csrf.token_ttl.is_zero() {
            return Err(SecurityError::config("CSRF token TTL must be non-zero"));
        }

        for prefix in &self.allowlist.privileged_prefixes {
            if !prefix.starts_with('/') {
                return Err(SecurityError::config(format!(
                    "Privileged prefix must start with '/': {}",
                    prefix
                )));
            }
        }

        for path in self
            .excluded_paths
            .iter()
            .chain(self.rate_limit.login_paths.iter())
        {
            if !path.starts_with('/') {
                return Err(SecurityError::config(format!(
                    "Path pattern must start with '/': {}",
                    path
                )));
            }
        }

        if self.server.max_body_size == 0 {
            return Err(SecurityError::config("max_body_size must be non-zero"));
        }

        Ok(())
    }

    /// Default excluded paths used when the file provides none
    pub fn default_excluded_paths() -> Vec<String> {
        vec![
            "/health".to_string(),
            "/ready".to_string(),
            "/static/*".to_string(),
            "/assets/*".to_string(),
            "/favicon.ico".to_string(),
        ]
    }

    /// Effective excluded-path list (configured or defaults)
    pub fn effective_excluded_paths(&self) -> Vec<String> {
        if self.excluded_paths.is_empty() {
            Self::default_excluded_paths()
        } else {
            self.excluded_paths.clone()
        }
    }
}

/// Match a path against an exact pattern or a trailing-`*` prefix pattern
pub fn path_matches(path: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        path.starts_with(prefix)
    } else {
        path == pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SecurityConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit.login.limit, 1);
        assert_eq!(config.rate_limit.login.window, Duration::from_secs(60));
        assert!(config.csrf.enabled);
    }

    #[test]
    fn test_invalid_trusted_proxy_rejected() {
        let mut config = SecurityConfig::default();
        config.identity.trusted_proxies = vec!["not-an-ip".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let mut config = SecurityConfig::default();
        config.rate_limit.general.limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_path_pattern_matching() {
        assert!(path_matches("/health", "/health"));
        assert!(!path_matches("/healthz", "/health"));
        assert!(path_matches("/static/css/app.css", "/static/*"));
        assert!(path_matches("/static/", "/static/*"));
        assert!(!path_matches("/api/users", "/static/*"));
    }

    #[test]
    fn test_yaml_roundtrip_with_partial_file() {
        let yaml = r#"
server:
  port: 9090
rate_limit:
  general:
    limit: 50
    window: 30s
identity:
  trusted_proxies:
    - "10.0.0.5"
"#;
        let config: SecurityConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.rate_limit.general.limit, 50);
        assert_eq!(config.rate_limit.general.window, Duration::from_secs(30));
        // Untouched sections keep their defaults
        assert_eq!(config.rate_limit.login.limit, 1);
        assert_eq!(config.csrf.cookie_name, "csrf_token");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_excluded_paths_fall_back_to_defaults() {
        let config = SecurityConfig::default();
        let paths = config.effective_excluded_paths();
        assert!(paths.contains(&"/health".to_string()));

        let mut config = SecurityConfig::default();
        config.excluded_paths = vec!["/ping".to_string()];
        assert_eq!(config.effective_excluded_paths(), vec!["/ping".to_string()]);
    }
}
