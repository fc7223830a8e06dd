//! # Fixed-Window Rate Limiter
//!
//! Counts requests per (identity, category) key inside non-overlapping time
//! windows and renders admit/deny decisions. The shared counter store is
//! authoritative across service instances; when it errors or exceeds its
//! bounded timeout the limiter falls back to the in-process store for that
//! check.
//!
//! The fallback is a deliberate fail-open-for-availability choice: distinct
//! instances then under-enforce the global limit. Degraded checks are marked
//! on the decision and counted in the metrics so operators can alert on
//! them; callers must treat fallback mode as degraded, not equivalent,
//! protection.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::{CategoryLimit, RateLimitConfig};
use crate::core::error::SecurityResult;
use crate::core::types::RateLimitCategory;
use crate::rate_limit::storage::{CounterStore, InMemoryCounterStore, WindowCount};

/// Rate limit decision for one request
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the request must be rejected
    pub blocked: bool,

    /// Configured limit for the category
    pub limit: u32,

    /// Requests left in the current window
    pub remaining: u32,

    /// When the current window expires
    pub reset_time: DateTime<Utc>,

    /// Time to wait before retrying; present only when blocked
    pub retry_after: Option<Duration>,

    /// True when this decision came from the in-memory fallback instead of
    /// the shared store
    pub degraded: bool,
}

/// Counters for allowed/denied/degraded checks
#[derive(Debug, Default)]
struct RateLimiterMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    degraded: AtomicU64,
}

/// Snapshot of limiter metrics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterMetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub degraded: u64,
}

/// Fixed-window rate limiter with per-category limits
pub struct RateLimiter {
    /// Shared store, authoritative when reachable
    primary: Option<Arc<dyn CounterStore>>,

    /// Single-instance fallback, also the sole store when no shared store is
    /// configured
    fallback: Arc<InMemoryCounterStore>,

    key_prefix: String,
    store_timeout: Duration,
    general: CategoryLimit,
    login: CategoryLimit,
    metrics: RateLimiterMetrics,
}

impl RateLimiter {
    /// Build a limiter from configuration and an optional shared store
    pub fn new(config: &RateLimitConfig, primary: Option<Arc<dyn CounterStore>>) -> Self {
        Self {
            primary,
            fallback: Arc::new(InMemoryCounterStore::new()),
            key_prefix: config.key_prefix.clone(),
            store_timeout: config.store_timeout,
            general: config.general,
            login: config.login,
            metrics: RateLimiterMetrics::default(),
        }
    }

    /// Check whether a request from `identity` in `category` is admitted
    pub async fn check(&self, identity: &str, category: RateLimitCategory) -> RateLimitDecision {
        let limit = self.category_limit(category);
        let key = self.key(identity, category);

        let (window, degraded) = self.increment(&key, limit.window).await;

        let blocked = window.count > limit.limit as u64;
        let remaining = (limit.limit as u64).saturating_sub(window.count) as u32;
        let reset_time = Utc::now()
            + chrono::Duration::from_std(window.expires_in)
                .unwrap_or_else(|_| chrono::Duration::seconds(limit.window.as_secs() as i64));

        if blocked {
            self.metrics.denied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            key = %key,
            count = window.count,
            limit = limit.limit,
            blocked,
            degraded,
            "Rate limit check"
        );

        RateLimitDecision {
            blocked,
            limit: limit.limit,
            remaining,
            reset_time,
            retry_after: blocked.then_some(window.expires_in),
            degraded,
        }
    }

    /// Reset the window for one (identity, category) key in both stores
    pub async fn reset(&self, identity: &str, category: RateLimitCategory) -> SecurityResult<()> {
        let key = self.key(identity, category);
        if let Some(primary) = &self.primary {
            if let Err(err) = primary.remove(&key).await {
                warn!(key = %key, error = %err, "Failed to reset counter in shared store");
            }
        }
        self.fallback.remove(&key).await
    }

    /// Current metrics snapshot
    pub fn metrics_snapshot(&self) -> RateLimiterMetricsSnapshot {
        RateLimiterMetricsSnapshot {
            allowed: self.metrics.allowed.load(Ordering::Relaxed),
            denied: self.metrics.denied.load(Ordering::Relaxed),
            degraded: self.metrics.degraded.load(Ordering::Relaxed),
        }
    }

    /// In-memory fallback store, exposed for periodic cleanup
    pub fn fallback_store(&self) -> Arc<InMemoryCounterStore> {
        self.fallback.clone()
    }

    /// Increment against the shared store, falling back in-process on error
    /// or timeout
    async fn increment(&self, key: &str, window: Duration) -> (WindowCount, bool) {
        if let Some(primary) = &self.primary {
            match tokio::time::timeout(self.store_timeout, primary.increment(key, window)).await {
                Ok(Ok(count)) => return (count, false),
                Ok(Err(err)) => {
                    warn!(key = %key, error = %err, "Shared counter store failed, using in-memory fallback");
                }
                Err(_) => {
                    warn!(
                        key = %key,
                        timeout_ms = self.store_timeout.as_millis() as u64,
                        "Shared counter store timed out, using in-memory fallback"
                    );
                }
            }
            self.metrics.degraded.fetch_add(1, Ordering::Relaxed);
        }

        // The in-memory store cannot fail; its Result exists only to satisfy
        // the CounterStore contract.
        let count = self
            .fallback
            .increment(key, window)
            .await
            .unwrap_or(WindowCount {
                count: 1,
                expires_in: window,
            });
        (count, self.primary.is_some())
    }

    fn category_limit(&self, category: RateLimitCategory) -> CategoryLimit {
        match category {
            RateLimitCategory::Login => self.login,
            RateLimitCategory::General => self.general,
        }
    }

    fn key(&self, identity: &str, category: RateLimitCategory) -> String {
        format!("{}:{}:{}", self.key_prefix, category.as_str(), identity)
    }
}
