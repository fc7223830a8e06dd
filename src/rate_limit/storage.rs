//! # Counter Store Backends
//!
//! Storage abstraction for fixed-window rate limiting. Two backends share
//! identical semantics:
//! - `RedisCounterStore`: atomic INCR with a TTL bound to the window,
//!   authoritative across every service instance.
//! - `InMemoryCounterStore`: DashMap-backed fallback scoped to a single
//!   instance, used when the shared store is unreachable.
//!
//! `increment` is the only mutating primitive the limiter needs: it bumps
//! the counter for a key, starting a fresh window (count = 1, full TTL) when
//! none exists or the previous window has elapsed, and reports the remaining
//! window time alongside the new count.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::time::{Duration, Instant};

use crate::core::error::SecurityResult;

/// Counter state after an increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Count within the current window, including this increment
    pub count: u64,

    /// Time remaining until the window expires
    pub expires_in: Duration,
}

/// Trait for rate limiting counter storage backends
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key`, starting a fresh window of length
    /// `window` if none is active
    async fn increment(&self, key: &str, window: Duration) -> SecurityResult<WindowCount>;

    /// Remove the counter for `key`, resetting its window
    async fn remove(&self, key: &str) -> SecurityResult<()>;
}

/// In-memory counter storage
///
/// Entry-level locking via DashMap gives per-key atomicity: concurrent
/// increments on the same key serialize on the shard lock, so no updates are
/// lost. Only approximates the global limit under horizontal scaling.
pub struct InMemoryCounterStore {
    data: DashMap<String, (u64, Instant)>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Drop expired windows; called periodically by the server maintenance
    /// task so abandoned keys do not accumulate
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.data.retain(|_, (_, deadline)| *deadline > now);
    }

    /// Number of live counter entries (expired ones included until cleanup)
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> SecurityResult<WindowCount> {
        let now = Instant::now();
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert((0, now + window));

        if entry.1 <= now {
            // Window elapsed: start fresh
            *entry = (1, now + window);
        } else {
            entry.0 += 1;
        }

        let (count, deadline) = *entry;
        drop(entry);

        Ok(WindowCount {
            count,
            expires_in: deadline.saturating_duration_since(now),
        })
    }

    async fn remove(&self, key: &str) -> SecurityResult<()> {
        self.data.remove(key);
        Ok(())
    }
}

/// Redis-backed counter storage
///
/// INCR is atomic server-side; the TTL is attached when the key is created
/// (count == 1), which pins the window to its first request. Subsequent
/// increments read the remaining TTL so every instance reports the same
/// reset time.
pub struct RedisCounterStore {
    connection: ConnectionManager,
}

impl RedisCounterStore {
    /// Connect to the shared counter store
    pub async fn connect(redis_url: &str) -> SecurityResult<Self> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> SecurityResult<WindowCount> {
        let mut conn = self.connection.clone();

        let count: u64 = conn.incr(key, 1).await?;
        let expires_in = if count == 1 {
            conn.pexpire::<_, ()>(key, window.as_millis() as i64).await?;
            window
        } else {
            let remaining_ms: i64 = conn.pttl(key).await?;
            if remaining_ms > 0 {
                Duration::from_millis(remaining_ms as u64)
            } else {
                // Key exists without a TTL (expiry write lost); re-arm it so
                // the window cannot become permanent.
                conn.pexpire::<_, ()>(key, window.as_millis() as i64).await?;
                window
            }
        };

        Ok(WindowCount { count, expires_in })
    }

    async fn remove(&self, key: &str) -> SecurityResult<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
