//! Rate limiting: fixed-window counting per (identity, category) with a
//! shared authoritative counter store and a per-instance in-memory fallback.

pub mod limiter;
pub mod storage;

pub use limiter::{RateLimitDecision, RateLimiter, RateLimiterMetricsSnapshot};
pub use storage::{CounterStore, InMemoryCounterStore, RedisCounterStore, WindowCount};
