//! # Response Header Hardening
//!
//! Hardening headers applied to every response the gateway touches, plus the
//! rate-limit headers surfaced on gated responses.

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::rate_limit::RateLimitDecision;

/// Restrictive Permissions-Policy applied by default
const PERMISSIONS_POLICY: &str = "geolocation=(), microphone=(), camera=(), payment=(), usb=()";

/// Apply the hardening header set
///
/// Existing values are overwritten: the gateway owns these headers and a
/// handler must not be able to weaken them.
pub fn apply_hardening_headers(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static(PERMISSIONS_POLICY),
    );
}

/// Surface the rate-limit state on a response
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    insert_numeric(headers, "x-ratelimit-limit", decision.limit as u64);
    insert_numeric(headers, "x-ratelimit-remaining", decision.remaining as u64);
    insert_numeric(
        headers,
        "x-ratelimit-reset",
        decision.reset_time.timestamp().max(0) as u64,
    );

    if let Some(retry_after) = decision.retry_after {
        insert_numeric(headers, "retry-after", retry_after.as_secs().max(1));
    }
}

fn insert_numeric(headers: &mut HeaderMap, name: &'static str, value: u64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
