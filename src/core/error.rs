//! # Error Handling Module
//!
//! This module provides the error taxonomy for the security gateway using the
//! `thiserror` crate. It defines every failure the protection pipeline and its
//! supporting services can produce, along with the HTTP status mapping used
//! when an error is rendered to a client.
//!
//! Two categories matter for response shaping:
//! - **Security rejections** (rate limited, CSRF invalid, threat detected,
//!   oversized payload) render a uniform body so a caller cannot tell which
//!   specific check fired.
//! - **Validation errors** (invalid address, duplicate entry, not found)
//!   carry their specific message back to the caller.
//!
//! Internal faults never leak detail: the gateway converts them to a generic
//! rejection and records the real cause in the audit log.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::core::types::ThreatKind;

/// Main result type used throughout the gateway
pub type SecurityResult<T> = Result<T, SecurityError>;

/// Message used for every security-category rejection body
const SECURITY_REJECTION_MESSAGE: &str = "Request rejected by security policy";

/// All error conditions the security gateway can produce
#[derive(Debug, Error, Clone)]
pub enum SecurityError {
    /// Request rate exceeded the configured limit for its category
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// CSRF token missing, expired, or mismatched
    #[error("CSRF validation failed: {reason}")]
    CsrfInvalid { reason: String },

    /// Threat scanner matched a signature in the body or query string
    #[error("Threat detected: {kind}")]
    ThreatDetected { kind: ThreatKind },

    /// Declared or actual request body exceeds the configured maximum
    #[error("Request payload exceeds the configured maximum of {max_bytes} bytes")]
    OversizedPayload { max_bytes: usize },

    /// Authenticated principal is not permitted to perform the request
    #[error("Access denied: {reason}")]
    AccessDenied { reason: String },

    /// IP address failed allow-list validation
    #[error("Invalid IP address: {reason}")]
    InvalidAddress { reason: String },

    /// An active allow-list entry already exists for this (principal, ip) pair
    #[error("An active allow-list entry already exists for {ip_address}")]
    DuplicateEntry { ip_address: String },

    /// Requested resource does not exist or is not owned by the caller
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Backing-store infrastructure failures (counter store, persistence)
    #[error("Store error: {message}")]
    Store { message: String },

    /// Unexpected internal fault; the pipeline fails closed on these
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SecurityError {
    /// Create a CSRF validation error with a custom reason
    pub fn csrf<S: Into<String>>(reason: S) -> Self {
        Self::CsrfInvalid {
            reason: reason.into(),
        }
    }

    /// Create an access-denied error with a custom reason
    pub fn access_denied<S: Into<String>>(reason: S) -> Self {
        Self::AccessDenied {
            reason: reason.into(),
        }
    }

    /// Create an invalid-address error with a custom reason
    pub fn invalid_address<S: Into<String>>(reason: S) -> Self {
        Self::InvalidAddress {
            reason: reason.into(),
        }
    }

    /// Create a not-found error naming the missing resource
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a store error with a custom message
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CsrfInvalid { .. } => StatusCode::FORBIDDEN,
            Self::ThreatDetected { .. } => StatusCode::FORBIDDEN,
            Self::OversizedPayload { .. } => StatusCode::FORBIDDEN,
            Self::AccessDenied { .. } => StatusCode::FORBIDDEN,
            Self::InvalidAddress { .. } => StatusCode::BAD_REQUEST,
            Self::DuplicateEntry { .. } => StatusCode::CONFLICT,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check whether this error is a security rejection
    ///
    /// Security rejections share one uniform response body so a probe cannot
    /// distinguish which protection plane fired.
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::CsrfInvalid { .. }
                | Self::ThreatDetected { .. }
                | Self::OversizedPayload { .. }
        )
    }

    /// Check if this error can be retried after waiting
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Store { .. })
    }

    /// Generic fail-closed rejection for unexpected internal faults
    ///
    /// The pipeline never reveals that something broke internally; it
    /// renders the same uniform body as any other security rejection.
    pub fn fail_closed_response() -> Response {
        let body = json!({
            "error": {
                "code": StatusCode::FORBIDDEN.as_u16(),
                "message": SECURITY_REJECTION_MESSAGE,
                "type": "security_rejection",
                "retryable": false,
            }
        });
        (StatusCode::FORBIDDEN, Json(body)).into_response()
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::RateLimited { .. }
            | Self::CsrfInvalid { .. }
            | Self::ThreatDetected { .. }
            | Self::OversizedPayload { .. } => "security_rejection",
            Self::AccessDenied { .. } => "access_denied",
            Self::InvalidAddress { .. } => "invalid_address",
            Self::DuplicateEntry { .. } => "duplicate_entry",
            Self::NotFound { .. } => "not_found",
            Self::Configuration { .. } => "configuration_error",
            Self::Store { .. } => "store_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<std::io::Error> for SecurityError {
    fn from(err: std::io::Error) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SecurityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {}", err),
        }
    }
}

impl From<serde_yaml::Error> for SecurityError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("YAML error: {}", err),
        }
    }
}

impl From<redis::RedisError> for SecurityError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store {
            message: format!("Redis error: {}", err),
        }
    }
}

/// Convert errors into HTTP responses with appropriate status codes
///
/// Security rejections and internal faults are rendered with the uniform
/// rejection body; validation errors keep their specific message so callers
/// can correct their input.
impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = if self.is_security_rejection() || status.is_server_error() {
            SECURITY_REJECTION_MESSAGE.to_string()
        } else {
            self.to_string()
        };

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
