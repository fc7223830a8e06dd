//! # CSRF Token Service
//!
//! Anti-forgery tokens following the double-submit cookie pattern, bound to
//! a session identifier derived from the surrounding session/auth mechanism.
//!
//! A token is valid only if it was issued for the same session id, has not
//! expired, and the value submitted via header or form field exactly matches
//! the value delivered in the cookie. Tokens are session-scoped and reusable
//! across requests within their lifetime; rotation happens only on
//! regeneration.
//!
//! Token values are self-contained: `nonce.expiry.mac` where the MAC covers
//! `session_id || nonce || expiry`. Session binding and expiry are verified
//! in constant time from the value itself, so a token can never be replayed
//! under a different session and requests without a session cookie (the
//! shared anonymous session) each carry an independent token instead of one
//! value common to every visitor. The per-session store exists only to give
//! real sessions rotation semantics: regenerating invalidates the previous
//! token even though its MAC would still verify.
//!
//! Exemptions (safe methods, excluded paths, bearer-authenticated requests)
//! are the orchestrator's responsibility, not this service's.

use base64::engine::general_purpose::STANDARD_NO_PAD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::core::config::CsrfConfig;

type HmacSha256 = Hmac<Sha256>;

/// Session id used when no session cookie is present
const ANONYMOUS_SESSION: &str = "anonymous";

/// Random bytes per token
const TOKEN_NONCE_LEN: usize = 32;

/// An issued anti-forgery token
#[derive(Debug, Clone)]
pub struct CsrfToken {
    /// Opaque value delivered in the cookie and echoed by the client
    pub value: String,

    /// Session the token is bound to
    pub session_id: String,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CsrfToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Outcome of a validation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfValidation {
    pub valid: bool,
    pub error: Option<String>,
}

impl CsrfValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn rejected<S: Into<String>>(reason: S) -> Self {
        Self {
            valid: false,
            error: Some(reason.into()),
        }
    }
}

/// Issues, binds, and validates anti-forgery tokens
pub struct CsrfTokenService {
    /// Current token per real session, for rotation semantics
    tokens: DashMap<String, CsrfToken>,
    signing_key: [u8; 32],
    config: CsrfConfig,
    secure_cookies: bool,
}

impl CsrfTokenService {
    pub fn new(config: CsrfConfig, secure_cookies: bool) -> Self {
        let mut signing_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut signing_key);

        Self {
            tokens: DashMap::new(),
            signing_key,
            config,
            secure_cookies,
        }
    }

    /// Issue a fresh token for a session
    ///
    /// For real sessions this replaces the stored token (rotation); the
    /// anonymous session is never stored, so each cookie-less client keeps
    /// its own independent token.
    pub fn generate_token(&self, session_id: &str) -> CsrfToken {
        let mut nonce = [0u8; TOKEN_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let issued_at = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(self.config.token_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(2));
        let expiry_bytes = (expires_at.timestamp() as u64).to_be_bytes();

        let mac = self.bind(session_id, &nonce, &expiry_bytes);
        let value = format!(
            "{}.{}.{}",
            BASE64.encode(nonce),
            BASE64.encode(expiry_bytes),
            BASE64.encode(mac)
        );

        let token = CsrfToken {
            value,
            session_id: session_id.to_string(),
            issued_at,
            expires_at,
        };

        if session_id != ANONYMOUS_SESSION {
            self.tokens.insert(session_id.to_string(), token.clone());
        }
        token
    }

    /// Live token for a session, minting one if none exists or the current
    /// one has expired
    pub fn current_or_generate(&self, session_id: &str) -> CsrfToken {
        if session_id != ANONYMOUS_SESSION {
            if let Some(existing) = self.tokens.get(session_id) {
                if !existing.is_expired() {
                    return existing.clone();
                }
            }
        }
        self.generate_token(session_id)
    }

    /// Validate a submitted token against the session it claims to serve
    pub fn validate_token(&self, session_id: &str, submitted: &str) -> CsrfValidation {
        // Constant-time session binding check; a forged or cross-session
        // token fails here before any state is consulted.
        let Some(expires_at) = self.verify_binding(session_id, submitted) else {
            return CsrfValidation::rejected("token is not valid for this session");
        };

        if Utc::now() >= expires_at {
            return CsrfValidation::rejected("token has expired");
        }

        // Real sessions additionally pin the current token, so regeneration
        // invalidates earlier values whose MAC would still verify.
        if session_id != ANONYMOUS_SESSION {
            if let Some(stored) = self.tokens.get(session_id) {
                if stored.value != submitted {
                    return CsrfValidation::rejected("token has been rotated");
                }
            }
        }

        CsrfValidation::ok()
    }

    /// Full double-submit validation for a request
    ///
    /// `cookie_value` is the token delivered via the cookie; `submitted` is
    /// the echo from the header or form field. Both must be present, match
    /// each other, and pass `validate_token`.
    pub fn validate_request(
        &self,
        session_id: &str,
        cookie_value: Option<&str>,
        submitted: Option<&str>,
    ) -> CsrfValidation {
        let cookie_value = match cookie_value {
            Some(v) if !v.is_empty() => v,
            _ => return CsrfValidation::rejected("missing token cookie"),
        };
        let submitted = match submitted {
            Some(v) if !v.is_empty() => v,
            _ => return CsrfValidation::rejected("missing submitted token"),
        };

        if cookie_value != submitted {
            return CsrfValidation::rejected("submitted token does not match cookie");
        }

        self.validate_token(session_id, submitted)
    }

    /// Extract the submitted token from request headers or a form body
    pub fn extract_token(
        &self,
        headers: &axum::http::HeaderMap,
        form_body: Option<&str>,
    ) -> Option<String> {
        if let Some(value) = headers
            .get(self.config.header_name.as_str())
            .and_then(|v| v.to_str().ok())
        {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }

        form_body.and_then(|body| form_field(body, &self.config.form_field))
    }

    /// Token value delivered via the cookie, if any
    pub fn cookie_token(&self, headers: &axum::http::HeaderMap) -> Option<String> {
        cookie_value(headers, &self.config.cookie_name)
    }

    /// Session identifier for a request
    ///
    /// Derived from the configured session cookie; requests without one fall
    /// into the anonymous session, whose tokens are minted per client and
    /// validated statelessly.
    pub fn session_id(&self, headers: &axum::http::HeaderMap) -> String {
        cookie_value(headers, &self.config.session_cookie)
            .unwrap_or_else(|| ANONYMOUS_SESSION.to_string())
    }

    /// `Set-Cookie` header value delivering a token to the client
    ///
    /// Not HttpOnly: the double-submit pattern requires the client to read
    /// the value back. `SameSite` and (on secure deployments) `Secure` are
    /// always set.
    pub fn build_cookie(&self, token: &CsrfToken) -> String {
        let max_age = self.config.token_ttl.as_secs();
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; SameSite=Strict",
            self.config.cookie_name, token.value, max_age
        );
        if self.secure_cookies {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Drop expired stored tokens; called by the server maintenance task
    pub fn purge_expired(&self) {
        self.tokens.retain(|_, token| !token.is_expired());
    }

    /// Number of real sessions currently holding a stored token
    pub fn session_count(&self) -> usize {
        self.tokens.len()
    }

    /// MAC binding a nonce and expiry to a session id
    fn bind(&self, session_id: &str, nonce: &[u8], expiry: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .expect("HMAC accepts any key length");
        mac.update(session_id.as_bytes());
        mac.update(nonce);
        mac.update(expiry);
        mac.finalize().into_bytes().to_vec()
    }

    /// Constant-time verification of a token's session binding
    ///
    /// Returns the embedded expiry on success.
    fn verify_binding(&self, session_id: &str, value: &str) -> Option<DateTime<Utc>> {
        let mut parts = value.split('.');
        let nonce = BASE64.decode(parts.next()?).ok()?;
        let expiry_bytes = BASE64.decode(parts.next()?).ok()?;
        let mac_bytes = BASE64.decode(parts.next()?).ok()?;
        if parts.next().is_some() || expiry_bytes.len() != 8 {
            return None;
        }

        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .expect("HMAC accepts any key length");
        mac.update(session_id.as_bytes());
        mac.update(&nonce);
        mac.update(&expiry_bytes);
        mac.verify_slice(&mac_bytes).ok()?;

        let expiry_secs = u64::from_be_bytes(expiry_bytes.try_into().ok()?);
        Utc.timestamp_opt(expiry_secs as i64, 0).single()
    }
}

/// Read a single cookie value from the Cookie header
fn cookie_value(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Read a field from a URL-encoded form body
fn form_field(body: &str, name: &str) -> Option<String> {
    body.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name)
            .then(|| urlencoding::decode(value).map(|cow| cow.into_owned()).ok())
            .flatten()
    })
}
