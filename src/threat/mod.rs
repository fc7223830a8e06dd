//! # Threat Scanner
//!
//! Pattern-based detection of SQL injection, cross-site scripting, and path
//! traversal signatures in request bodies and query strings. Detection is
//! regex-based rather than parser-based: a deliberate simplicity/recall
//! trade-off with a known false-negative rate, which is accepted as a
//! documented limitation rather than a bug.
//!
//! The signature set is an ordered list of `(name, kind, regex)` entries so
//! new heuristics can be added and tested independently. Patterns are
//! compiled once and shared across all requests.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::core::types::{ThreatKind, ThreatSignal};

/// Replacement written over sensitive metadata values before persistence
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Longest metadata string value recorded verbatim
const MAX_METADATA_VALUE_LEN: usize = 256;

/// Metadata keys whose values are never recorded
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "token",
    "secret",
    "authorization",
    "cookie",
    "api_key",
    "apikey",
];

/// A single named detection signature
#[derive(Debug)]
pub struct ThreatPattern {
    pub name: &'static str,
    pub kind: ThreatKind,
    pub regex: Regex,
}

impl ThreatPattern {
    fn new(name: &'static str, kind: ThreatKind, pattern: &str) -> Self {
        Self {
            name,
            kind,
            // Patterns are compile-time constants; a bad one is a programming
            // error caught by the default_patterns_compile test.
            regex: Regex::new(pattern).expect("invalid threat pattern"),
        }
    }
}

/// Built-in signature set, compiled once
static DEFAULT_PATTERNS: LazyLock<Vec<ThreatPattern>> = LazyLock::new(|| {
    vec![
        // SQL injection: a statement keyword combined with quote, comment,
        // or statement-separator sequences
        ThreatPattern::new(
            "sql-keyword-with-terminator",
            ThreatKind::Sqli,
            r#"(?i)\b(select|insert|update|delete|drop|union|create|alter|truncate|exec|execute)\b[^\n]*('|"|--|/\*|;)"#,
        ),
        ThreatPattern::new(
            "sql-quoted-tautology",
            ThreatKind::Sqli,
            r#"(?i)('|")\s*(or|and)\s*('|")?\s*\w*('|")?\s*="#,
        ),
        ThreatPattern::new(
            "sql-numeric-tautology",
            ThreatKind::Sqli,
            r"(?i)\b(or|and)\b\s+\d+\s*=\s*\d+",
        ),
        ThreatPattern::new(
            "sql-comment-sequence",
            ThreatKind::Sqli,
            r"(--|/\*|\*/|;--)",
        ),
        // XSS: script/iframe/object tags, javascript: URLs, inline handlers
        ThreatPattern::new("xss-script-tag", ThreatKind::Xss, r"(?i)<\s*script"),
        ThreatPattern::new("xss-javascript-url", ThreatKind::Xss, r"(?i)javascript\s*:"),
        ThreatPattern::new("xss-event-handler", ThreatKind::Xss, r"(?i)\bon\w+\s*="),
        ThreatPattern::new(
            "xss-embedding-tag",
            ThreatKind::Xss,
            r"(?i)<\s*(iframe|object|embed)",
        ),
        // Path traversal: literal and percent-encoded dot-dot sequences
        ThreatPattern::new(
            "traversal-dot-dot",
            ThreatKind::PathTraversal,
            r"\.\./|\.\.\\",
        ),
        ThreatPattern::new(
            "traversal-encoded",
            ThreatKind::PathTraversal,
            r"(?i)(%2e%2e(%2f|%5c)|\.\.(%2f|%5c))",
        ),
    ]
});

/// Scans text surfaces for threat signatures
pub struct ThreatScanner {
    patterns: &'static [ThreatPattern],
}

impl ThreatScanner {
    /// Scanner over the built-in signature set
    pub fn new() -> Self {
        Self {
            patterns: &DEFAULT_PATTERNS,
        }
    }

    /// Scan one text surface; every matching signature produces a signal
    pub fn scan(&self, text: &str) -> Vec<ThreatSignal> {
        if text.is_empty() {
            return Vec::new();
        }

        self.patterns
            .iter()
            .filter(|pattern| pattern.regex.is_match(text))
            .map(|pattern| ThreatSignal {
                kind: pattern.kind,
                matched_pattern: pattern.name,
            })
            .collect()
    }

    /// Scan a percent-encoded query string, decoding it first so encoded
    /// payloads cannot slip past the literal signatures
    pub fn scan_query(&self, query: &str) -> Vec<ThreatSignal> {
        if query.is_empty() {
            return Vec::new();
        }

        let decoded = urlencoding::decode(query)
            .map(|cow| cow.into_owned())
            .unwrap_or_else(|_| query.to_string());

        let mut signals = self.scan(&decoded);
        if decoded != query {
            // The raw form is scanned too: double-encoded traversal sequences
            // survive one round of decoding.
            for signal in self.scan(query) {
                if !signals.contains(&signal) {
                    signals.push(signal);
                }
            }
        }
        signals
    }
}

impl Default for ThreatScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Sanitize a metadata object before it is audited or persisted
///
/// Sensitive keys are redacted entirely; long string values are truncated
/// with a marker. Nested objects and arrays are handled recursively.
pub fn sanitize_metadata(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sanitized = map
                .into_iter()
                .map(|(key, val)| {
                    if is_sensitive_key(&key) {
                        (key, Value::String(REDACTION_MARKER.to_string()))
                    } else {
                        (key, sanitize_metadata(val))
                    }
                })
                .collect();
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_metadata).collect()),
        Value::String(s) => Value::String(truncate_value(s)),
        other => other,
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|needle| lower.contains(needle))
}

fn truncate_value(s: String) -> String {
    if s.len() <= MAX_METADATA_VALUE_LEN {
        return s;
    }
    let mut cut = MAX_METADATA_VALUE_LEN;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...[truncated]", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_patterns_compile() {
        assert!(!DEFAULT_PATTERNS.is_empty());
    }

    #[test]
    fn test_script_tag_yields_xss_signal() {
        let scanner = ThreatScanner::new();
        let signals = scanner.scan("<script>alert(1)</script>");
        assert!(signals.iter().any(|s| s.kind == ThreatKind::Xss));
    }

    #[test]
    fn test_classic_injection_yields_sqli_signal() {
        let scanner = ThreatScanner::new();
        let signals = scanner.scan("'; DROP TABLE users; --");
        assert!(signals.iter().any(|s| s.kind == ThreatKind::Sqli));
    }

    #[test]
    fn test_benign_input_yields_no_signal() {
        let scanner = ThreatScanner::new();
        assert!(scanner.scan("hello world").is_empty());
        assert!(scanner.scan("").is_empty());
        assert!(scanner
            .scan(r#"{"name":"Jordan","bio":"Loves hiking and photography"}"#)
            .is_empty());
    }

    #[test]
    fn test_inline_event_handler_detected() {
        let scanner = ThreatScanner::new();
        let signals = scanner.scan(r#"<img src=x onerror="alert(1)">"#);
        assert!(signals.iter().any(|s| s.kind == ThreatKind::Xss));
    }

    #[test]
    fn test_javascript_url_detected() {
        let scanner = ThreatScanner::new();
        let signals = scanner.scan("javascript:alert(document.cookie)");
        assert!(signals.iter().any(|s| s.kind == ThreatKind::Xss));
    }

    #[test]
    fn test_path_traversal_detected() {
        let scanner = ThreatScanner::new();
        assert!(scanner
            .scan("../../etc/passwd")
            .iter()
            .any(|s| s.kind == ThreatKind::PathTraversal));
        assert!(scanner
            .scan(r"..\..\windows\system32")
            .iter()
            .any(|s| s.kind == ThreatKind::PathTraversal));
    }

    #[test]
    fn test_encoded_query_payload_detected() {
        let scanner = ThreatScanner::new();
        let signals = scanner.scan_query("file=%2e%2e%2f%2e%2e%2fetc%2fpasswd");
        assert!(signals.iter().any(|s| s.kind == ThreatKind::PathTraversal));

        let signals = scanner.scan_query("q=%3Cscript%3Ealert(1)%3C%2Fscript%3E");
        assert!(signals.iter().any(|s| s.kind == ThreatKind::Xss));
    }

    #[test]
    fn test_union_select_detected() {
        let scanner = ThreatScanner::new();
        let signals = scanner.scan("1 UNION SELECT username, password FROM users--");
        assert!(signals.iter().any(|s| s.kind == ThreatKind::Sqli));
    }

    #[test]
    fn test_signal_names_the_pattern() {
        let scanner = ThreatScanner::new();
        let signals = scanner.scan("<script>");
        assert_eq!(signals[0].matched_pattern, "xss-script-tag");
    }

    #[test]
    fn test_sanitize_redacts_sensitive_keys() {
        let metadata = json!({
            "field": "username",
            "password": "hunter2",
            "nested": { "api_key": "abc123", "ok": "fine" },
            "Authorization": "Bearer xyz",
        });

        let sanitized = sanitize_metadata(metadata);
        assert_eq!(sanitized["password"], REDACTION_MARKER);
        assert_eq!(sanitized["nested"]["api_key"], REDACTION_MARKER);
        assert_eq!(sanitized["Authorization"], REDACTION_MARKER);
        assert_eq!(sanitized["field"], "username");
        assert_eq!(sanitized["nested"]["ok"], "fine");
    }

    #[test]
    fn test_sanitize_truncates_long_values() {
        let long = "x".repeat(1000);
        let sanitized = sanitize_metadata(json!({ "blob": long }));
        let value = sanitized["blob"].as_str().unwrap();
        assert!(value.len() < 1000);
        assert!(value.ends_with("...[truncated]"));
    }
}
