//! # Security Audit Log
//!
//! Records structured security events for forensic review. Writes are
//! fire-and-forget: `record` hands the event to a bounded channel and
//! returns immediately; a background task appends JSON lines to the audit
//! file and mirrors events into an in-memory ring for inspection.
//!
//! Nothing in this module ever surfaces a failure to the request path. A
//! full channel drops the event (counted and warned about locally); a
//! failed file write is logged and the event stays in the in-memory ring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::config::AuditConfig;
use crate::threat::sanitize_metadata;

/// Security event taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventType {
    RateLimitExceeded,
    SqlInjectionAttempt,
    XssAttempt,
    SuspiciousActivity,
    CsrfRejected,
    AccessDenied,
    SystemError,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::RateLimitExceeded => "rate-limit-exceeded",
            AuditEventType::SqlInjectionAttempt => "sql-injection-attempt",
            AuditEventType::XssAttempt => "xss-attempt",
            AuditEventType::SuspiciousActivity => "suspicious-activity",
            AuditEventType::CsrfRejected => "csrf-rejected",
            AuditEventType::AccessDenied => "access-denied",
            AuditEventType::SystemError => "system-error",
        }
    }
}

/// One recorded security event; append-only, never mutated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub actor_ip: String,
    pub path: String,
    pub method: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

/// Request context captured with every event
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub actor_ip: String,
    pub path: String,
    pub method: String,
}

impl AuditContext {
    pub fn new<A, P, M>(actor_ip: A, path: P, method: M) -> Self
    where
        A: Into<String>,
        P: Into<String>,
        M: Into<String>,
    {
        Self {
            actor_ip: actor_ip.into(),
            path: path.into(),
            method: method.into(),
        }
    }
}

/// Aggregate audit counters
#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub recorded: u64,
    pub dropped: u64,
    pub by_type: HashMap<String, u64>,
}

/// Best-effort, non-blocking security event recorder
pub struct AuditLog {
    sender: mpsc::Sender<AuditEvent>,
    recent: Arc<RwLock<VecDeque<AuditEvent>>>,
    recorded: AtomicU64,
    dropped: Arc<AtomicU64>,
}

impl AuditLog {
    /// Start the audit log and its background writer task
    pub fn new(config: &AuditConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.buffer_size.max(1));
        let recent = Arc::new(RwLock::new(VecDeque::with_capacity(config.max_recent)));
        let dropped = Arc::new(AtomicU64::new(0));

        tokio::spawn(writer_task(
            receiver,
            config.log_file.clone(),
            recent.clone(),
            config.max_recent,
        ));

        if let Some(path) = &config.log_file {
            info!(path = %path.display(), "Security audit log started");
        } else {
            info!("Security audit log started (in-memory only)");
        }

        Self {
            sender,
            recent,
            recorded: AtomicU64::new(0),
            dropped,
        }
    }

    /// Record a security event
    ///
    /// Never blocks and never reports failure to the caller. Metadata is
    /// sanitized (sensitive keys redacted, long values truncated) before it
    /// leaves the request path.
    pub fn record(&self, event_type: AuditEventType, context: &AuditContext, metadata: Value) {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            event_type,
            actor_ip: context.actor_ip.clone(),
            path: context.path.clone(),
            method: context.method.clone(),
            metadata: sanitize_metadata(metadata),
            timestamp: Utc::now(),
        };

        warn!(
            event_type = event_type.as_str(),
            actor_ip = %event.actor_ip,
            path = %event.path,
            method = %event.method,
            "Security event"
        );

        match self.sender.try_send(event) {
            Ok(()) => {
                self.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Audit channel full or closed, event dropped");
            }
        }
    }

    /// Most recent events, newest first
    pub async fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let recent = self.recent.read().await;
        recent.iter().take(limit).cloned().collect()
    }

    /// Most recent events of one type, newest first
    pub async fn recent_by_type(&self, event_type: AuditEventType, limit: usize) -> Vec<AuditEvent> {
        let recent = self.recent.read().await;
        recent
            .iter()
            .filter(|e| e.event_type == event_type)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Aggregate counters over the in-memory ring
    pub async fn stats(&self) -> AuditStats {
        let recent = self.recent.read().await;
        let mut by_type: HashMap<String, u64> = HashMap::new();
        for event in recent.iter() {
            *by_type.entry(event.event_type.as_str().to_string()).or_insert(0) += 1;
        }

        AuditStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            by_type,
        }
    }
}

/// Background task: drains the channel into the ring buffer and audit file
async fn writer_task(
    mut receiver: mpsc::Receiver<AuditEvent>,
    log_file: Option<PathBuf>,
    recent: Arc<RwLock<VecDeque<AuditEvent>>>,
    max_recent: usize,
) {
    let mut file = match open_log_file(&log_file).await {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to open audit log file, events kept in memory only: {}", e);
            None
        }
    };

    while let Some(event) = receiver.recv().await {
        {
            let mut recent = recent.write().await;
            recent.push_front(event.clone());
            while recent.len() > max_recent {
                recent.pop_back();
            }
        }

        if let Some(file) = file.as_mut() {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    if let Err(e) = write_line(file, &line).await {
                        warn!("Failed to write audit record: {}", e);
                    }
                }
                Err(e) => warn!("Failed to serialize audit record: {}", e),
            }
        }
    }
}

async fn open_log_file(
    log_file: &Option<PathBuf>,
) -> Result<Option<tokio::fs::File>, std::io::Error> {
    let Some(path) = log_file else {
        return Ok(None);
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(Some(file))
}

async fn write_line(file: &mut tokio::fs::File, line: &str) -> Result<(), std::io::Error> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}
