//! # Allowed IP Store
//!
//! Persists and queries per-principal IP allow-list entries: CRUD, a
//! membership test with last-used tracking, and usage statistics.
//!
//! Entries live in memory behind an `RwLock` and are snapshotted to a
//! JSON-lines file on every mutation when a persistence path is configured.
//! The membership test reads under one lock acquisition, so the boolean
//! result always reflects a single consistent view; the `last_used_at`
//! touch that follows a hit is best-effort and may be lost under
//! concurrency, which is acceptable.
//!
//! Uniqueness invariant: at most one ACTIVE entry per `(principal_id,
//! ip_address)` pair. Inactive duplicates may exist (soft-disabled history).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::allowlist::validation::validate_ip_address;
use crate::core::error::{SecurityError, SecurityResult};

/// Window used by the `recently_used` statistic
const RECENT_USE_DAYS: i64 = 7;

/// One allow-list entry owned by a principal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllowedIpEntry {
    pub id: Uuid,
    pub principal_id: String,
    pub ip_address: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields that can be changed on an existing entry
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllowedIpPatch {
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

/// Usage statistics for one principal's allow-list
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AllowlistStats {
    pub total: usize,
    pub active: usize,
    pub recently_used: usize,
}

/// Per-principal IP allow-list with optional file persistence
pub struct AllowedIpStore {
    entries: RwLock<Vec<AllowedIpEntry>>,
    persist_path: Option<PathBuf>,
}

impl AllowedIpStore {
    /// Create an empty store; entries persist to `persist_path` when set
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            persist_path,
        }
    }

    /// Load entries from the snapshot file, replacing in-memory state
    ///
    /// A missing file is an empty store; individually unparseable lines are
    /// skipped with a warning rather than failing startup.
    pub async fn load(&self) -> SecurityResult<usize> {
        let Some(path) = &self.persist_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(path).await?;
        let mut loaded = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AllowedIpEntry>(line) {
                Ok(entry) => loaded.push(entry),
                Err(e) => warn!("Skipping unparseable allow-list record: {}", e),
            }
        }

        let count = loaded.len();
        let mut entries = self.entries.write().await;
        *entries = loaded;
        Ok(count)
    }

    /// Add an allow-list entry for a principal
    ///
    /// Fails with `InvalidAddress` when the address does not validate and
    /// with `DuplicateEntry` when an active entry for the same
    /// `(principal_id, ip)` pair already exists.
    pub async fn add(
        &self,
        principal_id: &str,
        ip_address: &str,
        description: Option<String>,
    ) -> SecurityResult<AllowedIpEntry> {
        let normalized = validate_ip_address(ip_address)?.to_string();

        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| {
            e.is_active && e.principal_id == principal_id && e.ip_address == normalized
        }) {
            return Err(SecurityError::DuplicateEntry {
                ip_address: normalized,
            });
        }

        let entry = AllowedIpEntry {
            id: Uuid::new_v4(),
            principal_id: principal_id.to_string(),
            ip_address: normalized,
            description,
            is_active: true,
            last_used_at: None,
            created_at: Utc::now(),
        };
        entries.push(entry.clone());

        self.persist(&entries).await;
        Ok(entry)
    }

    /// All entries owned by a principal, active first, newest first
    pub async fn list(&self, principal_id: &str) -> Vec<AllowedIpEntry> {
        let entries = self.entries.read().await;
        let mut owned: Vec<AllowedIpEntry> = entries
            .iter()
            .filter(|e| e.principal_id == principal_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| {
            b.is_active
                .cmp(&a.is_active)
                .then(b.created_at.cmp(&a.created_at))
        });
        owned
    }

    /// Update an active entry owned by the principal
    ///
    /// Fails with `NotFound` when no active entry with that id belongs to
    /// the principal. Deactivation goes through the patch; reactivation is
    /// an explicit remove-and-add so the uniqueness check cannot be raced.
    pub async fn update(
        &self,
        id: Uuid,
        principal_id: &str,
        patch: AllowedIpPatch,
    ) -> SecurityResult<AllowedIpEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id && e.principal_id == principal_id && e.is_active)
            .ok_or_else(|| SecurityError::not_found("active allow-list entry"))?;

        if let Some(description) = patch.description {
            entry.description = Some(description);
        }
        if let Some(is_active) = patch.is_active {
            entry.is_active = is_active;
        }
        let updated = entry.clone();

        self.persist(&entries).await;
        Ok(updated)
    }

    /// Delete an entry owned by the principal
    pub async fn remove(&self, id: Uuid, principal_id: &str) -> SecurityResult<()> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| !(e.id == id && e.principal_id == principal_id));
        if entries.len() == before {
            return Err(SecurityError::not_found("allow-list entry"));
        }

        self.persist(&entries).await;
        Ok(())
    }

    /// Membership test: is `ip_address` on the principal's active list?
    ///
    /// A hit updates `last_used_at` best-effort. The returned boolean comes
    /// from a single consistent read; only the timestamp touch may be lost.
    pub async fn is_allowed(&self, principal_id: &str, ip_address: &str) -> bool {
        let normalized = match ip_address.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
                Some(v4) => v4.to_string(),
                None => v6.to_string(),
            },
            Ok(addr) => addr.to_string(),
            Err(_) => return false,
        };

        let hit = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .find(|e| {
                    e.is_active && e.principal_id == principal_id && e.ip_address == normalized
                })
                .map(|e| e.id)
        };

        let Some(id) = hit else {
            return false;
        };

        // Best-effort touch, after the decision has already been made
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.last_used_at = Some(Utc::now());
        }
        self.persist(&entries).await;

        true
    }

    /// Usage statistics for one principal
    pub async fn stats(&self, principal_id: &str) -> AllowlistStats {
        let entries = self.entries.read().await;
        let cutoff = Utc::now() - Duration::days(RECENT_USE_DAYS);

        let owned: Vec<&AllowedIpEntry> = entries
            .iter()
            .filter(|e| e.principal_id == principal_id)
            .collect();

        AllowlistStats {
            total: owned.len(),
            active: owned.iter().filter(|e| e.is_active).count(),
            recently_used: owned
                .iter()
                .filter(|e| e.last_used_at.map(|t| t >= cutoff).unwrap_or(false))
                .count(),
        }
    }

    /// Rewrite the snapshot file; persistence failures are logged, never
    /// surfaced, so a full disk cannot take the allow-list offline
    async fn persist(&self, entries: &[AllowedIpEntry]) {
        let Some(path) = &self.persist_path else {
            return;
        };

        if let Err(e) = self.write_snapshot(path, entries).await {
            warn!("Failed to persist allow-list snapshot: {}", e);
        }
    }

    async fn write_snapshot(
        &self,
        path: &PathBuf,
        entries: &[AllowedIpEntry],
    ) -> SecurityResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut content = String::new();
        for entry in entries {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }

        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        tokio::fs::rename(&tmp, path).await?;

        Ok(())
    }
}
