//! Append-only security audit log.
//!
//! Every Access Guard decision and every fill/flatten action produces one
//! entry, regardless of whether the primary operation succeeded. Entries
//! are never updated or deleted by this crate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Audit event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    Login,
    Logout,
    DocumentAccess,
    DocumentUpload,
    DataExport,
    SettingsChange,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::Login => "login",
            SecurityEventType::Logout => "logout",
            SecurityEventType::DocumentAccess => "document_access",
            SecurityEventType::DocumentUpload => "document_upload",
            SecurityEventType::DataExport => "data_export",
            SecurityEventType::SettingsChange => "settings_change",
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityLogEntry {
    pub event_type: SecurityEventType,
    pub actor_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
    pub is_success: bool,
    pub timestamp: DateTime<Utc>,
}

impl SecurityLogEntry {
    pub fn new(event_type: SecurityEventType, metadata: serde_json::Value) -> Self {
        Self {
            event_type,
            actor_id: None,
            ip_address: None,
            user_agent: None,
            metadata,
            is_success: true,
            timestamp: Utc::now(),
        }
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn request(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip;
        self.user_agent = user_agent;
        self
    }

    pub fn success(mut self, is_success: bool) -> Self {
        self.is_success = is_success;
        self
    }
}

/// Sink receiving audit records. Implementations must be append-only.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: SecurityLogEntry) -> Result<()>;
}

/// In-memory sink used by tests and by setups that forward logs elsewhere.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: RwLock<Vec<SecurityLogEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<SecurityLogEntry> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: SecurityLogEntry) -> Result<()> {
        self.entries.write().push(entry);
        Ok(())
    }
}

/// Durable sink writing to the `security_logs` table.
pub struct SqliteAuditSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditSink {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        {
            let conn = conn.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS security_logs (
                    id          TEXT PRIMARY KEY,
                    event_type  TEXT NOT NULL,
                    actor_id    TEXT,
                    ip_address  TEXT,
                    user_agent  TEXT,
                    metadata    TEXT NOT NULL,
                    is_success  INTEGER NOT NULL,
                    created_at  TEXT NOT NULL
                )",
            )
            .map_err(crate::error::StorageError::Database)?;
        }
        Ok(Self { conn })
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn record(&self, entry: SecurityLogEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO security_logs
                (id, event_type, actor_id, ip_address, user_agent, metadata, is_success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                uuid::Uuid::new_v4().to_string(),
                entry.event_type.as_str(),
                entry.actor_id,
                entry.ip_address,
                entry.user_agent,
                entry.metadata.to_string(),
                entry.is_success as i64,
                entry.timestamp.to_rfc3339(),
            ],
        )
        .map_err(crate::error::StorageError::Database)?;
        Ok(())
    }
}

/// Records an entry, downgrading sink failures to an error log so a broken
/// audit pipe never converts an otherwise successful operation.
pub async fn record_or_log(sink: &dyn AuditSink, entry: SecurityLogEntry) {
    let event = entry.event_type.as_str();
    if let Err(e) = sink.record(entry).await {
        tracing::error!("failed to record {} audit entry: {}", event, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_appends() {
        let sink = MemoryAuditSink::new();
        sink.record(
            SecurityLogEntry::new(
                SecurityEventType::DocumentAccess,
                serde_json::json!({"action": "pdf_fill"}),
            )
            .actor("admin-1")
            .success(false),
        )
        .await
        .unwrap();

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, SecurityEventType::DocumentAccess);
        assert!(!entries[0].is_success);
    }

    #[tokio::test]
    async fn sqlite_sink_inserts() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let sink = SqliteAuditSink::new(conn.clone()).unwrap();
        sink.record(SecurityLogEntry::new(
            SecurityEventType::Login,
            serde_json::json!({}),
        ))
        .await
        .unwrap();

        let count: i64 = conn
            .lock()
            .query_row("SELECT COUNT(*) FROM security_logs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
