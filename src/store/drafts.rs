//! Draft persistence and monotonic version allocation.
//!
//! Versions are allocated inside an immediate transaction guarded by a
//! `UNIQUE (case_id, template_id, version)` index. The connection lock
//! serializes writers in-process; the unique index keeps the invariant if
//! another process shares the database file, in which case the losing
//! insert is retried with a freshly computed version.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::error::{NotFoundError, Result, StorageError};
use crate::types::{Draft, DraftStatus};

const VERSION_ALLOC_ATTEMPTS: usize = 5;

/// Input for a draft row; version, URIs and timestamps are allocated by
/// the store.
#[derive(Debug, Clone)]
pub struct NewDraft {
    pub case_id: String,
    pub template_id: String,
    pub status: DraftStatus,
    pub field_data: BTreeMap<String, String>,
    pub is_sensitive_masked: bool,
    pub notes: Option<String>,
    pub created_by: String,
}

/// Deterministic artifact location for a draft version. Never collides
/// because the version number is unique per case+template.
pub fn storage_uri(case_id: &str, template_id: &str, version: i64) -> String {
    format!("/cases/{case_id}/drafts/{template_id}_v{version}.pdf")
}

/// Append-only draft repository. The single permitted row mutation is the
/// `draft -> flattened` status flip.
pub struct DraftStore {
    conn: Arc<Mutex<Connection>>,
}

impl DraftStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        {
            let conn = conn.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS pdf_drafts (
                    id                  TEXT PRIMARY KEY,
                    case_id             TEXT NOT NULL,
                    template_id         TEXT NOT NULL,
                    filename            TEXT NOT NULL,
                    version             INTEGER NOT NULL,
                    storage_uri         TEXT NOT NULL,
                    status              TEXT NOT NULL
                                        CHECK (status IN ('draft', 'flattened')),
                    field_data          TEXT NOT NULL,
                    is_sensitive_masked INTEGER NOT NULL,
                    notes               TEXT,
                    created_by          TEXT NOT NULL,
                    created_at          TEXT NOT NULL
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS idx_drafts_case_template_version
                    ON pdf_drafts (case_id, template_id, version);",
            )
            .map_err(StorageError::Database)?;
        }
        Ok(Self { conn })
    }

    /// Creates a new draft row with the next version for its
    /// `(case_id, template_id)` pair.
    ///
    /// `persist` runs between the row insert and the commit, so the bytes
    /// for the allocated storage URI exist before the row becomes visible;
    /// if it fails the transaction rolls back and no version is consumed.
    pub fn create<F>(&self, new: NewDraft, persist: F) -> Result<Draft>
    where
        F: Fn(&Draft) -> Result<()>,
    {
        for _attempt in 0..VERSION_ALLOC_ATTEMPTS {
            let mut guard = self.conn.lock();
            let tx = guard
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StorageError::Database)?;

            let version: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM pdf_drafts
                      WHERE case_id = ?1 AND template_id = ?2",
                    params![new.case_id, new.template_id],
                    |row| row.get(0),
                )
                .map_err(StorageError::Database)?;

            let draft = Draft {
                id: Uuid::new_v4().to_string(),
                case_id: new.case_id.clone(),
                template_id: new.template_id.clone(),
                filename: format!("{}_filled_v{}.pdf", new.template_id, version),
                version,
                storage_uri: storage_uri(&new.case_id, &new.template_id, version),
                status: new.status,
                field_data: new.field_data.clone(),
                is_sensitive_masked: new.is_sensitive_masked,
                notes: new.notes.clone(),
                created_by: new.created_by.clone(),
                created_at: Utc::now(),
            };

            let field_data_json = serde_json::to_string(&draft.field_data)
                .map_err(|e| StorageError::Artifact(e.to_string()))?;
            let inserted = tx.execute(
                "INSERT INTO pdf_drafts
                    (id, case_id, template_id, filename, version, storage_uri,
                     status, field_data, is_sensitive_masked, notes, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    draft.id,
                    draft.case_id,
                    draft.template_id,
                    draft.filename,
                    draft.version,
                    draft.storage_uri,
                    draft.status.as_str(),
                    field_data_json,
                    draft.is_sensitive_masked as i64,
                    draft.notes,
                    draft.created_by,
                    draft.created_at.to_rfc3339(),
                ],
            );

            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    // Another writer took this version; recompute and retry.
                    drop(tx);
                    drop(guard);
                    tracing::debug!(
                        case_id = %new.case_id,
                        template_id = %new.template_id,
                        version,
                        "version conflict, retrying allocation"
                    );
                    continue;
                }
                Err(e) => return Err(StorageError::Database(e).into()),
            }

            persist(&draft)?;
            tx.commit().map_err(StorageError::Database)?;
            return Ok(draft);
        }

        Err(StorageError::VersionContention {
            case_id: new.case_id,
            template_id: new.template_id,
        }
        .into())
    }

    pub fn get(&self, id: &str) -> Result<Option<Draft>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, case_id, template_id, filename, version, storage_uri,
                    status, field_data, is_sensitive_masked, notes, created_by, created_at
               FROM pdf_drafts WHERE id = ?1",
            params![id],
            row_to_draft,
        )
        .optional()
        .map_err(|e| StorageError::Database(e).into())
    }

    /// Flips `status` to `flattened` if and only if the draft is still in
    /// the editable state. Returns the row plus whether this call won the
    /// transition; a concurrent or repeated call observes `false` and the
    /// already-flattened row.
    pub fn mark_flattened(&self, id: &str) -> Result<(Draft, bool)> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE pdf_drafts SET status = 'flattened'
                  WHERE id = ?1 AND status = 'draft'",
                params![id],
            )
            .map_err(StorageError::Database)?;

        let draft = conn
            .query_row(
                "SELECT id, case_id, template_id, filename, version, storage_uri,
                        status, field_data, is_sensitive_masked, notes, created_by, created_at
                   FROM pdf_drafts WHERE id = ?1",
                params![id],
                row_to_draft,
            )
            .optional()
            .map_err(StorageError::Database)?
            .ok_or_else(|| NotFoundError::Draft(id.to_string()))?;

        Ok((draft, updated == 1))
    }

    pub fn latest_version(&self, case_id: &str, template_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM pdf_drafts
              WHERE case_id = ?1 AND template_id = ?2",
            params![case_id, template_id],
            |row| row.get(0),
        )
        .map_err(|e| StorageError::Database(e).into())
    }

    pub fn list(&self, case_id: &str, template_id: &str) -> Result<Vec<Draft>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, case_id, template_id, filename, version, storage_uri,
                        status, field_data, is_sensitive_masked, notes, created_by, created_at
                   FROM pdf_drafts
                  WHERE case_id = ?1 AND template_id = ?2
                  ORDER BY version",
            )
            .map_err(StorageError::Database)?;
        let rows = stmt
            .query_map(params![case_id, template_id], row_to_draft)
            .map_err(StorageError::Database)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(StorageError::Database)?);
        }
        Ok(out)
    }
}

fn row_to_draft(row: &Row<'_>) -> rusqlite::Result<Draft> {
    let status_raw: String = row.get(6)?;
    let field_data_raw: String = row.get(7)?;
    let created_at_raw: String = row.get(11)?;

    Ok(Draft {
        id: row.get(0)?,
        case_id: row.get(1)?,
        template_id: row.get(2)?,
        filename: row.get(3)?,
        version: row.get(4)?,
        storage_uri: row.get(5)?,
        status: DraftStatus::parse(&status_raw).unwrap_or(DraftStatus::Draft),
        field_data: serde_json::from_str(&field_data_raw).unwrap_or_default(),
        is_sensitive_masked: row.get::<_, i64>(8)? != 0,
        notes: row.get(9)?,
        created_by: row.get(10)?,
        created_at: DateTime::parse_from_rfc3339(&created_at_raw)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn store() -> DraftStore {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        DraftStore::new(conn).unwrap()
    }

    fn new_draft(case_id: &str) -> NewDraft {
        NewDraft {
            case_id: case_id.to_string(),
            template_id: "poa-template".to_string(),
            status: DraftStatus::Draft,
            field_data: BTreeMap::new(),
            is_sensitive_masked: true,
            notes: None,
            created_by: "admin-1".to_string(),
        }
    }

    #[test]
    fn versions_start_at_one_and_increase() {
        let store = store();
        let d1 = store.create(new_draft("C1"), |_| Ok(())).unwrap();
        let d2 = store.create(new_draft("C1"), |_| Ok(())).unwrap();
        let other = store.create(new_draft("C2"), |_| Ok(())).unwrap();

        assert_eq!(d1.version, 1);
        assert_eq!(d2.version, 2);
        assert_eq!(other.version, 1);
        assert_ne!(d1.id, d2.id);
        assert_eq!(d1.storage_uri, "/cases/C1/drafts/poa-template_v1.pdf");
        assert_eq!(store.latest_version("C1", "poa-template").unwrap(), 2);
    }

    #[test]
    fn failed_persist_consumes_no_version() {
        let store = store();
        let err = store.create(new_draft("C1"), |_| {
            Err(Error::Storage(StorageError::Artifact("disk full".into())))
        });
        assert!(err.is_err());
        assert_eq!(store.latest_version("C1", "poa-template").unwrap(), 0);

        let d = store.create(new_draft("C1"), |_| Ok(())).unwrap();
        assert_eq!(d.version, 1);
    }

    #[test]
    fn flatten_flip_is_one_way_and_idempotent() {
        let store = store();
        let draft = store.create(new_draft("C1"), |_| Ok(())).unwrap();

        let (first, won_first) = store.mark_flattened(&draft.id).unwrap();
        assert!(won_first);
        assert_eq!(first.status, DraftStatus::Flattened);
        assert_eq!(first.version, draft.version);

        let (second, won_second) = store.mark_flattened(&draft.id).unwrap();
        assert!(!won_second);
        assert_eq!(second.status, DraftStatus::Flattened);
        assert_eq!(second.field_data, draft.field_data);
    }

    #[test]
    fn unknown_draft_is_not_found() {
        let store = store();
        let err = store.mark_flattened("missing").unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn concurrent_creates_yield_gapless_versions() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.create(new_draft("C1"), |_| Ok(())).unwrap().version
            }));
        }
        let mut versions: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        versions.sort_unstable();
        assert_eq!(versions, (1..=16).collect::<Vec<i64>>());
    }
}
