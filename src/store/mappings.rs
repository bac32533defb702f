//! Per-template autofill mapping repository.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StorageError};
use crate::types::{Mapping, MappingKind};

/// Holds the active mapping for each template. `set` replaces the previous
/// mapping; drafts created under the old one are unaffected.
pub struct MappingStore {
    conn: Arc<Mutex<Connection>>,
}

impl MappingStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        {
            let conn = conn.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS pdf_mappings (
                    template_id TEXT PRIMARY KEY,
                    fields      TEXT NOT NULL,
                    kind        TEXT NOT NULL,
                    description TEXT,
                    updated_at  TEXT NOT NULL
                 )",
            )
            .map_err(StorageError::Database)?;
        }
        Ok(Self { conn })
    }

    pub fn get(&self, template_id: &str) -> Result<Option<Mapping>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT template_id, fields, kind, description
               FROM pdf_mappings WHERE template_id = ?1",
            params![template_id],
            |row| {
                let fields_raw: String = row.get(1)?;
                let kind_raw: String = row.get(2)?;
                Ok(Mapping {
                    template_id: row.get(0)?,
                    fields: serde_json::from_str(&fields_raw).unwrap_or_default(),
                    kind: MappingKind::parse(&kind_raw),
                    description: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| StorageError::Database(e).into())
    }

    pub fn set(
        &self,
        template_id: &str,
        fields: BTreeMap<String, String>,
        kind: MappingKind,
        description: Option<String>,
    ) -> Result<Mapping> {
        let mapping = Mapping {
            template_id: template_id.to_string(),
            fields,
            kind,
            description,
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pdf_mappings (template_id, fields, kind, description, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (template_id) DO UPDATE SET
                fields = excluded.fields,
                kind = excluded.kind,
                description = excluded.description,
                updated_at = excluded.updated_at",
            params![
                mapping.template_id,
                serde_json::to_string(&mapping.fields)
                    .map_err(|e| StorageError::Artifact(e.to_string()))?,
                mapping.kind.as_str(),
                mapping.description,
                chrono::Utc::now().to_rfc3339(),
            ],
        )
        .map_err(StorageError::Database)?;
        Ok(mapping)
    }
}
