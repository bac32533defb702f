//! Template registry.
//!
//! Templates are registered by administrative setup: either through this
//! repository's API or by the startup scan over the templates root of the
//! artifact store. Registered rows are immutable in practice; re-seeding
//! simply overwrites with identical values.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StorageError};
use crate::store::artifacts::ArtifactStore;
use crate::types::{Template, TemplateCategory};

pub struct TemplateStore {
    conn: Arc<Mutex<Connection>>,
}

impl TemplateStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        {
            let conn = conn.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS pdf_templates (
                    id          TEXT PRIMARY KEY,
                    name        TEXT NOT NULL,
                    source_path TEXT NOT NULL,
                    category    TEXT NOT NULL,
                    description TEXT,
                    is_active   INTEGER NOT NULL
                 )",
            )
            .map_err(StorageError::Database)?;
        }
        Ok(Self { conn })
    }

    pub fn register(&self, template: &Template) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO pdf_templates
                (id, name, source_path, category, description, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                template.id,
                template.name,
                template.source_path,
                template.category.as_str(),
                template.description,
                template.is_active as i64,
            ],
        )
        .map_err(StorageError::Database)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Template>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, source_path, category, description, is_active
               FROM pdf_templates WHERE id = ?1",
            params![id],
            |row| {
                let category_raw: String = row.get(3)?;
                Ok(Template {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    source_path: row.get(2)?,
                    category: TemplateCategory::parse(&category_raw),
                    description: row.get(4)?,
                    is_active: row.get::<_, i64>(5)? != 0,
                })
            },
        )
        .optional()
        .map_err(|e| StorageError::Database(e).into())
    }

    /// Registers every `.pdf` under the templates root of the artifact
    /// store. The file stem becomes the template id.
    pub fn seed_from_artifacts(
        &self,
        artifacts: &dyn ArtifactStore,
        template_uri_root: &str,
    ) -> Result<usize> {
        let mut seeded = 0;
        for info in artifacts.list(template_uri_root)? {
            let Some(stem) = info.name.strip_suffix(".pdf") else {
                continue;
            };
            self.register(&Template {
                id: stem.to_string(),
                name: stem.replace('_', " "),
                source_path: info.path.clone(),
                category: TemplateCategory::from_filename(&info.name),
                description: None,
                is_active: true,
            })?;
            seeded += 1;
        }
        tracing::info!(count = seeded, root = template_uri_root, "seeded template registry");
        Ok(seeded)
    }
}
