//! Artifact (blob) store seam.
//!
//! Storage URIs look like `/cases/<caseId>/drafts/<file>.pdf`. Long-term
//! archival lives in an external blob service; this crate ships a plain
//! filesystem implementation that mirrors the URI layout under a root
//! directory.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{NotFoundError, Result, StorageError};
use crate::types::TemplateCategory;

/// A stored artifact as reported by listings.
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub updated_at: DateTime<Utc>,
}

impl ArtifactInfo {
    pub fn category(&self) -> TemplateCategory {
        TemplateCategory::from_filename(&self.name)
    }
}

/// Byte-level access to stored artifacts. Calls are synchronous; HTTP
/// handlers run them on blocking threads together with the PDF work.
pub trait ArtifactStore: Send + Sync {
    fn load(&self, uri: &str) -> Result<Vec<u8>>;
    fn save(&self, uri: &str, bytes: &[u8]) -> Result<()>;
    /// Lists the files directly under a URI prefix.
    fn list(&self, uri_prefix: &str) -> Result<Vec<ArtifactInfo>>;
    fn delete(&self, uri: &str) -> Result<()>;
}

/// Filesystem-backed artifact store.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf> {
        // URIs are sanitized upstream; reject traversal outright anyway.
        if uri.is_empty() || uri.contains("..") {
            return Err(StorageError::Artifact(format!("invalid storage URI: {uri}")).into());
        }
        Ok(self.root.join(uri.trim_start_matches('/')))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn load(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.resolve(uri)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NotFoundError::Artifact(uri.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, uri: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(uri)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        Ok(())
    }

    fn list(&self, uri_prefix: &str) -> Result<Vec<ArtifactInfo>> {
        let dir = self.resolve(uri_prefix)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push(ArtifactInfo {
                path: format!("{}/{}", uri_prefix.trim_end_matches('/'), name),
                name,
                size: meta.len(),
                updated_at: modified_time(&meta, entry.path().as_path()),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn delete(&self, uri: &str) -> Result<()> {
        let path = self.resolve(uri)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn modified_time(meta: &fs::Metadata, path: &Path) -> DateTime<Utc> {
    match meta.modified() {
        Ok(time) => DateTime::<Utc>::from(time),
        Err(_) => {
            tracing::debug!(path = %path.display(), "no mtime available, using now");
            Utc::now()
        }
    }
}
