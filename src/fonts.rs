//! Font asset service.
//!
//! Serves a small fixed allow-list of embeddable fonts by exact file name.
//! Anything else is a 404, whether or not a file of that name exists on
//! disk. Allow-listed bytes never change at runtime, so responses carry a
//! stable content identifier and long-lived cache directives.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::{NotFoundError, Result};

/// Cache directive attached to font responses.
pub const FONT_CACHE_CONTROL: &str = "public, max-age=31536000";

#[derive(Debug, Clone)]
pub struct FontAsset {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Hex SHA-256 of the bytes; used as the ETag.
    pub etag: String,
}

pub struct FontAssetService {
    font_dir: PathBuf,
    allowed: Vec<String>,
    cache: DashMap<String, Arc<FontAsset>>,
}

impl FontAssetService {
    pub fn new(font_dir: impl Into<PathBuf>, allowed: Vec<String>) -> Self {
        Self {
            font_dir: font_dir.into(),
            allowed,
            cache: DashMap::new(),
        }
    }

    /// Returns the named font if and only if it is allow-listed and
    /// present. Both failure modes are the same 404.
    pub fn get(&self, name: &str) -> Result<Arc<FontAsset>> {
        if !self.allowed.iter().any(|a| a == name) {
            return Err(NotFoundError::Font(name.to_string()).into());
        }
        if let Some(asset) = self.cache.get(name) {
            return Ok(asset.clone());
        }

        let path = self.font_dir.join(name);
        let bytes = std::fs::read(&path)
            .map_err(|_| NotFoundError::Font(name.to_string()))?;
        let asset = Arc::new(FontAsset {
            name: name.to_string(),
            etag: hex::encode(Sha256::digest(&bytes)),
            bytes,
        });
        self.cache.insert(name.to_string(), asset.clone());
        Ok(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &std::path::Path) -> FontAssetService {
        FontAssetService::new(
            dir,
            vec![
                "Inter-SemiBold.ttf".to_string(),
                "NotoSans-Regular.ttf".to_string(),
            ],
        )
    }

    #[test]
    fn unlisted_font_is_404_even_if_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Comic.ttf"), b"ttf-bytes").unwrap();
        let svc = service(dir.path());
        assert_eq!(svc.get("Comic.ttf").unwrap_err().status(), 404);
    }

    #[test]
    fn listed_but_missing_font_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        assert_eq!(svc.get("Inter-SemiBold.ttf").unwrap_err().status(), 404);
    }

    #[test]
    fn listed_font_is_served_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Inter-SemiBold.ttf"), b"ttf-bytes").unwrap();
        let svc = service(dir.path());

        let first = svc.get("Inter-SemiBold.ttf").unwrap();
        assert_eq!(first.bytes, b"ttf-bytes");
        assert_eq!(first.etag.len(), 64);

        // Cached copy survives deletion of the backing file.
        std::fs::remove_file(dir.path().join("Inter-SemiBold.ttf")).unwrap();
        let second = svc.get("Inter-SemiBold.ttf").unwrap();
        assert_eq!(second.etag, first.etag);
    }
}
