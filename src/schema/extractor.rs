//! Field schema extraction with content-hash caching.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lopdf::Document;
use sha2::{Digest, Sha256};

use crate::error::ProcessingError;
use crate::schema::acroform;
use crate::types::{FieldDef, FieldRect};

/// Hex SHA-256 of a byte buffer; the extractor's cache key.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Cache counters exposed for observability.
#[derive(Debug, Clone, Default)]
pub struct SchemaStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Parses a PDF's interactive-form definition into an ordered field list.
///
/// Parsing is read-only and idempotent, so results are cached keyed by the
/// content hash of the input bytes. The cache is an owned repository,
/// shared explicitly by whoever constructs the extractor.
pub struct FieldSchemaExtractor {
    cache: DashMap<String, Arc<Vec<FieldDef>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for FieldSchemaExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldSchemaExtractor {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Extracts the field schema, consulting the cache first.
    pub fn extract(&self, bytes: &[u8]) -> Result<Arc<Vec<FieldDef>>, ProcessingError> {
        let key = content_hash(bytes);
        if let Some(cached) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let fields = Arc::new(parse_fields(bytes)?);
        self.cache.insert(key, fields.clone());
        Ok(fields)
    }

    pub fn stats(&self) -> SchemaStats {
        SchemaStats {
            entries: self.cache.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn parse_fields(bytes: &[u8]) -> Result<Vec<FieldDef>, ProcessingError> {
    let doc = Document::load_mem(bytes).map_err(ProcessingError::from)?;
    let fields = acroform::collect_fields(&doc)?;
    Ok(fields
        .into_iter()
        .map(|f| FieldDef {
            name: f.name,
            kind: f.kind,
            page_index: f.page_index.unwrap_or(0),
            rect: f.rect.unwrap_or_else(FieldRect::zero),
            required: f.required,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fixture_pdf, plain_pdf};
    use crate::types::FieldKind;

    #[test]
    fn extracts_fields_in_order() {
        let bytes = fixture_pdf();
        let extractor = FieldSchemaExtractor::new();
        let fields = extractor.extract(&bytes).unwrap();

        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["POA-A-GN", "POA-A-SN", "POA-A-CONSENT"]);

        assert_eq!(fields[0].kind, FieldKind::Text);
        assert!(fields[0].required);
        assert_eq!(fields[0].page_index, 0);
        assert!(fields[0].rect.x1 > fields[0].rect.x0);

        assert_eq!(fields[2].kind, FieldKind::Checkbox);
        assert!(!fields[2].required);
    }

    #[test]
    fn plain_pdf_yields_empty_list() {
        let extractor = FieldSchemaExtractor::new();
        let fields = extractor.extract(&plain_pdf()).unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn same_bytes_hit_the_cache() {
        let bytes = fixture_pdf();
        let extractor = FieldSchemaExtractor::new();
        extractor.extract(&bytes).unwrap();
        extractor.extract(&bytes).unwrap();

        let stats = extractor.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn garbage_bytes_are_a_processing_error() {
        let extractor = FieldSchemaExtractor::new();
        assert!(extractor.extract(b"not a pdf").is_err());
    }
}
