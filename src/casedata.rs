//! Case-data collaborator seam.
//!
//! The authoritative case/client record store lives outside this engine.
//! The autofill endpoint resolves a case's merged key/value map through
//! this trait; fills receive their data record directly from the caller.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait CaseDataProvider: Send + Sync {
    /// Merged semantic key -> value map for a case. Unknown cases yield an
    /// empty map rather than an error.
    async fn autofill_map(&self, case_id: &str) -> Result<BTreeMap<String, String>>;
}

/// Reads one JSON document per case from a directory. The document is
/// either a flat string map or grouped sections (`case`, `client`, `form`,
/// ...) whose string entries are merged in document order.
pub struct FsCaseData {
    root: PathBuf,
}

impl FsCaseData {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl CaseDataProvider for FsCaseData {
    async fn autofill_map(&self, case_id: &str) -> Result<BTreeMap<String, String>> {
        let path = self.root.join(format!("{case_id}.json"));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            crate::error::Error::Config(format!("malformed case data for {case_id}: {e}"))
        })?;
        Ok(flatten_record(&value))
    }
}

fn flatten_record(value: &serde_json::Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Some(obj) = value.as_object() else {
        return out;
    };
    for (key, entry) in obj {
        match entry {
            serde_json::Value::String(s) => {
                out.insert(key.clone(), s.clone());
            }
            serde_json::Value::Object(section) => {
                for (k, v) in section {
                    if let serde_json::Value::String(s) = v {
                        out.insert(k.clone(), s.clone());
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Fixed-map provider for tests.
#[derive(Default)]
pub struct MemoryCaseData {
    cases: BTreeMap<String, BTreeMap<String, String>>,
}

impl MemoryCaseData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_case(mut self, case_id: &str, data: BTreeMap<String, String>) -> Self {
        self.cases.insert(case_id.to_string(), data);
        self
    }
}

#[async_trait]
impl CaseDataProvider for MemoryCaseData {
    async fn autofill_map(&self, case_id: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.cases.get(case_id).cloned().unwrap_or_default())
    }
}
