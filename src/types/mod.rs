//! Domain types for templates, mappings, drafts and case documents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bounding rectangle of a form field widget, in PDF user-space units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldRect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl FieldRect {
    pub fn zero() -> Self {
        Self {
            x0: 0.0,
            y0: 0.0,
            x1: 0.0,
            y1: 0.0,
        }
    }
}

/// Interactive form field categories recognized by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Checkbox,
    Choice,
}

/// One form field as discovered in a template's AcroForm dictionary.
/// Produced by extraction, never hand-edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub page_index: u32,
    pub rect: FieldRect,
    pub required: bool,
}

/// Template categories used by the case document listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateCategory {
    Poa,
    Citizenship,
    Registry,
    Other,
}

impl TemplateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateCategory::Poa => "poa",
            TemplateCategory::Citizenship => "citizenship",
            TemplateCategory::Registry => "registry",
            TemplateCategory::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "poa" => TemplateCategory::Poa,
            "citizenship" => TemplateCategory::Citizenship,
            "registry" => TemplateCategory::Registry,
            _ => TemplateCategory::Other,
        }
    }

    /// Best-effort categorization from a document file name.
    pub fn from_filename(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("poa") || lower.contains("power_of_attorney") {
            TemplateCategory::Poa
        } else if lower.contains("citizenship") || lower.contains("oby") {
            TemplateCategory::Citizenship
        } else if lower.contains("registry") || lower.contains("umiejscowienie") {
            TemplateCategory::Registry
        } else {
            TemplateCategory::Other
        }
    }
}

/// A registered government form template. Immutable once registered; the
/// field list is derived from the bytes at `source_path` on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub source_path: String,
    pub category: TemplateCategory,
    pub description: Option<String>,
    pub is_active: bool,
}

/// Which data source a mapping draws its semantic keys from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingKind {
    Case,
    Client,
    Form,
    Custom,
}

impl MappingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingKind::Case => "case",
            MappingKind::Client => "client",
            MappingKind::Form => "form",
            MappingKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "client" => MappingKind::Client,
            "form" => MappingKind::Form,
            "custom" => MappingKind::Custom,
            _ => MappingKind::Case,
        }
    }
}

/// Per-template dictionary from PDF field names to semantic data keys.
/// One active mapping per template; replacing it never alters drafts that
/// were already created from the previous mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub template_id: String,
    pub fields: BTreeMap<String, String>,
    pub kind: MappingKind,
    pub description: Option<String>,
}

impl Mapping {
    /// Empty mapping for templates that have none registered yet. Filling
    /// with it produces an unfilled copy, which is a valid outcome.
    pub fn empty(template_id: &str) -> Self {
        Self {
            template_id: template_id.to_string(),
            fields: BTreeMap::new(),
            kind: MappingKind::Case,
            description: None,
        }
    }
}

/// Returned by the status transition function when a draft has already
/// left the editable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("draft is already flattened")]
pub struct AlreadyFlattened;

/// Lifecycle state of a draft. The only legal transition is
/// `Draft -> Flattened`; there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    Draft,
    Flattened,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Draft => "draft",
            DraftStatus::Flattened => "flattened",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(DraftStatus::Draft),
            "flattened" => Some(DraftStatus::Flattened),
            _ => None,
        }
    }

    /// The one-way transition. Rejects any attempt to leave `Flattened`.
    pub fn transition_to_flattened(self) -> Result<Self, AlreadyFlattened> {
        match self {
            DraftStatus::Draft => Ok(DraftStatus::Flattened),
            DraftStatus::Flattened => Err(AlreadyFlattened),
        }
    }
}

/// One versioned, case+template-scoped filled artifact. `field_data` is a
/// snapshot taken at fill time and is immutable afterwards; a new fill
/// always creates a new row with the next version number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
    pub case_id: String,
    pub template_id: String,
    pub filename: String,
    pub version: i64,
    pub storage_uri: String,
    pub status: DraftStatus,
    pub field_data: BTreeMap<String, String>,
    pub is_sensitive_masked: bool,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A case document as reported by the listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CasePdf {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub updated_at: DateTime<Utc>,
    pub category: TemplateCategory,
}

/// Result of a fill operation: the freshly created draft plus the data
/// keys the supplied record could not satisfy (blank in the output).
#[derive(Debug, Clone)]
pub struct FillOutcome {
    pub draft: Draft,
    pub incomplete_keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transition_is_one_way() {
        assert_eq!(
            DraftStatus::Draft.transition_to_flattened(),
            Ok(DraftStatus::Flattened)
        );
        assert_eq!(
            DraftStatus::Flattened.transition_to_flattened(),
            Err(AlreadyFlattened)
        );
    }

    #[test]
    fn category_from_filename() {
        assert_eq!(
            TemplateCategory::from_filename("POA_Adult.pdf"),
            TemplateCategory::Poa
        );
        assert_eq!(
            TemplateCategory::from_filename("Citizenship_Application.pdf"),
            TemplateCategory::Citizenship
        );
        assert_eq!(
            TemplateCategory::from_filename("notes.pdf"),
            TemplateCategory::Other
        );
    }
}
