//! Fill Engine: resolves mapped case data, applies the masking policy and
//! writes values into a fresh copy of the template PDF.

use std::collections::BTreeMap;
use std::sync::Arc;

use lopdf::{Document, Object};
use serde_json::json;

use crate::audit::{record_or_log, AuditSink, SecurityEventType, SecurityLogEntry};
use crate::error::{NotFoundError, ProcessingError, Result};
use crate::flatten::flatten_bytes;
use crate::guard::{Identity, RequestMeta};
use crate::mask::SensitivityPolicy;
use crate::schema::acroform;
use crate::store::{ArtifactStore, DraftStore, MappingStore, NewDraft, TemplateStore};
use crate::types::{DraftStatus, FieldKind, FillOutcome, Mapping};

/// One fill request, as accepted by the engine.
#[derive(Debug, Clone)]
pub struct FillRequest {
    pub template_id: String,
    pub case_id: String,
    pub data: BTreeMap<String, String>,
    pub mask_pii: bool,
    pub flatten: bool,
    pub notes: Option<String>,
}

pub struct FillEngine {
    templates: Arc<TemplateStore>,
    mappings: Arc<MappingStore>,
    drafts: Arc<DraftStore>,
    artifacts: Arc<dyn ArtifactStore>,
    policy: SensitivityPolicy,
    audit: Arc<dyn AuditSink>,
}

impl FillEngine {
    pub fn new(
        templates: Arc<TemplateStore>,
        mappings: Arc<MappingStore>,
        drafts: Arc<DraftStore>,
        artifacts: Arc<dyn ArtifactStore>,
        policy: SensitivityPolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            templates,
            mappings,
            drafts,
            artifacts,
            policy,
            audit,
        }
    }

    /// Fills a template for a case and persists the result as the next
    /// draft version. Emits one audit record whether or not it succeeds.
    pub async fn fill(
        &self,
        req: FillRequest,
        actor: &Identity,
        meta: &RequestMeta,
    ) -> Result<FillOutcome> {
        let result = self.fill_inner(&req, actor).await;

        let entry = SecurityLogEntry::new(
            SecurityEventType::DocumentAccess,
            json!({
                "action": "pdf_fill",
                "templateId": req.template_id,
                "caseId": req.case_id,
                "masked": req.mask_pii,
                "flattened": req.flatten,
            }),
        )
        .actor(actor.user_id.clone())
        .request(meta.ip_address.clone(), meta.user_agent.clone())
        .success(result.is_ok());
        record_or_log(self.audit.as_ref(), entry).await;

        result
    }

    async fn fill_inner(&self, req: &FillRequest, actor: &Identity) -> Result<FillOutcome> {
        let template = self
            .templates
            .get(&req.template_id)?
            .ok_or_else(|| NotFoundError::Template(req.template_id.clone()))?;

        // A template with no registered mapping fills to an untouched copy.
        let mapping = self
            .mappings
            .get(&req.template_id)?
            .unwrap_or_else(|| Mapping::empty(&req.template_id));

        let (resolved, incomplete_keys) = self.resolve_values(&mapping, req)?;

        let artifacts = self.artifacts.clone();
        let source_path = template.source_path.clone();
        let values = resolved.clone();
        let flatten_now = req.flatten;
        let output = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let bytes = artifacts.load(&source_path)?;
            let filled = write_fields(&bytes, &values)?;
            if flatten_now {
                Ok(flatten_bytes(&filled)?)
            } else {
                Ok(filled)
            }
        })
        .await
        .map_err(|e| ProcessingError::FillFailed(e.to_string()))??;

        let new = NewDraft {
            case_id: req.case_id.clone(),
            template_id: req.template_id.clone(),
            status: if req.flatten {
                DraftStatus::Flattened
            } else {
                DraftStatus::Draft
            },
            field_data: resolved,
            is_sensitive_masked: req.mask_pii,
            notes: req.notes.clone(),
            created_by: actor.user_id.clone(),
        };

        let drafts = self.drafts.clone();
        let artifacts = self.artifacts.clone();
        let draft = tokio::task::spawn_blocking(move || {
            drafts.create(new, |draft| artifacts.save(&draft.storage_uri, &output))
        })
        .await
        .map_err(|e| ProcessingError::FillFailed(e.to_string()))??;

        tracing::info!(
            case_id = %draft.case_id,
            template_id = %draft.template_id,
            version = draft.version,
            status = draft.status.as_str(),
            "draft created"
        );
        Ok(FillOutcome {
            draft,
            incomplete_keys,
        })
    }

    /// Resolves each mapped field from the supplied data record, masking
    /// sensitive values. A masking fault aborts the whole fill.
    fn resolve_values(
        &self,
        mapping: &Mapping,
        req: &FillRequest,
    ) -> Result<(BTreeMap<String, String>, Vec<String>)> {
        let mut resolved = BTreeMap::new();
        let mut incomplete = Vec::new();

        for (pdf_field, data_key) in &mapping.fields {
            let raw = match req.data.get(data_key) {
                Some(value) => value.clone(),
                None => {
                    incomplete.push(data_key.clone());
                    String::new()
                }
            };
            let value = if req.mask_pii
                && !raw.is_empty()
                && self.policy.classify(data_key).is_some()
            {
                self.policy.mask(data_key, &raw)?
            } else {
                raw
            };
            resolved.insert(pdf_field.clone(), value);
        }

        incomplete.sort();
        incomplete.dedup();
        Ok((resolved, incomplete))
    }
}

/// Writes values into a PDF's form fields, leaving every other object
/// untouched. Fields absent from `values` keep whatever they held.
pub fn write_fields(
    bytes: &[u8],
    values: &BTreeMap<String, String>,
) -> std::result::Result<Vec<u8>, ProcessingError> {
    let mut doc = Document::load_mem(bytes).map_err(ProcessingError::from)?;

    let fields = acroform::collect_fields(&doc)?;
    let mut wrote = false;
    for field in &fields {
        let Some(value) = values.get(&field.name) else {
            continue;
        };
        let dict = doc
            .get_object_mut(field.id)
            .and_then(Object::as_dict_mut)
            .map_err(ProcessingError::from)?;
        match field.kind {
            FieldKind::Text | FieldKind::Choice => {
                dict.set(
                    "V",
                    Object::String(
                        acroform::encode_winansi(value),
                        lopdf::StringFormat::Literal,
                    ),
                );
            }
            FieldKind::Checkbox => {
                let state: &[u8] = if checkbox_on(value) { b"Yes" } else { b"Off" };
                dict.set("V", Object::Name(state.to_vec()));
                dict.set("AS", Object::Name(state.to_vec()));
            }
        }
        wrote = true;
    }

    // Viewers regenerate appearances for the freshly written values.
    if wrote {
        set_need_appearances(&mut doc)?;
    }

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| ProcessingError::FillFailed(e.to_string()))?;
    Ok(out)
}

fn checkbox_on(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "off" | "false" | "no" | "0"
    )
}

fn set_need_appearances(doc: &mut Document) -> std::result::Result<(), ProcessingError> {
    if let Some(form_id) = acroform::acroform_ref(doc) {
        let form = doc
            .get_object_mut(form_id)
            .and_then(Object::as_dict_mut)
            .map_err(ProcessingError::from)?;
        form.set("NeedAppearances", Object::Boolean(true));
        return Ok(());
    }

    // Inline AcroForm dictionary in the catalog.
    let root_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(ProcessingError::from)?;
    let catalog = doc
        .get_object_mut(root_id)
        .and_then(Object::as_dict_mut)
        .map_err(ProcessingError::from)?;
    if let Ok(form) = catalog.get_mut(b"AcroForm").and_then(Object::as_dict_mut) {
        form.set("NeedAppearances", Object::Boolean(true));
    }
    Ok(())
}
