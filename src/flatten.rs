//! Flatten Engine: burns current field values into page content and
//! removes the interactive form so the document can no longer be edited.
//!
//! The transformation is deterministic for a given input, so a rare
//! double-execution under race produces byte-identical output; the status
//! flip in the draft store decides the single winner.

use std::collections::BTreeMap;
use std::sync::Arc;

use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use serde_json::json;

use crate::audit::{record_or_log, AuditSink, SecurityEventType, SecurityLogEntry};
use crate::error::{NotFoundError, ProcessingError, Result};
use crate::guard::{Identity, RequestMeta};
use crate::schema::acroform::{self, AcroField};
use crate::store::{ArtifactStore, DraftStore};
use crate::types::{Draft, DraftStatus, FieldKind};

/// Font resource name injected for burned-in text.
const FLATTEN_FONT_KEY: &[u8] = b"FxHelv";
const FLATTEN_FONT_SIZE: i64 = 10;
/// Inset from the widget rectangle to the text origin.
const TEXT_INSET: f64 = 2.0;

/// Applies the flatten transformation to raw PDF bytes.
///
/// Documents without an interactive form are returned as-is: there is
/// nothing to burn and nothing to remove.
pub fn flatten_bytes(bytes: &[u8]) -> std::result::Result<Vec<u8>, ProcessingError> {
    let mut doc = Document::load_mem(bytes).map_err(ProcessingError::from)?;

    let fields = acroform::collect_fields(&doc)?;
    if acroform::acroform_dict(&doc)?.is_none() {
        return Ok(bytes.to_vec());
    }

    let page_ids: Vec<(u32, ObjectId)> = doc
        .get_pages()
        .into_iter()
        .map(|(no, id)| (no - 1, id))
        .collect();

    // Per-page draw operations for every field that has geometry and a
    // value worth burning.
    let mut per_page: BTreeMap<ObjectId, Vec<Operation>> = BTreeMap::new();
    for field in &fields {
        let (Some(rect), Some(page_index)) = (field.rect, field.page_index) else {
            continue;
        };
        let Some(page_id) = page_ids
            .iter()
            .find(|(index, _)| *index == page_index)
            .map(|(_, id)| *id)
        else {
            continue;
        };
        if let Some(ops) = draw_ops(field, rect.x0, rect.y0) {
            per_page.entry(page_id).or_default().extend(ops);
        }
    }

    let font_id = doc.add_object(Object::Dictionary(font_dict()));
    let burned_pages: Vec<ObjectId> = per_page.keys().copied().collect();
    for (page_id, operations) in per_page {
        append_content(&mut doc, page_id, operations)?;
    }
    for page_id in burned_pages {
        ensure_font_resource(&mut doc, page_id, font_id)?;
    }

    strip_widgets(&mut doc, &page_ids, &fields)?;
    remove_acroform(&mut doc)?;

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| ProcessingError::FlattenFailed(e.to_string()))?;
    Ok(out)
}

fn draw_ops(field: &AcroField, x: f64, y: f64) -> Option<Vec<Operation>> {
    let text = match field.kind {
        FieldKind::Text | FieldKind::Choice => {
            let value = field.value.as_deref()?.trim();
            if value.is_empty() {
                return None;
            }
            value.to_string()
        }
        FieldKind::Checkbox => {
            let value = field.value.as_deref().unwrap_or("Off");
            if value == "Off" || value.is_empty() {
                return None;
            }
            "X".to_string()
        }
    };

    let encoded = acroform::encode_winansi(&text);
    Some(vec![
        Operation::new("q", vec![]),
        Operation::new("BT", vec![]),
        Operation::new(
            "Tf",
            vec![
                Object::Name(FLATTEN_FONT_KEY.to_vec()),
                FLATTEN_FONT_SIZE.into(),
            ],
        ),
        Operation::new(
            "Td",
            vec![
                Object::Real(x + TEXT_INSET),
                Object::Real(y + TEXT_INSET),
            ],
        ),
        Operation::new(
            "Tj",
            vec![Object::String(encoded, lopdf::StringFormat::Literal)],
        ),
        Operation::new("ET", vec![]),
        Operation::new("Q", vec![]),
    ])
}

fn font_dict() -> Dictionary {
    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"Font".to_vec()));
    dict.set("Subtype", Object::Name(b"Type1".to_vec()));
    dict.set("BaseFont", Object::Name(b"Helvetica".to_vec()));
    dict.set("Encoding", Object::Name(b"WinAnsiEncoding".to_vec()));
    dict
}

/// Appends a fresh content stream to a page's `Contents`.
fn append_content(
    doc: &mut Document,
    page_id: ObjectId,
    operations: Vec<Operation>,
) -> std::result::Result<(), ProcessingError> {
    let encoded = Content { operations }
        .encode()
        .map_err(|e| ProcessingError::FlattenFailed(e.to_string()))?;
    let stream_id = doc.add_object(Object::Stream(Stream::new(Dictionary::new(), encoded)));

    let page = doc
        .get_object(page_id)
        .and_then(Object::as_dict)
        .map_err(ProcessingError::from)?;
    let new_contents = match page.get(b"Contents") {
        Ok(Object::Reference(existing)) => Object::Array(vec![
            Object::Reference(*existing),
            Object::Reference(stream_id),
        ]),
        Ok(Object::Array(existing)) => {
            let mut arr = existing.clone();
            arr.push(Object::Reference(stream_id));
            Object::Array(arr)
        }
        _ => Object::Reference(stream_id),
    };

    let page = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(ProcessingError::from)?;
    page.set("Contents", new_contents);
    Ok(())
}

/// Makes the burned-in font reachable from a page's resources.
fn ensure_font_resource(
    doc: &mut Document,
    page_id: ObjectId,
    font_id: ObjectId,
) -> std::result::Result<(), ProcessingError> {
    let resources_entry = doc
        .get_object(page_id)
        .and_then(Object::as_dict)
        .map_err(ProcessingError::from)?
        .get(b"Resources")
        .ok()
        .cloned();

    match resources_entry {
        Some(Object::Reference(res_id)) => {
            let res = doc
                .get_object_mut(res_id)
                .and_then(Object::as_dict_mut)
                .map_err(ProcessingError::from)?;
            insert_font_key(res, font_id);
        }
        Some(Object::Dictionary(mut res)) => {
            insert_font_key(&mut res, font_id);
            let page = doc
                .get_object_mut(page_id)
                .and_then(Object::as_dict_mut)
                .map_err(ProcessingError::from)?;
            page.set("Resources", Object::Dictionary(res));
        }
        _ => {
            let mut res = Dictionary::new();
            insert_font_key(&mut res, font_id);
            let page = doc
                .get_object_mut(page_id)
                .and_then(Object::as_dict_mut)
                .map_err(ProcessingError::from)?;
            page.set("Resources", Object::Dictionary(res));
        }
    }
    Ok(())
}

fn insert_font_key(resources: &mut Dictionary, font_id: ObjectId) {
    let mut fonts = match resources.get(b"Font") {
        Ok(Object::Dictionary(existing)) => existing.clone(),
        _ => Dictionary::new(),
    };
    fonts.set(FLATTEN_FONT_KEY, Object::Reference(font_id));
    resources.set("Font", Object::Dictionary(fonts));
}

/// Drops widget annotations so no interactive trace remains on the pages.
fn strip_widgets(
    doc: &mut Document,
    page_ids: &[(u32, ObjectId)],
    fields: &[AcroField],
) -> std::result::Result<(), ProcessingError> {
    for (_, page_id) in page_ids {
        let page = doc
            .get_object(*page_id)
            .and_then(Object::as_dict)
            .map_err(ProcessingError::from)?;
        let Ok(annots_obj) = page.get(b"Annots") else {
            continue;
        };
        let Ok(annots) = acroform::resolve(doc, annots_obj).and_then(Object::as_array) else {
            continue;
        };

        let mut kept = Vec::new();
        let mut dropped = Vec::new();
        for annot in annots {
            if let Object::Reference(id) = annot {
                let is_widget = doc
                    .get_object(*id)
                    .and_then(Object::as_dict)
                    .ok()
                    .and_then(|d| d.get(b"Subtype").ok().cloned())
                    .map(|s| matches!(s, Object::Name(ref n) if n == b"Widget"))
                    .unwrap_or(false);
                if is_widget {
                    dropped.push(*id);
                    continue;
                }
            }
            kept.push(annot.clone());
        }

        let page = doc
            .get_object_mut(*page_id)
            .and_then(Object::as_dict_mut)
            .map_err(ProcessingError::from)?;
        if kept.is_empty() {
            page.remove(b"Annots");
        } else {
            page.set("Annots", Object::Array(kept));
        }
        for id in dropped {
            doc.delete_object(id);
        }
    }

    // Field dictionaries that were not merged into their widgets.
    for field in fields {
        doc.delete_object(field.id);
    }
    Ok(())
}

fn remove_acroform(doc: &mut Document) -> std::result::Result<(), ProcessingError> {
    let acroform_id = acroform::acroform_ref(doc);
    let root_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(ProcessingError::from)?;
    let catalog = doc
        .get_object_mut(root_id)
        .and_then(Object::as_dict_mut)
        .map_err(ProcessingError::from)?;
    catalog.remove(b"AcroForm");
    if let Some(id) = acroform_id {
        doc.delete_object(id);
    }
    Ok(())
}

/// Orchestrates the `draft -> flattened` transition for stored drafts.
pub struct FlattenEngine {
    drafts: Arc<DraftStore>,
    artifacts: Arc<dyn ArtifactStore>,
    audit: Arc<dyn AuditSink>,
}

impl FlattenEngine {
    pub fn new(
        drafts: Arc<DraftStore>,
        artifacts: Arc<dyn ArtifactStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            drafts,
            artifacts,
            audit,
        }
    }

    /// Flattens a stored draft. Already-flattened drafts are returned
    /// unchanged without re-processing the PDF.
    pub async fn flatten(
        &self,
        draft_id: &str,
        actor: &Identity,
        meta: &RequestMeta,
    ) -> Result<Draft> {
        let result = self.flatten_inner(draft_id).await;

        let entry = SecurityLogEntry::new(
            SecurityEventType::DocumentAccess,
            json!({ "action": "pdf_flatten", "draftId": draft_id }),
        )
        .actor(actor.user_id.clone())
        .request(meta.ip_address.clone(), meta.user_agent.clone())
        .success(result.is_ok());
        record_or_log(self.audit.as_ref(), entry).await;

        result
    }

    async fn flatten_inner(&self, draft_id: &str) -> Result<Draft> {
        let draft = self
            .drafts
            .get(draft_id)?
            .ok_or_else(|| NotFoundError::Draft(draft_id.to_string()))?;
        if draft.status == DraftStatus::Flattened {
            tracing::debug!(draft_id, "draft already flattened, nothing to do");
            return Ok(draft);
        }

        let artifacts = self.artifacts.clone();
        let uri = draft.storage_uri.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let bytes = artifacts.load(&uri)?;
            let out = flatten_bytes(&bytes)?;
            artifacts.save(&uri, &out)?;
            Ok(())
        })
        .await
        .map_err(|e| ProcessingError::FlattenFailed(e.to_string()))??;

        let (draft, won) = self.drafts.mark_flattened(draft_id)?;
        if !won {
            tracing::debug!(draft_id, "concurrent flatten already won the transition");
        }
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fill::write_fields;
    use crate::testutil::{fixture_pdf, plain_pdf};

    #[test]
    fn flatten_burns_values_and_removes_the_form() {
        let mut values = BTreeMap::new();
        values.insert("POA-A-GN".to_string(), "JAN MAREK".to_string());
        values.insert("POA-A-CONSENT".to_string(), "yes".to_string());
        let filled = write_fields(&fixture_pdf(), &values).unwrap();

        let flat = flatten_bytes(&filled).unwrap();
        let doc = Document::load_mem(&flat).unwrap();

        assert!(acroform::acroform_dict(&doc).unwrap().is_none());
        assert!(acroform::collect_fields(&doc).unwrap().is_empty());

        let page_id = *doc.get_pages().get(&1).unwrap();
        let content = doc.get_page_content(page_id).unwrap();
        let content_str = String::from_utf8_lossy(&content);
        assert!(content_str.contains("JAN MAREK"));
        assert!(content_str.contains("FxHelv"));

        let page = doc.get_object(page_id).and_then(Object::as_dict).unwrap();
        assert!(page.get(b"Annots").is_err());
    }

    #[test]
    fn flatten_of_plain_pdf_is_identity() {
        let bytes = plain_pdf();
        assert_eq!(flatten_bytes(&bytes).unwrap(), bytes);
    }

    #[test]
    fn flatten_is_deterministic() {
        let mut values = BTreeMap::new();
        values.insert("POA-A-GN".to_string(), "JAN".to_string());
        let filled = write_fields(&fixture_pdf(), &values).unwrap();
        assert_eq!(flatten_bytes(&filled).unwrap(), flatten_bytes(&filled).unwrap());
    }

    #[test]
    fn garbage_bytes_fail_without_output() {
        assert!(flatten_bytes(b"not a pdf").is_err());
    }
}
