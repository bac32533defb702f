//! Engine-level integration: masking, version lineage and the one-way
//! flatten transition, driven without the HTTP layer.

mod common;

use std::collections::BTreeMap;

use acrofill::fill::FillRequest;
use acrofill::guard::RequestMeta;
use acrofill::schema::acroform;
use acrofill::types::DraftStatus;
use lopdf::Document;

use common::{case_data, harness, TEMPLATE_ID};

const MASK4: &str = "\u{2022}\u{2022}\u{2022}\u{2022}";

fn fill_request(data: BTreeMap<String, String>, mask: bool, flatten: bool) -> FillRequest {
    FillRequest {
        template_id: TEMPLATE_ID.to_string(),
        case_id: "C1".to_string(),
        data,
        mask_pii: mask,
        flatten,
        notes: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fill_masks_sensitive_values_and_allocates_version_one() {
    let h = harness();

    let outcome = h
        .state
        .fill
        .fill(
            fill_request(case_data(), true, false),
            &h.admin,
            &RequestMeta::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.draft.version, 1);
    assert_eq!(outcome.draft.status, DraftStatus::Draft);
    assert!(outcome.draft.is_sensitive_masked);
    assert!(outcome.incomplete_keys.is_empty());

    // The snapshot holds the masked value, never the raw one.
    assert_eq!(
        outcome.draft.field_data["POA-A-SN"],
        format!("{MASK4}4567")
    );
    assert_eq!(outcome.draft.field_data["POA-A-GN"], "JAN MAREK");

    // The persisted artifact carries the mask too.
    let bytes = h.state.artifacts.load(&outcome.draft.storage_uri).unwrap();
    let haystack = String::from_utf8_lossy(&bytes).into_owned();
    assert!(!haystack.contains("AB1234567"));

    let doc = Document::load_mem(&bytes).unwrap();
    let fields = acroform::collect_fields(&doc).unwrap();
    let surname = fields.iter().find(|f| f.name == "POA-A-SN").unwrap();
    assert!(surname.value.as_deref().unwrap().ends_with("4567"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unmasked_fill_keeps_raw_values() {
    let h = harness();

    let outcome = h
        .state
        .fill
        .fill(
            fill_request(case_data(), false, false),
            &h.admin,
            &RequestMeta::default(),
        )
        .await
        .unwrap();

    assert!(!outcome.draft.is_sensitive_masked);
    assert_eq!(outcome.draft.field_data["POA-A-SN"], "AB1234567");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_data_keys_are_incomplete_not_errors() {
    let h = harness();

    let mut data = case_data();
    data.remove("applicantFirstNames");
    let outcome = h
        .state
        .fill
        .fill(
            fill_request(data, true, false),
            &h.admin,
            &RequestMeta::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.incomplete_keys, vec!["applicantFirstNames"]);
    assert_eq!(outcome.draft.field_data["POA-A-GN"], "");
}

#[tokio::test(flavor = "multi_thread")]
async fn fifty_concurrent_fills_yield_gapless_versions() {
    let h = harness();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let fill = h.state.fill.clone();
        let admin = h.admin.clone();
        handles.push(tokio::spawn(async move {
            fill.fill(
                fill_request(case_data(), true, false),
                &admin,
                &RequestMeta::default(),
            )
            .await
            .unwrap()
            .draft
            .version
        }));
    }

    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap());
    }
    versions.sort_unstable();
    assert_eq!(versions, (1..=50).collect::<Vec<i64>>());

    let drafts = h.state.drafts.list("C1", TEMPLATE_ID).unwrap();
    assert_eq!(drafts.len(), 50);
}

#[tokio::test(flavor = "multi_thread")]
async fn flatten_is_one_way_idempotent_and_unblocks_the_next_version() {
    let h = harness();

    let outcome = h
        .state
        .fill
        .fill(
            fill_request(case_data(), true, false),
            &h.admin,
            &RequestMeta::default(),
        )
        .await
        .unwrap();
    let draft_id = outcome.draft.id.clone();

    let first = h
        .state
        .flatten
        .flatten(&draft_id, &h.admin, &RequestMeta::default())
        .await
        .unwrap();
    assert_eq!(first.status, DraftStatus::Flattened);
    assert_eq!(first.version, 1);

    // Second call: no error, no reprocessing, state unchanged.
    let second = h
        .state
        .flatten
        .flatten(&draft_id, &h.admin, &RequestMeta::default())
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.status, DraftStatus::Flattened);
    assert_eq!(second.field_data, first.field_data);

    // The stored artifact no longer carries an interactive form.
    let bytes = h.state.artifacts.load(&first.storage_uri).unwrap();
    let doc = Document::load_mem(&bytes).unwrap();
    assert!(acroform::acroform_dict(&doc).unwrap().is_none());

    // Further edits require a brand-new fill, which is version 2.
    let next = h
        .state
        .fill
        .fill(
            fill_request(case_data(), true, false),
            &h.admin,
            &RequestMeta::default(),
        )
        .await
        .unwrap();
    assert_eq!(next.draft.version, 2);
    assert_ne!(next.draft.id, first.id);
    assert_eq!(next.draft.status, DraftStatus::Draft);
}

#[tokio::test(flavor = "multi_thread")]
async fn fill_with_immediate_flatten_creates_a_flattened_draft() {
    let h = harness();

    let outcome = h
        .state
        .fill
        .fill(
            fill_request(case_data(), true, true),
            &h.admin,
            &RequestMeta::default(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.draft.status, DraftStatus::Flattened);

    let bytes = h.state.artifacts.load(&outcome.draft.storage_uri).unwrap();
    let doc = Document::load_mem(&bytes).unwrap();
    assert!(acroform::acroform_dict(&doc).unwrap().is_none());
    let page_id = *doc.get_pages().get(&1).unwrap();
    let content = doc.get_page_content(page_id).unwrap();
    assert!(String::from_utf8_lossy(&content).contains("JAN MAREK"));
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_template_fails_without_persisting_anything() {
    let h = harness();

    h.state
        .artifacts
        .save("/templates/poa-template.pdf", b"this is not a pdf")
        .unwrap();

    let err = h
        .state
        .fill
        .fill(
            fill_request(case_data(), true, false),
            &h.admin,
            &RequestMeta::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 500);

    assert!(h.state.drafts.list("C1", TEMPLATE_ID).unwrap().is_empty());
    assert_eq!(h.state.drafts.latest_version("C1", TEMPLATE_ID).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn every_fill_attempt_is_audited() {
    let h = harness();

    h.state
        .fill
        .fill(
            fill_request(case_data(), true, false),
            &h.admin,
            &RequestMeta::default(),
        )
        .await
        .unwrap();

    h.state
        .artifacts
        .save("/templates/poa-template.pdf", b"garbage")
        .unwrap();
    let _ = h
        .state
        .fill
        .fill(
            fill_request(case_data(), true, false),
            &h.admin,
            &RequestMeta::default(),
        )
        .await;

    let metadata = common::security_log_metadata(&h.conn);
    let fills: Vec<&String> = metadata
        .iter()
        .filter(|m| m.contains("pdf_fill"))
        .collect();
    assert_eq!(fills.len(), 2);
    assert_eq!(common::security_log_count(&h.conn, Some(false)), 1);
}
