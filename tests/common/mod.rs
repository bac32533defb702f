//! Shared harness for the integration suites: a synthetic AcroForm
//! template, an in-memory database, a temp-dir artifact store and a fixed
//! token table.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use parking_lot::Mutex;
use rusqlite::Connection;

use acrofill::casedata::MemoryCaseData;
use acrofill::fonts::FontAssetService;
use acrofill::guard::{Identity, Role, StaticTokenProvider};
use acrofill::http::AppState;
use acrofill::mask::SensitivityPolicy;
use acrofill::store::{ArtifactStore, FsArtifactStore};
use acrofill::types::{MappingKind, Template, TemplateCategory};

pub const ADMIN_TOKEN: &str = "admin-token";
pub const CLIENT_TOKEN: &str = "client-token";
pub const TEMPLATE_ID: &str = "poa-template";

pub struct Harness {
    pub state: AppState,
    pub conn: Arc<Mutex<Connection>>,
    pub admin: Identity,
    _dir: tempfile::TempDir,
}

pub fn admin_identity() -> Identity {
    Identity {
        user_id: "admin-1".to_string(),
        email: Some("ops@example.com".to_string()),
        role: Role::Admin,
    }
}

/// Builds a one-page PDF with two text fields and a checkbox, the same
/// shape the POA template carries.
pub fn fixture_pdf() -> Vec<u8> {
    let mut doc = Document::with_version("1.5");

    let pages_id = doc.new_object_id();
    let page_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "Helv" => font_id },
    });

    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["Helv".into(), 12.into()]),
            Operation::new("Td", vec![50.into(), 780.into()]),
            Operation::new("Tj", vec![Object::string_literal("Power of Attorney")]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        content.encode().expect("encode fixture content"),
    ));

    let given_id = doc.add_object(dictionary! {
        "Type" => "Annot",
        "Subtype" => "Widget",
        "FT" => "Tx",
        "T" => Object::string_literal("POA-A-GN"),
        "Ff" => 2,
        "Rect" => vec![100.into(), 700.into(), 300.into(), 720.into()],
        "P" => page_id,
    });
    let surname_id = doc.add_object(dictionary! {
        "Type" => "Annot",
        "Subtype" => "Widget",
        "FT" => "Tx",
        "T" => Object::string_literal("POA-A-SN"),
        "Rect" => vec![100.into(), 670.into(), 300.into(), 690.into()],
        "P" => page_id,
    });
    let consent_id = doc.add_object(dictionary! {
        "Type" => "Annot",
        "Subtype" => "Widget",
        "FT" => "Btn",
        "T" => Object::string_literal("POA-A-CONSENT"),
        "V" => "Off",
        "AS" => "Off",
        "Rect" => vec![100.into(), 640.into(), 115.into(), 655.into()],
        "P" => page_id,
    });

    doc.objects.insert(
        page_id,
        Object::Dictionary(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            "Contents" => content_id,
            "Resources" => resources_id,
            "Annots" => vec![given_id.into(), surname_id.into(), consent_id.into()],
        }),
    );
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );

    let acroform_id = doc.add_object(dictionary! {
        "Fields" => vec![given_id.into(), surname_id.into(), consent_id.into()],
        "DA" => Object::string_literal("/Helv 0 Tf 0 g"),
    });
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
        "AcroForm" => acroform_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("serialize fixture pdf");
    bytes
}

pub fn case_data() -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    data.insert("applicantFirstNames".to_string(), "JAN MAREK".to_string());
    data.insert("passportNumber".to_string(), "AB1234567".to_string());
    data.insert("consentGiven".to_string(), "yes".to_string());
    data
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");

    let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(dir.path()));
    artifacts
        .save("/templates/poa-template.pdf", &fixture_pdf())
        .expect("seed template bytes");

    let fonts_dir = dir.path().join("fonts");
    std::fs::create_dir_all(&fonts_dir).expect("fonts dir");
    std::fs::write(fonts_dir.join("Inter-SemiBold.ttf"), b"ttf-fixture-bytes")
        .expect("seed font");

    let identity = StaticTokenProvider::new()
        .with_token(ADMIN_TOKEN, admin_identity())
        .with_token(
            CLIENT_TOKEN,
            Identity {
                user_id: "client-1".to_string(),
                email: None,
                role: Role::Client,
            },
        );

    let casedata = MemoryCaseData::new().with_case("C1", case_data());

    let conn = Arc::new(Mutex::new(
        Connection::open_in_memory().expect("in-memory database"),
    ));
    let state = AppState::from_parts(
        conn.clone(),
        Arc::new(identity),
        artifacts,
        Arc::new(casedata),
        SensitivityPolicy::default(),
        Vec::new(),
        FontAssetService::new(
            &fonts_dir,
            vec![
                "Inter-SemiBold.ttf".to_string(),
                "NotoSans-Regular.ttf".to_string(),
            ],
        ),
    )
    .expect("assemble state");

    state
        .templates
        .register(&Template {
            id: TEMPLATE_ID.to_string(),
            name: "POA Adult".to_string(),
            source_path: "/templates/poa-template.pdf".to_string(),
            category: TemplateCategory::Poa,
            description: None,
            is_active: true,
        })
        .expect("register template");

    let mut mapping = BTreeMap::new();
    mapping.insert("POA-A-GN".to_string(), "applicantFirstNames".to_string());
    mapping.insert("POA-A-SN".to_string(), "passportNumber".to_string());
    mapping.insert("POA-A-CONSENT".to_string(), "consentGiven".to_string());
    state
        .mappings
        .set(TEMPLATE_ID, mapping, MappingKind::Case, None)
        .expect("register mapping");

    Harness {
        state,
        conn,
        admin: admin_identity(),
        _dir: dir,
    }
}

/// Number of security-log rows, optionally filtered by outcome.
pub fn security_log_count(conn: &Arc<Mutex<Connection>>, success: Option<bool>) -> i64 {
    let conn = conn.lock();
    match success {
        Some(flag) => conn
            .query_row(
                "SELECT COUNT(*) FROM security_logs WHERE is_success = ?1",
                [flag as i64],
                |r| r.get(0),
            )
            .unwrap(),
        None => conn
            .query_row("SELECT COUNT(*) FROM security_logs", [], |r| r.get(0))
            .unwrap(),
    }
}

/// Metadata blobs of all security-log rows, newest last.
pub fn security_log_metadata(conn: &Arc<Mutex<Connection>>) -> Vec<String> {
    let conn = conn.lock();
    let mut stmt = conn
        .prepare("SELECT metadata FROM security_logs ORDER BY rowid")
        .unwrap();
    let rows = stmt.query_map([], |r| r.get::<_, String>(0)).unwrap();
    rows.map(|r| r.unwrap()).collect()
}
