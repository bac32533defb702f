//! HTTP surface of the workbench: an axum router over the engine.
//!
//! Every endpoint passes through the Access Guard first; handlers then
//! run the PDF work on blocking threads and translate engine errors into
//! JSON error responses.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::audit::SqliteAuditSink;
use crate::casedata::{CaseDataProvider, FsCaseData};
use crate::config::AppConfig;
use crate::error::{Error, ProcessingError, Result};
use crate::fill::{FillEngine, FillRequest};
use crate::flatten::FlattenEngine;
use crate::fonts::{FontAssetService, FONT_CACHE_CONTROL};
use crate::guard::{AccessGuard, IdentityProvider, RequestMeta};
use crate::mask::SensitivityPolicy;
use crate::schema::FieldSchemaExtractor;
use crate::store::{
    ArtifactStore, DraftStore, FsArtifactStore, MappingStore, TemplateStore,
};
use crate::types::{CasePdf, FieldDef, MappingKind};

/// Shared application state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub guard: Arc<AccessGuard>,
    pub extractor: Arc<FieldSchemaExtractor>,
    pub templates: Arc<TemplateStore>,
    pub mappings: Arc<MappingStore>,
    pub drafts: Arc<DraftStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub casedata: Arc<dyn CaseDataProvider>,
    pub fill: Arc<FillEngine>,
    pub flatten: Arc<FlattenEngine>,
    pub fonts: Arc<FontAssetService>,
}

impl AppState {
    /// Wires the full engine from configuration: one SQLite connection
    /// shared by the repositories and audit sink, a filesystem artifact
    /// store, and the template registry seeded from the templates root.
    pub fn from_config(
        config: &AppConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        if let Some(parent) = config.storage.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Arc::new(Mutex::new(
            Connection::open(&config.storage.db_path)
                .map_err(crate::error::StorageError::Database)?,
        ));
        let artifacts: Arc<dyn ArtifactStore> =
            Arc::new(FsArtifactStore::new(&config.storage.artifact_root));
        let casedata: Arc<dyn CaseDataProvider> =
            Arc::new(FsCaseData::new(&config.storage.case_data_dir));

        let state = Self::from_parts(
            conn,
            identity,
            artifacts,
            casedata,
            config.sensitivity.clone(),
            config.guard.extra_roots.clone(),
            FontAssetService::new(&config.fonts.font_dir, config.fonts.allowed.clone()),
        )?;
        state
            .templates
            .seed_from_artifacts(state.artifacts.as_ref(), &config.storage.template_uri_root)?;
        Ok(state)
    }

    /// Assembles state from already-built collaborators. Tests use this
    /// with an in-memory database and fixed token tables.
    pub fn from_parts(
        conn: Arc<Mutex<Connection>>,
        identity: Arc<dyn IdentityProvider>,
        artifacts: Arc<dyn ArtifactStore>,
        casedata: Arc<dyn CaseDataProvider>,
        policy: SensitivityPolicy,
        extra_roots: Vec<String>,
        fonts: FontAssetService,
    ) -> Result<Self> {
        let audit = Arc::new(SqliteAuditSink::new(conn.clone())?);
        let guard = Arc::new(AccessGuard::new(identity, audit.clone(), extra_roots));

        let templates = Arc::new(TemplateStore::new(conn.clone())?);
        let mappings = Arc::new(MappingStore::new(conn.clone())?);
        let drafts = Arc::new(DraftStore::new(conn)?);

        let fill = Arc::new(FillEngine::new(
            templates.clone(),
            mappings.clone(),
            drafts.clone(),
            artifacts.clone(),
            policy,
            audit.clone(),
        ));
        let flatten = Arc::new(FlattenEngine::new(
            drafts.clone(),
            artifacts.clone(),
            audit,
        ));

        Ok(Self {
            guard,
            extractor: Arc::new(FieldSchemaExtractor::new()),
            templates,
            mappings,
            drafts,
            artifacts,
            casedata,
            fill,
            flatten,
            fonts: Arc::new(fonts),
        })
    }
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/pdf/fields", get(pdf_fields))
        .route("/api/pdf/autofill-map", get(autofill_map))
        .route("/api/pdf/fonts/{font_name}", get(get_font))
        .route(
            "/api/pdf/mappings/{template_id}",
            get(get_mapping).post(set_mapping),
        )
        .route("/api/pdf/{doc_id}/stream", get(stream_pdf))
        .route("/api/pdf/{doc_id}/fill", post(fill_pdf))
        .route("/api/pdf/{doc_id}/flatten", post(flatten_pdf))
        .route("/api/cases/{case_id}/pdfs", get(case_pdfs))
        .with_state(state)
}

// -------------------- Error mapping --------------------

pub struct ApiError(Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// -------------------- Request plumbing --------------------

fn request_meta(headers: &HeaderMap) -> RequestMeta {
    let first = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
    };
    RequestMeta {
        ip_address: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string()),
        user_agent: first(header::USER_AGENT),
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Processing(ProcessingError::FillFailed(e.to_string())))?
}

// -------------------- Handlers --------------------

#[derive(Deserialize)]
struct DocumentQuery {
    #[serde(rename = "caseId")]
    case_id: String,
    path: String,
}

#[derive(Deserialize)]
struct CaseQuery {
    #[serde(rename = "caseId")]
    case_id: String,
}

async fn stream_pdf(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Query(query): Query<DocumentQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let meta = request_meta(&headers);
    let identity = state.guard.authorize_admin(bearer(&headers), &meta).await?;
    let case_id = state.guard.validate_case_id(&query.case_id)?;
    let path = state
        .guard
        .authorize_path(&case_id, &query.path, &identity, &meta)
        .await?;

    let artifacts = state.artifacts.clone();
    let bytes = run_blocking(move || artifacts.load(&path)).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{doc_id}.pdf\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Serialize)]
struct FieldsResponse {
    fields: Vec<FieldDef>,
}

async fn pdf_fields(
    State(state): State<AppState>,
    Query(query): Query<DocumentQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<FieldsResponse>> {
    let meta = request_meta(&headers);
    let identity = state.guard.authorize_admin(bearer(&headers), &meta).await?;
    let case_id = state.guard.validate_case_id(&query.case_id)?;
    let path = state
        .guard
        .authorize_path(&case_id, &query.path, &identity, &meta)
        .await?;

    let artifacts = state.artifacts.clone();
    let extractor = state.extractor.clone();
    let fields = run_blocking(move || {
        let bytes = artifacts.load(&path)?;
        Ok(extractor.extract(&bytes)?)
    })
    .await?;

    Ok(Json(FieldsResponse {
        fields: fields.as_ref().clone(),
    }))
}

fn default_mask() -> bool {
    true
}

#[derive(Deserialize)]
struct FillBody {
    data: BTreeMap<String, String>,
    #[serde(rename = "maskPII", default = "default_mask")]
    mask_pii: bool,
    #[serde(default)]
    flatten: bool,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FillResponse {
    success: bool,
    draft_id: String,
    version: i64,
    updated_at: DateTime<Utc>,
    incomplete_keys: Vec<String>,
}

async fn fill_pdf(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Query(query): Query<CaseQuery>,
    headers: HeaderMap,
    Json(body): Json<FillBody>,
) -> ApiResult<Json<FillResponse>> {
    let meta = request_meta(&headers);
    let identity = state.guard.authorize_admin(bearer(&headers), &meta).await?;
    let case_id = state.guard.validate_case_id(&query.case_id)?;

    let outcome = state
        .fill
        .fill(
            FillRequest {
                template_id: doc_id,
                case_id,
                data: body.data,
                mask_pii: body.mask_pii,
                flatten: body.flatten,
                notes: body.notes,
            },
            &identity,
            &meta,
        )
        .await?;

    Ok(Json(FillResponse {
        success: true,
        draft_id: outcome.draft.id,
        version: outcome.draft.version,
        updated_at: outcome.draft.created_at,
        incomplete_keys: outcome.incomplete_keys,
    }))
}

#[derive(Deserialize)]
struct FlattenBody {
    #[serde(rename = "caseId")]
    case_id: String,
    #[serde(rename = "draftId")]
    draft_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FlattenResponse {
    success: bool,
    flattened_id: String,
}

async fn flatten_pdf(
    State(state): State<AppState>,
    Path(_doc_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FlattenBody>,
) -> ApiResult<Json<FlattenResponse>> {
    let meta = request_meta(&headers);
    let identity = state.guard.authorize_admin(bearer(&headers), &meta).await?;
    state.guard.validate_case_id(&body.case_id)?;

    let draft = state
        .flatten
        .flatten(&body.draft_id, &identity, &meta)
        .await?;

    Ok(Json(FlattenResponse {
        success: true,
        flattened_id: draft.id,
    }))
}

#[derive(Serialize)]
struct MappingResponse {
    mapping: BTreeMap<String, String>,
}

async fn get_mapping(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<MappingResponse>> {
    let meta = request_meta(&headers);
    state.guard.authorize_admin(bearer(&headers), &meta).await?;

    let mapping = state
        .mappings
        .get(&template_id)?
        .map(|m| m.fields)
        .unwrap_or_default();
    Ok(Json(MappingResponse { mapping }))
}

#[derive(Deserialize)]
struct MappingBody {
    fields: BTreeMap<String, String>,
    #[serde(rename = "mappingType", default)]
    mapping_type: Option<MappingKind>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn set_mapping(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MappingBody>,
) -> ApiResult<Json<SuccessResponse>> {
    let meta = request_meta(&headers);
    state.guard.authorize_admin(bearer(&headers), &meta).await?;

    state.mappings.set(
        &template_id,
        body.fields,
        body.mapping_type.unwrap_or(MappingKind::Case),
        body.description,
    )?;
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FontResponse {
    font_base64: String,
}

async fn get_font(
    State(state): State<AppState>,
    Path(font_name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let meta = request_meta(&headers);
    state.guard.authorize_admin(bearer(&headers), &meta).await?;

    let asset = state.fonts.get(&font_name)?;
    let body = FontResponse {
        font_base64: base64::engine::general_purpose::STANDARD.encode(&asset.bytes),
    };
    Ok((
        StatusCode::OK,
        [
            (header::CACHE_CONTROL, FONT_CACHE_CONTROL.to_string()),
            (header::ETAG, format!("\"{}\"", asset.etag)),
        ],
        Json(body),
    )
        .into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AutofillResponse {
    autofill_map: BTreeMap<String, String>,
}

async fn autofill_map(
    State(state): State<AppState>,
    Query(query): Query<CaseQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<AutofillResponse>> {
    let meta = request_meta(&headers);
    state.guard.authorize_admin(bearer(&headers), &meta).await?;
    let case_id = state.guard.validate_case_id(&query.case_id)?;

    let autofill_map = state.casedata.autofill_map(&case_id).await?;
    Ok(Json(AutofillResponse { autofill_map }))
}

#[derive(Serialize)]
struct CasePdfsResponse {
    pdfs: Vec<CasePdf>,
}

async fn case_pdfs(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<CasePdfsResponse>> {
    let meta = request_meta(&headers);
    state.guard.authorize_admin(bearer(&headers), &meta).await?;
    let case_id = state.guard.validate_case_id(&case_id)?;

    let artifacts = state.artifacts.clone();
    let prefix = format!("/cases/{case_id}/docs");
    let listing = run_blocking(move || artifacts.list(&prefix)).await?;

    let pdfs = listing
        .into_iter()
        .filter(|info| info.name.to_ascii_lowercase().ends_with(".pdf"))
        .map(|info| CasePdf {
            category: info.category(),
            name: info.name.trim_end_matches(".pdf").replace('_', " "),
            path: info.path,
            size: info.size,
            updated_at: info.updated_at,
        })
        .collect();
    Ok(Json(CasePdfsResponse { pdfs }))
}
