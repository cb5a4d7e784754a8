//! Document and sync HTTP API.
//!
//! Exposes the cloud side of the pipeline: document upload with shallow
//! processing, status polling, and the sync protocol the local worker
//! drives (discover → download → processed/failed, plus pull/push of
//! document metadata).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/documents` | Upload a document (base64 body) |
//! | `GET`  | `/api/documents/{id}/status` | Processing status for polling |
//! | `GET`  | `/api/documents/processing/stats` | Aggregate processing counters |
//! | `GET`  | `/api/sync/documents/unprocessed` | Documents awaiting full processing |
//! | `GET`  | `/api/sync/documents/{id}/download` | Raw file bytes (claims the document) |
//! | `POST` | `/api/sync/documents/{id}/processed` | Submit fully processed content |
//! | `POST` | `/api/sync/documents/{id}/failed` | Mark processing failed |
//! | `GET`  | `/api/sync/pull` | Documents changed since a cursor |
//! | `POST` | `/api/sync/push` | Apply pushed document metadata |
//! | `GET`  | `/api/sync/status` | Sync health: stats, cursors, recent runs |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Authentication
//!
//! All `/api/sync/*` routes require `Authorization: Bearer <api_key>`
//! matching `[sync].api_key`. A server without a configured key answers
//! 503 `sync_not_configured`; a missing header is 401
//! `missing_credentials`; a mismatch is 403 `invalid_credentials`.
//! Document routes are unauthenticated.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "document 7 is not in processing (status: completed)" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `payload_too_large` (413), `unsupported_media_type` (415),
//! `internal` (500), plus the auth codes above.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the UI layers that sit
//! in front of this API are served from other origins.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::documents;
use crate::ingest;
use crate::kg_extract;
use crate::llm::{self, LlmClient};
use crate::migrate;
use crate::models::{
    FailedPayload, ProcessedPayload, ProcessingStatus, PullResponse, PushRequest, PushResponse,
};
use crate::processor::DocumentProcessor;
use crate::sync_log;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    /// Built once at startup; `None` when the LLM provider is disabled, in
    /// which case uploads complete without knowledge-graph extraction.
    llm: Option<Arc<dyn LlmClient>>,
}

/// Starts the HTTP server.
///
/// Connects to the database, runs migrations, builds the LLM client, and
/// binds to `[server].bind`. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let llm: Option<Arc<dyn LlmClient>> = llm::create_client(&config.llm)?.map(Arc::from);

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        llm,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/documents", post(handle_upload))
        .route("/api/documents/{id}/status", get(handle_document_status))
        .route("/api/documents/processing/stats", get(handle_processing_stats))
        .route("/api/sync/documents/unprocessed", get(handle_sync_unprocessed))
        .route("/api/sync/documents/{id}/download", get(handle_sync_download))
        .route("/api/sync/documents/{id}/processed", post(handle_sync_processed))
        .route("/api/sync/documents/{id}/failed", post(handle_sync_failed))
        .route("/api/sync/pull", get(handle_sync_pull))
        .route("/api/sync/push", post(handle_sync_push))
        .route("/api/sync/status", get(handle_sync_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!(
        "resilience server ({} mode) listening on http://{}",
        config.deployment.mode, bind_addr
    );
    if !config.sync.serves_sync() {
        println!("sync API disabled: no [sync].api_key configured");
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

/// Constructs a 404 Not Found error.
fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

/// Constructs a 409 Conflict error.
fn conflict(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::CONFLICT, "conflict", message)
}

/// Constructs a 500 Internal Server Error.
fn internal(err: anyhow::Error) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
}

/// Inspects document-store errors and maps them to the most appropriate
/// HTTP status code. The store reports state violations through its error
/// messages, which keeps it free of HTTP concerns.
fn classify_store_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();

    if msg.contains("not found") {
        not_found(msg)
    } else if msg.contains("not in processing") || msg.contains("could not be claimed") {
        conflict(msg)
    } else if msg.contains("must not be empty") {
        bad_request(msg)
    } else {
        internal(err)
    }
}

// ============ Sync authentication ============

/// Checks the bearer token on `/api/sync/*` routes against `[sync].api_key`.
fn require_sync_auth(config: &Config, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = config.sync.api_key.as_deref().filter(|k| !k.is_empty()) else {
        return Err(AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "sync_not_configured",
            "Sync is not configured on this server",
        ));
    };

    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "missing_credentials",
            "Missing Authorization header",
        ));
    };

    let token = value.strip_prefix("Bearer ").unwrap_or("");
    if token != expected {
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "invalid_credentials",
            "Invalid API key",
        ));
    }

    Ok(())
}

/// Kicks off knowledge-graph extraction for a completed document without
/// holding up the response. Failures are tracked on the document's
/// `kg_extraction_status`, so a lost task is visible, not silent.
fn spawn_extraction(state: &AppState, document_id: &str) {
    let Some(llm) = state.llm.clone() else {
        return;
    };
    let pool = state.pool.clone();
    let config = state.config.clone();
    let id = document_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = kg_extract::run_extraction(&pool, &config, llm.as_ref(), &id).await {
            warn!(document_id = %id, error = %e, "background kg extraction failed");
        }
    });
}

/// Deletes an uploaded raw file once nothing needs it anymore (or an error
/// left it unreferenced). Removal failures are logged, not surfaced.
fn remove_raw_file(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to remove raw file");
    }
}

// ============ GET /health ============

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/documents ============

/// JSON request body for `POST /api/documents`.
#[derive(Deserialize)]
struct UploadRequest {
    filename: String,
    content_base64: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    hazard_type: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

/// JSON response body for `POST /api/documents`.
#[derive(Serialize)]
struct UploadResponse {
    id: String,
    title: Option<String>,
    processing_mode: String,
    processing_status: String,
    needs_full_processing: bool,
    message: String,
}

/// Handler for `POST /api/documents`.
///
/// Validates size and extension, stores the raw file, runs the deployment
/// mode's processor, and finalizes the document through the state machine.
/// The raw file survives only while the document still needs full
/// processing; a completed document triggers background KG extraction.
async fn handle_upload(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, AppError> {
    if req.filename.trim().is_empty() {
        return Err(bad_request("filename is required"));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&req.content_base64)
        .map_err(|_| bad_request("content_base64 is not valid base64"))?;

    if bytes.len() as u64 > state.config.max_upload_bytes() {
        return Err(AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!(
                "File too large. Maximum size is {} MB",
                state.config.max_upload_bytes() / (1024 * 1024)
            ),
        ));
    }

    let processor = DocumentProcessor::new(&state.config);
    if !processor.is_supported(&req.filename) {
        return Err(AppError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_media_type",
            format!(
                "File type not supported in {} mode. Supported types: {}",
                state.config.deployment.mode,
                processor.supported_formats().join(", ")
            ),
        ));
    }

    let raw_dir = &state.config.storage.raw_dir;
    std::fs::create_dir_all(raw_dir)
        .map_err(|e| internal(anyhow::anyhow!("Failed to create raw dir: {}", e)))?;
    let raw_path = ingest::save_raw_file(raw_dir, &req.filename, &bytes).map_err(internal)?;

    let result = processor.process(&req.filename, &bytes);

    let title = req
        .title
        .filter(|t| !t.trim().is_empty())
        .or_else(|| {
            std::path::Path::new(&req.filename)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
        });
    let description = req
        .description
        .filter(|d| !d.trim().is_empty())
        .or_else(|| {
            (!result.content.is_empty())
                .then(|| result.content.chars().take(500).collect::<String>())
        });

    let doc = match documents::insert_document(
        &state.pool,
        documents::NewDocument {
            title,
            description,
            tags: req.tags,
            location: req.location,
            hazard_type: req.hazard_type,
            source: req.source,
            raw_file_path: Some(raw_path.display().to_string()),
        },
    )
    .await
    {
        Ok(doc) => doc,
        Err(e) => {
            // No row references the raw file yet; don't orphan it on disk.
            remove_raw_file(&raw_path);
            return Err(internal(e));
        }
    };

    let status = match documents::finalize_processing(&state.pool, &doc.id, &result).await {
        Ok(status) => status,
        Err(e) => {
            remove_raw_file(&raw_path);
            return Err(classify_store_error(e));
        }
    };

    if status != ProcessingStatus::NeedsLocal {
        remove_raw_file(&raw_path);
        documents::clear_raw_file_path(&state.pool, &doc.id)
            .await
            .map_err(internal)?;
    }

    info!(
        document_id = %doc.id,
        mode = %result.processing_mode,
        status = %status,
        "document uploaded"
    );

    let message = match status {
        ProcessingStatus::Completed => {
            spawn_extraction(&state, &doc.id);
            "Document uploaded and fully processed.".to_string()
        }
        ProcessingStatus::NeedsLocal => {
            "Document uploaded. Basic processing complete, full processing will occur during sync."
                .to_string()
        }
        _ => format!(
            "Document upload failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        ),
    };

    Ok(Json(UploadResponse {
        id: doc.id,
        title: doc.title,
        processing_mode: result.processing_mode,
        processing_status: status.to_string(),
        needs_full_processing: result.needs_full_processing,
        message,
    }))
}

// ============ GET /api/documents/{id}/status ============

/// JSON response body for `GET /api/documents/{id}/status`.
#[derive(Serialize)]
struct DocumentStatusResponse {
    id: String,
    title: Option<String>,
    processing_mode: String,
    processing_status: String,
    needs_full_processing: bool,
    kg_extraction_status: String,
    processed_at: Option<i64>,
}

async fn handle_document_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentStatusResponse>, AppError> {
    let doc = documents::get_document(&state.pool, &id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("document not found: {}", id)))?;

    Ok(Json(DocumentStatusResponse {
        id: doc.id,
        title: doc.title,
        processing_mode: doc.processing_mode,
        processing_status: doc.processing_status.to_string(),
        needs_full_processing: doc.needs_full_processing,
        kg_extraction_status: doc.kg_extraction_status,
        processed_at: doc.processed_at,
    }))
}

// ============ GET /api/documents/processing/stats ============

/// Handler for `GET /api/documents/processing/stats`.
///
/// Aggregate counters plus the deployment mode and processor capabilities.
/// Stuck `processing` documents surface here for operators; nothing
/// recovers them automatically.
async fn handle_processing_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let stuck_after = state.config.sync.stuck_after_secs.max(0) as u64;
    let stats = documents::processing_stats(&state.pool, stuck_after)
        .await
        .map_err(internal)?;

    let mut body = serde_json::to_value(&stats).map_err(|e| internal(e.into()))?;
    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            "deployment_mode".to_string(),
            serde_json::json!(state.config.deployment.mode),
        );
        let processor = DocumentProcessor::new(&state.config);
        obj.insert("capabilities".to_string(), processor.capabilities());
    }

    Ok(Json(body))
}

// ============ GET /api/sync/documents/unprocessed ============

#[derive(Deserialize)]
struct UnprocessedParams {
    limit: Option<i64>,
}

/// One entry in the unprocessed-documents listing. The worker derives the
/// original file extension from `raw_file_path`.
#[derive(Serialize)]
struct UnprocessedDocument {
    id: String,
    title: Option<String>,
    raw_file_path: Option<String>,
    processing_status: String,
    created_at: i64,
}

#[derive(Serialize)]
struct UnprocessedResponse {
    documents: Vec<UnprocessedDocument>,
    count: usize,
}

async fn handle_sync_unprocessed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UnprocessedParams>,
) -> Result<Json<UnprocessedResponse>, AppError> {
    require_sync_auth(&state.config, &headers)?;

    let limit = params.limit.unwrap_or(100);
    let docs = documents::unprocessed_documents(&state.pool, limit)
        .await
        .map_err(internal)?;

    let documents: Vec<UnprocessedDocument> = docs
        .into_iter()
        .map(|d| UnprocessedDocument {
            id: d.id,
            title: d.title,
            raw_file_path: d.raw_file_path,
            processing_status: d.processing_status.to_string(),
            created_at: d.created_at,
        })
        .collect();

    Ok(Json(UnprocessedResponse {
        count: documents.len(),
        documents,
    }))
}

// ============ GET /api/sync/documents/{id}/download ============

/// Handler for `GET /api/sync/documents/{id}/download`.
///
/// Returns the raw file bytes and claims the document (`processing`) so no
/// other worker picks it up. 404 covers a missing document, a missing
/// `raw_file_path`, and a vanished on-disk file; a document someone else
/// already claimed is a 409.
async fn handle_sync_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    require_sync_auth(&state.config, &headers)?;

    let doc = documents::get_document(&state.pool, &id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("document not found: {}", id)))?;

    let raw_path = doc
        .raw_file_path
        .as_deref()
        .ok_or_else(|| not_found(format!("document {} has no raw file", id)))?;

    let bytes = tokio::fs::read(raw_path)
        .await
        .map_err(|_| not_found(format!("raw file for document {} not found on server", id)))?;

    let claimed = documents::mark_processing(&state.pool, &id)
        .await
        .map_err(internal)?;
    if !claimed {
        return Err(conflict(format!(
            "document {} is already being processed",
            id
        )));
    }

    info!(document_id = %id, size = bytes.len(), "raw file claimed for download");

    let filename = std::path::Path::new(raw_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| id.clone());
    let disposition = format!("attachment; filename=\"{}\"", filename);

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

// ============ POST /api/sync/documents/{id}/processed ============

/// JSON response body for the processed/failed submission routes.
#[derive(Serialize)]
struct SubmitResponse {
    success: bool,
    document_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    processing_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

/// Handler for `POST /api/sync/documents/{id}/processed`.
///
/// Applies fully processed content from the worker. Only valid while the
/// document is claimed (`processing`); completing it deletes the raw file
/// and kicks off background graph extraction over the fresh text.
async fn handle_sync_processed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<ProcessedPayload>,
) -> Result<Json<SubmitResponse>, AppError> {
    require_sync_auth(&state.config, &headers)?;

    documents::update_processed(&state.pool, &id, &payload)
        .await
        .map_err(classify_store_error)?;

    // The raw file has served its purpose once full processing lands.
    if let Some(doc) = documents::get_document(&state.pool, &id)
        .await
        .map_err(internal)?
    {
        if let Some(raw_path) = doc.raw_file_path.as_deref() {
            if let Err(e) = tokio::fs::remove_file(raw_path).await {
                warn!(path = raw_path, error = %e, "failed to remove raw file");
            }
            documents::clear_raw_file_path(&state.pool, &id)
                .await
                .map_err(internal)?;
        }
    }

    spawn_extraction(&state, &id);

    info!(document_id = %id, mode = %payload.processing_mode, "processed content accepted");

    Ok(Json(SubmitResponse {
        success: true,
        document_id: id,
        processing_mode: Some(payload.processing_mode.clone()),
        status: None,
    }))
}

// ============ POST /api/sync/documents/{id}/failed ============

async fn handle_sync_failed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<FailedPayload>,
) -> Result<Json<SubmitResponse>, AppError> {
    require_sync_auth(&state.config, &headers)?;

    documents::mark_failed(&state.pool, &id, &payload.error_message)
        .await
        .map_err(classify_store_error)?;

    warn!(document_id = %id, error = %payload.error_message, "document marked failed by worker");

    Ok(Json(SubmitResponse {
        success: true,
        document_id: id,
        processing_mode: None,
        status: Some(ProcessingStatus::Failed.to_string()),
    }))
}

// ============ GET /api/sync/pull ============

#[derive(Deserialize)]
struct PullParams {
    since: Option<i64>,
    /// Id tiebreak for rows sharing `since`; pages resume after this row.
    after_id: Option<String>,
    limit: Option<i64>,
}

/// Handler for `GET /api/sync/pull`.
///
/// Documents changed after the `(since, after_id)` cursor, ordered by
/// `(updated_at, id)` so timestamp ties page exactly. Wrapped in a
/// sync-log entry.
async fn handle_sync_pull(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PullParams>,
) -> Result<Json<PullResponse>, AppError> {
    require_sync_auth(&state.config, &headers)?;

    let since = params.since.unwrap_or(0);
    let after_id = params.after_id.unwrap_or_default();
    // A non-positive limit would page forever with empty bodies.
    let limit = params.limit.unwrap_or(state.config.sync.batch_limit).max(1);

    let log_id = sync_log::start(&state.pool, "pull").await.map_err(internal)?;

    match pull_documents(&state.pool, since, &after_id, limit).await {
        Ok(response) => {
            sync_log::complete(
                &state.pool,
                &log_id,
                response.documents.len() as i64,
                Some(serde_json::json!({ "since": since, "has_more": response.has_more })),
            )
            .await
            .map_err(internal)?;
            Ok(Json(response))
        }
        Err(e) => {
            let _ = sync_log::fail(&state.pool, &log_id, &e.to_string()).await;
            Err(internal(e))
        }
    }
}

async fn pull_documents(
    pool: &SqlitePool,
    since: i64,
    after_id: &str,
    limit: i64,
) -> anyhow::Result<PullResponse> {
    let (docs, has_more) = documents::changed_since(pool, since, after_id, limit).await?;
    let server_time = db::now_ms();
    sync_log::set_metadata(
        pool,
        sync_log::LAST_PULL_TIMESTAMP,
        &server_time.to_string(),
    )
    .await?;
    Ok(PullResponse {
        documents: docs,
        has_more,
        server_time,
    })
}

// ============ POST /api/sync/push ============

/// Handler for `POST /api/sync/push`.
///
/// Applies each pushed document through the "apply if newer" comparator.
/// Conflicts (same version, different payload) are recorded for manual
/// review and counted, never merged. Idempotent re-pushes count as
/// processed.
async fn handle_sync_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>, AppError> {
    require_sync_auth(&state.config, &headers)?;

    let log_id = sync_log::start(&state.pool, "push").await.map_err(internal)?;

    let mut processed_count = 0u64;
    let mut failed_count = 0u64;
    let mut conflict_count = 0u64;
    let mut errors: Vec<String> = Vec::new();

    for doc in &req.documents {
        match documents::apply_remote(&state.pool, doc).await {
            Ok(documents::ApplyOutcome::Applied) | Ok(documents::ApplyOutcome::Skipped) => {
                processed_count += 1;
            }
            Ok(documents::ApplyOutcome::Conflict) => {
                conflict_count += 1;
            }
            Err(e) => {
                failed_count += 1;
                errors.push(format!("{}: {}", doc.id, e));
            }
        }
    }

    errors.truncate(10);

    sync_log::set_metadata(
        &state.pool,
        sync_log::LAST_PUSH_TIMESTAMP,
        &db::now_ms().to_string(),
    )
    .await
    .map_err(internal)?;

    sync_log::complete(
        &state.pool,
        &log_id,
        processed_count as i64,
        Some(serde_json::json!({
            "failed_count": failed_count,
            "conflict_count": conflict_count,
            "errors": errors,
        })),
    )
    .await
    .map_err(internal)?;

    info!(
        processed = processed_count,
        failed = failed_count,
        conflicts = conflict_count,
        "push applied"
    );

    Ok(Json(PushResponse {
        processed_count,
        failed_count,
        conflict_count,
        errors,
    }))
}

// ============ GET /api/sync/status ============

async fn handle_sync_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_sync_auth(&state.config, &headers)?;

    let stuck_after = state.config.sync.stuck_after_secs.max(0) as u64;
    let stats = documents::processing_stats(&state.pool, stuck_after)
        .await
        .map_err(internal)?;
    let last_pull = sync_log::get_metadata(&state.pool, sync_log::LAST_PULL_TIMESTAMP)
        .await
        .map_err(internal)?;
    let last_push = sync_log::get_metadata(&state.pool, sync_log::LAST_PUSH_TIMESTAMP)
        .await
        .map_err(internal)?;
    let recent = sync_log::recent(&state.pool, 10).await.map_err(internal)?;

    Ok(Json(serde_json::json!({
        "sync_enabled": state.config.sync.enabled,
        "processing_stats": stats,
        "last_pull": last_pull,
        "last_push": last_push,
        "recent_syncs": recent,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use std::time::Duration;

    fn config_with_key(key: Option<&str>) -> Config {
        let mut body = String::from("[deployment]\n[storage]\ndb_path = \"./t.db\"\n");
        if let Some(key) = key {
            body.push_str(&format!("[sync]\napi_key = \"{}\"\n", key));
        }
        toml::from_str(&body).unwrap()
    }

    fn headers_with(auth: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(auth) = auth {
            headers.insert(header::AUTHORIZATION, auth.parse().unwrap());
        }
        headers
    }

    #[test]
    fn sync_auth_decision_table() {
        // No key configured: 503 regardless of what the caller sends.
        let err = require_sync_auth(&config_with_key(None), &headers_with(Some("Bearer k")))
            .unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "sync_not_configured");

        // Key configured, no header: 401.
        let err = require_sync_auth(&config_with_key(Some("secret")), &headers_with(None))
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.code, "missing_credentials");

        // Wrong token (or a non-bearer scheme): 403.
        let err = require_sync_auth(
            &config_with_key(Some("secret")),
            &headers_with(Some("Bearer wrong")),
        )
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        let err = require_sync_auth(
            &config_with_key(Some("secret")),
            &headers_with(Some("Basic secret")),
        )
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        // Exact match passes.
        require_sync_auth(
            &config_with_key(Some("secret")),
            &headers_with(Some("Bearer secret")),
        )
        .unwrap();
    }

    /// A document completed through the sync `processed` route must reach
    /// graph extraction the same way an upload-completed one does.
    #[tokio::test]
    async fn processed_submission_triggers_graph_extraction() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();

        let mock = MockLlmClient::new(&[
            r#"{"entities": [
                {"entity_type": "Agency", "name": "SES", "confidence": 0.9,
                 "evidence_text": "The SES coordinates flood response"}
            ]}"#,
            r#"{"relationships": []}"#,
        ]);
        let state = AppState {
            config: Arc::new(config_with_key(Some("secret"))),
            pool: pool.clone(),
            llm: Some(Arc::new(mock)),
        };

        let doc = documents::insert_document(&pool, documents::NewDocument::default())
            .await
            .unwrap();
        assert!(documents::mark_processing(&pool, &doc.id).await.unwrap());

        let payload = ProcessedPayload {
            content: "The SES coordinates flood response.".to_string(),
            metadata: serde_json::json!({}),
            sections: Vec::new(),
            processing_mode: "office_text".to_string(),
        };
        let response = handle_sync_processed(
            State(state),
            headers_with(Some("Bearer secret")),
            Path(doc.id.clone()),
            Json(payload),
        )
        .await
        .unwrap_or_else(|e| panic!("processed submission failed: {}", e.message));
        assert!(response.success);

        // The extraction task runs in the background; give it a moment.
        let mut status = String::new();
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let fetched = documents::get_document(&pool, &doc.id).await.unwrap().unwrap();
            status = fetched.kg_extraction_status;
            if status != "pending" && status != "processing" {
                break;
            }
        }
        assert_eq!(status, "completed");

        let entities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kg_entities")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(entities, 1);
    }

    #[test]
    fn store_errors_map_to_protocol_statuses() {
        let err = classify_store_error(anyhow::anyhow!("document not found: 42"));
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = classify_store_error(anyhow::anyhow!(
            "document 42 is not in processing (status: completed)"
        ));
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err = classify_store_error(anyhow::anyhow!("content must not be empty"));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = classify_store_error(anyhow::anyhow!("disk exploded"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
