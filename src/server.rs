//! JSON HTTP API using Axum.
//!
//! Identity comes from the `x-user-id` header set by the upstream session
//! layer. Document routes:
//! - POST /api/documents - Create a document
//! - POST /api/documents/save - Overwrite title and content
//! - GET /api/documents - List the user's documents
//! - GET /api/documents/latest - Most recent document (welcome document if none)
//! - GET|DELETE /api/documents/{id}
//! - GET /api/documents/{id}/sync - Sync record of a document
//! - POST /api/key-terms - Replace a document's key terms
//! - POST /api/meta-analysis - Upsert paragraph meta-analyses
//!
//! Drive routes:
//! - POST /api/drive/export
//! - POST /api/drive/import
//! - GET /api/drive/list
//! - POST /api/drive/share

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::config::{Config, DriveConfig};
use crate::database::{lock_db, Database, ParagraphNotes};
use crate::drive::{GoogleDriveClient, TokenRefresher};
use crate::error::{WritingError, WritingResult};
use crate::models::{KeyTerm, DEFAULT_DOCUMENT_TITLE};
use crate::sync::{mark_failed, SyncReconciler};
use crate::validation::{parse_paragraph_index, validate_user_id};

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

const REAUTH_MESSAGE: &str =
    "Google Drive authorization failed. Please reconnect your Google account.";
const RETRY_MESSAGE: &str = "Google Drive request failed. Please try again.";

/// Shared server state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    config: Arc<Mutex<Config>>,
    refresher: Arc<TokenRefresher>,
}

impl AppState {
    fn drive_config(&self) -> WritingResult<DriveConfig> {
        let config = self
            .config
            .lock()
            .map_err(|_| WritingError::Other("config lock poisoned".to_string()))?;
        Ok(config.drive().clone())
    }

    /// Open a Drive session for the user
    async fn reconciler(&self, user_id: &str) -> WritingResult<SyncReconciler<GoogleDriveClient>> {
        let config = self.drive_config()?;
        let client = GoogleDriveClient::connect(&self.db, &self.refresher, &config, user_id).await?;
        Ok(SyncReconciler::new(client, self.db.clone(), &config, user_id))
    }
}

// Request types

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateDocumentRequest {
    title: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SaveDocumentRequest {
    document_id: String,
    title: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KeyTermsRequest {
    document_id: String,
    terms: Vec<KeyTerm>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ParagraphBody {
    says: String,
    does: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetaAnalysisRequest {
    document_id: String,
    paragraph_data: BTreeMap<String, ParagraphBody>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExportRequest {
    document_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImportRequest {
    drive_file_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ShareRequest {
    document_id: String,
    email: String,
    role: Option<String>,
}

// Response helpers

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

/// Document-store failures echo their message
fn store_error(err: WritingError) -> Response {
    match err {
        WritingError::NotFound(_) => error_response(StatusCode::NOT_FOUND, err.to_string()),
        WritingError::Database(_) | WritingError::Other(_) => {
            tracing::error!(error = %err, "Document store failure");
            error_response(StatusCode::BAD_REQUEST, err.to_string())
        }
        _ => error_response(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

/// Drive failures are logged in full and reported generically
fn drive_error(user_id: &str, operation: &str, err: WritingError) -> Response {
    tracing::error!(user_id = %user_id, operation = operation, error = %err, "Drive operation failed");
    match err {
        WritingError::Validation { .. } => error_response(StatusCode::BAD_REQUEST, err.to_string()),
        WritingError::NotFound(_) => error_response(
            StatusCode::NOT_FOUND,
            "Could not access the specified Google Drive file.",
        ),
        WritingError::Authentication(_) => {
            error_response(StatusCode::UNAUTHORIZED, REAUTH_MESSAGE)
        }
        _ if err.is_transient() => error_response(StatusCode::SERVICE_UNAVAILABLE, RETRY_MESSAGE),
        _ => error_response(StatusCode::BAD_REQUEST, RETRY_MESSAGE),
    }
}

fn require_user(headers: &HeaderMap) -> Result<String, Response> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_string();

    match validate_user_id(&user_id) {
        Ok(()) => Ok(user_id),
        Err(_) => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "Authentication required",
        )),
    }
}

/// Parse a JSON body; an empty body yields the defaults
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)))
}

fn require_document_id(document_id: &str) -> Result<(), Response> {
    if document_id.trim().is_empty() {
        return Err(store_error(WritingError::validation(
            "document_id",
            "is required",
        )));
    }
    Ok(())
}

macro_rules! try_response {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(response) => return response,
        }
    };
}

// Document handlers

async fn create_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user_id = try_response!(require_user(&headers));
    let request: CreateDocumentRequest = try_response!(parse_body(&body));

    let title = request.title.unwrap_or_else(|| DEFAULT_DOCUMENT_TITLE.to_string());
    let content = request.content.unwrap_or_default();

    match lock_db(&state.db).and_then(|db| db.create_document(&user_id, &title, &content)) {
        Ok(document) => {
            tracing::info!(user_id = %user_id, document_id = %document.id, "Created document");
            Json(json!({
                "success": true,
                "document_id": document.id,
                "redirect_url": format!("/editor/{}/", document.id),
            }))
            .into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn save_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user_id = try_response!(require_user(&headers));
    let request: SaveDocumentRequest = try_response!(parse_body(&body));
    try_response!(require_document_id(&request.document_id));

    let title = request.title.unwrap_or_else(|| DEFAULT_DOCUMENT_TITLE.to_string());
    let content = request.content.unwrap_or_default();

    match lock_db(&state.db)
        .and_then(|db| db.save_document(&user_id, &request.document_id, &title, &content))
    {
        Ok(document) => Json(json!({
            "success": true,
            "message": "Document saved successfully",
            "updated_at": document.updated_at,
        }))
        .into_response(),
        Err(e) => store_error(e),
    }
}

async fn list_documents(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = try_response!(require_user(&headers));

    match lock_db(&state.db).and_then(|db| db.list_documents(&user_id)) {
        Ok(documents) => Json(json!({ "success": true, "documents": documents })).into_response(),
        Err(e) => store_error(e),
    }
}

async fn latest_document(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = try_response!(require_user(&headers));

    match lock_db(&state.db).and_then(|db| db.latest_or_welcome_document(&user_id)) {
        Ok(document) => Json(json!({ "success": true, "document": document })).into_response(),
        Err(e) => store_error(e),
    }
}

async fn get_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(document_id): Path<String>,
) -> Response {
    let user_id = try_response!(require_user(&headers));

    match lock_db(&state.db).and_then(|db| db.require_document(&user_id, &document_id)) {
        Ok(document) => Json(json!({ "success": true, "document": document })).into_response(),
        Err(e) => store_error(e),
    }
}

async fn delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(document_id): Path<String>,
) -> Response {
    let user_id = try_response!(require_user(&headers));

    match lock_db(&state.db).and_then(|db| db.delete_document(&user_id, &document_id)) {
        Ok(true) => {
            tracing::info!(user_id = %user_id, document_id = %document_id, "Deleted document");
            Json(json!({ "success": true })).into_response()
        }
        Ok(false) => store_error(WritingError::not_found(format!("Document {}", document_id))),
        Err(e) => store_error(e),
    }
}

async fn document_sync_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(document_id): Path<String>,
) -> Response {
    let user_id = try_response!(require_user(&headers));

    let result = lock_db(&state.db).and_then(|db| {
        db.require_document(&user_id, &document_id)?;
        db.get_sync_record(&document_id)
    });
    match result {
        Ok(record) => Json(json!({ "success": true, "sync": record })).into_response(),
        Err(e) => store_error(e),
    }
}

async fn save_key_terms(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user_id = try_response!(require_user(&headers));
    let request: KeyTermsRequest = try_response!(parse_body(&body));
    try_response!(require_document_id(&request.document_id));

    match lock_db(&state.db)
        .and_then(|db| db.save_key_terms(&user_id, &request.document_id, &request.terms))
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => store_error(e),
    }
}

async fn save_meta_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user_id = try_response!(require_user(&headers));
    let request: MetaAnalysisRequest = try_response!(parse_body(&body));
    try_response!(require_document_id(&request.document_id));

    let paragraphs: WritingResult<Vec<ParagraphNotes>> = request
        .paragraph_data
        .into_iter()
        .map(|(index, body)| {
            Ok(ParagraphNotes {
                paragraph_index: parse_paragraph_index(&index)?,
                says: body.says,
                does: body.does,
            })
        })
        .collect();
    let paragraphs = match paragraphs {
        Ok(paragraphs) => paragraphs,
        Err(e) => return store_error(e),
    };

    match lock_db(&state.db)
        .and_then(|db| db.save_meta_analyses(&user_id, &request.document_id, &paragraphs))
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => store_error(e),
    }
}

// Drive handlers

async fn drive_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user_id = try_response!(require_user(&headers));
    let request: ExportRequest = try_response!(parse_body(&body));
    try_response!(require_document_id(&request.document_id));

    let document =
        match lock_db(&state.db).and_then(|db| db.require_document(&user_id, &request.document_id))
        {
            Ok(document) => document,
            Err(e) => return store_error(e),
        };

    let reconciler = match state.reconciler(&user_id).await {
        Ok(reconciler) => reconciler,
        Err(e) => {
            if let Err(record_err) = mark_failed(&state.db, &document.id, &e.to_string()) {
                tracing::error!(
                    document_id = %document.id,
                    error = %record_err,
                    "Could not record export failure"
                );
            }
            return drive_error(&user_id, "export", e);
        }
    };

    let outcome = reconciler.export(&document).await;
    if outcome.is_synced() {
        return Json(json!({
            "success": true,
            "message": "Document exported to Google Drive successfully",
            "drive_file_id": outcome.file_id,
        }))
        .into_response();
    }

    if outcome.needs_reauth {
        error_response(StatusCode::UNAUTHORIZED, REAUTH_MESSAGE)
    } else {
        error_response(StatusCode::BAD_REQUEST, RETRY_MESSAGE)
    }
}

async fn drive_import(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user_id = try_response!(require_user(&headers));
    let request: ImportRequest = try_response!(parse_body(&body));
    if request.drive_file_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Google Drive file ID is required");
    }

    let reconciler = match state.reconciler(&user_id).await {
        Ok(reconciler) => reconciler,
        Err(e) => return drive_error(&user_id, "import", e),
    };

    match reconciler.import(&request.drive_file_id).await {
        Ok(document) => Json(json!({
            "success": true,
            "message": "Document imported from Google Drive successfully",
            "document_id": document.id,
            "redirect_url": format!("/editor/{}/", document.id),
        }))
        .into_response(),
        Err(e) => drive_error(&user_id, "import", e),
    }
}

async fn drive_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = try_response!(require_user(&headers));

    let reconciler = match state.reconciler(&user_id).await {
        Ok(reconciler) => reconciler,
        Err(e) => return drive_error(&user_id, "list", e),
    };

    match reconciler.list_remote().await {
        Ok(files) => Json(json!({ "success": true, "documents": files })).into_response(),
        Err(e) => drive_error(&user_id, "list", e),
    }
}

async fn drive_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user_id = try_response!(require_user(&headers));
    let request: ShareRequest = try_response!(parse_body(&body));
    try_response!(require_document_id(&request.document_id));
    let role = request.role.as_deref().unwrap_or("reader");

    let reconciler = match state.reconciler(&user_id).await {
        Ok(reconciler) => reconciler,
        Err(e) => return drive_error(&user_id, "share", e),
    };

    match reconciler
        .share(&request.document_id, &request.email, role)
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => drive_error(&user_id, "share", e),
    }
}

/// Create the API router
pub fn create_router(db: Arc<Mutex<Database>>, config: Arc<Mutex<Config>>) -> WritingResult<Router> {
    let drive = {
        let cfg = config
            .lock()
            .map_err(|_| WritingError::Other("config lock poisoned".to_string()))?;
        cfg.drive().clone()
    };

    let state = AppState {
        db,
        config,
        refresher: Arc::new(TokenRefresher::new(&drive)?),
    };

    Ok(Router::new()
        .route("/api/documents", post(create_document).get(list_documents))
        .route("/api/documents/save", post(save_document))
        .route("/api/documents/latest", get(latest_document))
        .route(
            "/api/documents/{id}",
            get(get_document).delete(delete_document),
        )
        .route("/api/documents/{id}/sync", get(document_sync_status))
        .route("/api/key-terms", post(save_key_terms))
        .route("/api/meta-analysis", post(save_meta_analysis))
        .route("/api/drive/export", post(drive_export))
        .route("/api/drive/import", post(drive_import))
        .route("/api/drive/list", get(drive_list))
        .route("/api/drive/share", post(drive_share))
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Start the API server and run until Ctrl-C
pub async fn start_server(db: Arc<Mutex<Database>>, config: Arc<Mutex<Config>>) -> WritingResult<()> {
    let addr = {
        let cfg = config
            .lock()
            .map_err(|_| WritingError::Other("config lock poisoned".to_string()))?;
        format!("{}:{}", cfg.server().host, cfg.server().port)
    };
    let router = create_router(db, config)?;

    tracing::info!("Starting Writing Center API on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| WritingError::Network(e.to_string()))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await
        .map_err(|e| WritingError::Network(e.to_string()))?;

    Ok(())
}
