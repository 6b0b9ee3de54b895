//! Local HTTP server emulating the Drive v3 and OAuth token endpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Form, Json, Router};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub(crate) struct FakeFile {
    pub name: String,
    pub mime_type: String,
    pub content: String,
    pub parents: Vec<String>,
    pub trashed: bool,
}

#[derive(Default)]
pub(crate) struct FakeDriveState {
    pub files: Mutex<HashMap<String, FakeFile>>,
    pub permissions: Mutex<Vec<Value>>,
    pub list_queries: Mutex<Vec<String>>,
    pub token_requests: AtomicUsize,
    /// Number of upcoming file-info requests answered with 503
    pub unavailable_responses: AtomicUsize,
    /// Folder and file creations received, including rejected ones
    pub create_requests: AtomicUsize,
    /// Number of upcoming creations answered with 503 before being applied
    pub unavailable_creates: AtomicUsize,
    /// Number of upcoming creations that are applied but answered late
    pub slow_creates: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeDriveState {
    pub fn insert_file(&self, id: &str, name: &str, mime_type: &str, content: &str) {
        self.files.lock().unwrap().insert(
            id.to_string(),
            FakeFile {
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                content: content.to_string(),
                parents: Vec::new(),
                trashed: false,
            },
        );
    }

    pub fn file(&self, id: &str) -> Option<FakeFile> {
        self.files.lock().unwrap().get(id).cloned()
    }

    fn allocate_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

type Shared = Arc<FakeDriveState>;

/// Delay of a slow creation reply, longer than a one second client timeout
const SLOW_REPLY: Duration = Duration::from_millis(1500);

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Count a creation and answer 503 if one is scheduled
fn begin_create(state: &FakeDriveState) -> Result<(), Response> {
    state.create_requests.fetch_add(1, Ordering::SeqCst);
    if take_one(&state.unavailable_creates) {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "backend error").into_response());
    }
    Ok(())
}

/// Stall after applying a creation if a slow reply is scheduled
async fn finish_create(state: &FakeDriveState) {
    if take_one(&state.slow_creates) {
        tokio::time::sleep(SLOW_REPLY).await;
    }
}

fn authorized(headers: &HeaderMap) -> Result<(), Response> {
    match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(value) if value.starts_with("Bearer ") && value != "Bearer revoked" => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"code": 401, "message": "Invalid Credentials"}})),
        )
            .into_response()),
    }
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": {"code": 404, "message": format!("File not found: {}", id)}})),
    )
        .into_response()
}

fn file_json(id: &str, file: &FakeFile) -> Value {
    json!({
        "id": id,
        "name": file.name,
        "mimeType": file.mime_type,
        "modifiedTime": "2024-05-01T10:00:00.000Z",
        "createdTime": "2024-04-01T10:00:00.000Z",
        "size": file.content.len().to_string(),
        "trashed": file.trashed,
    })
}

async fn create_folder(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(metadata): Json<Value>,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    if let Err(resp) = begin_create(&state) {
        return resp;
    }
    let id = state.allocate_id("folder");
    state.files.lock().unwrap().insert(
        id.clone(),
        FakeFile {
            name: metadata["name"].as_str().unwrap_or_default().to_string(),
            mime_type: metadata["mimeType"].as_str().unwrap_or_default().to_string(),
            content: String::new(),
            parents: parents_of(&metadata),
            trashed: false,
        },
    );
    finish_create(&state).await;
    Json(json!({ "id": id })).into_response()
}

fn parents_of(metadata: &Value) -> Vec<String> {
    metadata["parents"]
        .as_array()
        .map(|ps| ps.iter().filter_map(|p| p.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

/// Split a multipart/related body into its (metadata, media) parts.
fn split_multipart(headers: &HeaderMap, body: &str) -> Option<(Value, String)> {
    let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let boundary = content_type.split("boundary=").nth(1)?.trim_matches('"');
    let delimiter = format!("--{}", boundary);

    let mut parts = body
        .split(delimiter.as_str())
        .filter(|p| !p.trim().is_empty() && p.trim() != "--")
        .filter_map(|p| p.split_once("\r\n\r\n").map(|(_, content)| content));

    let metadata = serde_json::from_str(parts.next()?.trim_end_matches("\r\n")).ok()?;
    let media = parts.next()?.trim_end_matches("\r\n").to_string();
    Some((metadata, media))
}

async fn upload_file(State(state): State<Shared>, headers: HeaderMap, body: String) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    let Some((metadata, media)) = split_multipart(&headers, &body) else {
        return (StatusCode::BAD_REQUEST, "malformed multipart body").into_response();
    };
    if let Err(resp) = begin_create(&state) {
        return resp;
    }

    let id = state.allocate_id("file");
    state.files.lock().unwrap().insert(
        id.clone(),
        FakeFile {
            name: metadata["name"].as_str().unwrap_or_default().to_string(),
            mime_type: metadata["mimeType"].as_str().unwrap_or_default().to_string(),
            content: media,
            parents: parents_of(&metadata),
            trashed: false,
        },
    );
    finish_create(&state).await;
    Json(json!({ "id": id })).into_response()
}

async fn update_file(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    let mut files = state.files.lock().unwrap();
    match files.get_mut(&id) {
        Some(file) => {
            file.content = body;
            Json(json!({ "id": id })).into_response()
        }
        None => not_found(&id),
    }
}

async fn export_file(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    if params.get("mimeType").map(String::as_str) != Some("text/plain") {
        return (StatusCode::BAD_REQUEST, "unsupported export type").into_response();
    }
    match state.file(&id) {
        // Drive prefixes text exports with a byte order mark
        Some(file) => format!("\u{feff}{}", file.content).into_response(),
        None => not_found(&id),
    }
}

async fn file_info(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    if take_one(&state.unavailable_responses) {
        return (StatusCode::SERVICE_UNAVAILABLE, "backend error").into_response();
    }
    match state.file(&id) {
        Some(file) => Json(file_json(&id, &file)).into_response(),
        None => not_found(&id),
    }
}

async fn delete_file(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    match state.files.lock().unwrap().remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => not_found(&id),
    }
}

const PAGE_SIZE: usize = 2;

async fn list_files(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    let query = params.get("q").cloned().unwrap_or_default();
    state.list_queries.lock().unwrap().push(query.clone());

    // Ignores the mime clause of the query so that client-side filtering
    // is exercised; honours the folder and trashed clauses.
    let folder = query
        .split(" and ")
        .find_map(|clause| clause.strip_suffix("' in parents"))
        .map(|clause| clause.trim_start_matches('\'').to_string());

    let mut files: Vec<(String, FakeFile)> = state
        .files
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, f)| !f.trashed)
        .filter(|(_, f)| folder.as_ref().map_or(true, |p| f.parents.contains(p)))
        .map(|(id, f)| (id.clone(), f.clone()))
        .collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let start: usize = params
        .get("pageToken")
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);
    let page: Vec<Value> = files
        .iter()
        .skip(start)
        .take(PAGE_SIZE)
        .map(|(id, f)| file_json(id, f))
        .collect();

    let mut body = json!({ "files": page });
    if start + PAGE_SIZE < files.len() {
        body["nextPageToken"] = json!((start + PAGE_SIZE).to_string());
    }
    Json(body).into_response()
}

async fn create_permission(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    Json(mut permission): Json<Value>,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    if state.file(&id).is_none() {
        return not_found(&id);
    }
    permission["fileId"] = json!(id);
    permission["sendNotificationEmail"] =
        json!(params.get("sendNotificationEmail").cloned().unwrap_or_default());
    state.permissions.lock().unwrap().push(permission);
    Json(json!({ "id": "perm-1" })).into_response()
}

async fn token(State(state): State<Shared>, Form(form): Form<HashMap<String, String>>) -> Response {
    state.token_requests.fetch_add(1, Ordering::SeqCst);
    // Long enough for concurrent callers to pile up behind the first
    tokio::time::sleep(Duration::from_millis(50)).await;

    if form.get("grant_type").map(String::as_str) != Some("refresh_token") {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "unsupported_grant_type"})))
            .into_response();
    }
    if form.get("refresh_token").map(String::as_str) == Some("revoked") {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"}))).into_response();
    }
    Json(json!({
        "access_token": "fresh-token",
        "expires_in": 3600,
        "token_type": "Bearer",
    }))
    .into_response()
}

/// Start the fake server on an ephemeral port and return its base URL.
pub(crate) async fn spawn() -> (String, Arc<FakeDriveState>) {
    let state = Arc::new(FakeDriveState::default());

    let app = Router::new()
        .route("/drive/v3/files", post(create_folder).get(list_files))
        .route("/drive/v3/files/{id}", get(file_info).delete(delete_file))
        .route("/drive/v3/files/{id}/export", get(export_file))
        .route("/drive/v3/files/{id}/permissions", post(create_permission))
        .route("/upload/drive/v3/files", post(upload_file))
        .route("/upload/drive/v3/files/{id}", patch(update_file))
        .route("/token", post(token))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), state)
}
