//! Google Drive v3 implementation of [`DriveApi`].
//!
//! A client is a short-lived session value: it is built for one request from
//! the user's stored credentials and dropped afterwards.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{is_allowed_mime, DriveApi, TokenRefresher, ALLOWED_MIME_TYPES, FOLDER_MIME, GOOGLE_DOC_MIME};
use crate::config::DriveConfig;
use crate::database::Database;
use crate::error::{WritingError, WritingResult};
use crate::html::html_to_text;
use crate::models::DriveFile;
use crate::validation::{validate_drive_id, validate_email, validate_share_role};

const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime,createdTime,size,trashed";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,modifiedTime,createdTime,size)";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    modified_time: Option<String>,
    created_time: Option<String>,
    /// Drive reports sizes as decimal strings
    size: Option<String>,
    #[serde(default)]
    trashed: bool,
}

impl From<ApiFile> for DriveFile {
    fn from(file: ApiFile) -> Self {
        DriveFile {
            id: file.id,
            name: file.name,
            mime_type: file.mime_type,
            modified_at: file.modified_time,
            created_at: file.created_time,
            size: file.size.and_then(|s| s.parse().ok()),
            trashed: file.trashed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<ApiFile>,
    next_page_token: Option<String>,
}

/// Drive query selecting non-trashed files of an allowed type
fn list_query(folder_id: Option<&str>) -> String {
    let types = ALLOWED_MIME_TYPES
        .iter()
        .map(|mime| format!("mimeType='{}'", mime))
        .collect::<Vec<_>>()
        .join(" or ");

    let mut query = format!("({}) and trashed=false", types);
    if let Some(folder_id) = folder_id {
        query.push_str(&format!(" and '{}' in parents", folder_id));
    }
    query
}

/// Whether a request may be resent after an ambiguous failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Sending the request twice leaves Drive in the same state
    Safe,
    /// The request creates a resource; a resend after a lost reply duplicates it
    Create,
}

impl Replay {
    fn retries_status(self, status: StatusCode) -> bool {
        match self {
            Replay::Safe => status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
            Replay::Create => matches!(
                status,
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
            ),
        }
    }

    fn retries_error(self, err: &reqwest::Error) -> bool {
        match self {
            Replay::Safe => err.is_timeout() || err.is_connect(),
            Replay::Create => err.is_connect(),
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2)
}

/// Google Drive REST client bound to one user's access token.
pub struct GoogleDriveClient {
    http: Client,
    config: DriveConfig,
    access_token: String,
    user_id: String,
}

impl GoogleDriveClient {
    /// Build a client for `user_id`, refreshing the access token if needed.
    pub async fn connect(
        db: &Mutex<Database>,
        refresher: &TokenRefresher,
        config: &DriveConfig,
        user_id: &str,
    ) -> WritingResult<Self> {
        let access_token = refresher.access_token(db, config, user_id).await?;
        Self::with_access_token(config, user_id, access_token)
    }

    /// Build a client around an already valid access token.
    pub fn with_access_token(
        config: &DriveConfig,
        user_id: &str,
        access_token: impl Into<String>,
    ) -> WritingResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| WritingError::Network(e.to_string()))?;

        Ok(Self {
            http,
            config: config.clone(),
            access_token: access_token.into(),
            user_id: user_id.to_string(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn file_url(&self, file_id: &str) -> String {
        format!(
            "{}/files/{}",
            self.config.api_base_url,
            urlencoding::encode(file_id)
        )
    }

    /// Send a request, retrying transient failures with exponential backoff.
    ///
    /// `Replay::Create` requests are resent only when Drive cannot have
    /// applied them: connect failures and 429/503 replies.
    async fn send<F>(
        &self,
        operation: &str,
        resource: &str,
        replay: Replay,
        build: F,
    ) -> WritingResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut backoff = self.config.retry_backoff();
        let mut attempt = 0;

        loop {
            let result = build().bearer_auth(&self.access_token).send().await;
            let retryable = match &result {
                Ok(response) => replay.retries_status(response.status()),
                Err(e) => replay.retries_error(e),
            };

            if !retryable || attempt >= self.config.max_retries {
                return match result {
                    Ok(response) => self.check(operation, resource, response).await,
                    Err(e) => {
                        tracing::error!(
                            user_id = %self.user_id,
                            operation = operation,
                            resource = resource,
                            error = %e,
                            "Drive request failed"
                        );
                        Err(WritingError::from(e))
                    }
                };
            }

            attempt += 1;
            tracing::debug!(
                user_id = %self.user_id,
                operation = operation,
                resource = resource,
                attempt = attempt,
                "Retrying Drive request"
            );
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    /// Map a non-success response to the error taxonomy
    async fn check(
        &self,
        operation: &str,
        resource: &str,
        response: Response,
    ) -> WritingResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::error!(
            user_id = %self.user_id,
            operation = operation,
            resource = resource,
            status = %status,
            "Drive request rejected"
        );

        Err(match status {
            StatusCode::UNAUTHORIZED => WritingError::Authentication(format!(
                "Drive rejected the access token during {}",
                operation
            )),
            StatusCode::NOT_FOUND => WritingError::not_found(format!("Drive file {}", resource)),
            _ => WritingError::storage(format!(
                "{} failed with status {}: {}",
                operation, status, body
            )),
        })
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        response: Response,
    ) -> WritingResult<T> {
        response.json::<T>().await.map_err(|e| {
            WritingError::storage(format!("{} returned an unexpected body: {}", operation, e))
        })
    }
}

impl DriveApi for GoogleDriveClient {
    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> WritingResult<String> {
        let mut metadata = json!({ "name": name, "mimeType": FOLDER_MIME });
        if let Some(parent_id) = parent_id {
            validate_drive_id(parent_id, "parent_id")?;
            metadata["parents"] = json!([parent_id]);
        }

        let url = format!("{}/files", self.config.api_base_url);
        let response = self
            .send("create_folder", name, Replay::Create, || {
                self.http.post(&url).query(&[("fields", "id")]).json(&metadata)
            })
            .await?;
        let created: CreatedFile = self.parse("create_folder", response).await?;

        tracing::info!(user_id = %self.user_id, folder_id = %created.id, "Created Drive folder");
        Ok(created.id)
    }

    async fn upload_document(
        &self,
        title: &str,
        html: &str,
        folder_id: Option<&str>,
    ) -> WritingResult<String> {
        let mut metadata = json!({ "name": title, "mimeType": GOOGLE_DOC_MIME });
        if let Some(folder_id) = folder_id {
            validate_drive_id(folder_id, "folder_id")?;
            metadata["parents"] = json!([folder_id]);
        }

        let boundary = format!("writingcore-{}", Uuid::now_v7().simple());
        let body = format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{meta}\r\n\
             --{b}\r\nContent-Type: text/plain; charset=UTF-8\r\n\r\n{text}\r\n--{b}--\r\n",
            b = boundary,
            meta = metadata,
            text = html_to_text(html),
        );
        let content_type = format!("multipart/related; boundary={}", boundary);

        let url = format!("{}/files", self.config.upload_base_url);
        let response = self
            .send("upload_document", title, Replay::Create, || {
                self.http
                    .post(&url)
                    .query(&[("uploadType", "multipart"), ("fields", "id")])
                    .header(reqwest::header::CONTENT_TYPE, &content_type)
                    .body(body.clone())
            })
            .await?;
        let created: CreatedFile = self.parse("upload_document", response).await?;

        tracing::info!(user_id = %self.user_id, file_id = %created.id, "Uploaded document to Drive");
        Ok(created.id)
    }

    async fn update_document(&self, file_id: &str, html: &str) -> WritingResult<()> {
        validate_drive_id(file_id, "file_id")?;
        let text = html_to_text(html);

        let url = format!(
            "{}/files/{}",
            self.config.upload_base_url,
            urlencoding::encode(file_id)
        );
        self.send("update_document", file_id, Replay::Safe, || {
            self.http
                .patch(&url)
                .query(&[("uploadType", "media")])
                .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=UTF-8")
                .body(text.clone())
        })
        .await?;

        tracing::info!(user_id = %self.user_id, file_id = %file_id, "Updated Drive document");
        Ok(())
    }

    async fn download_document(&self, file_id: &str) -> WritingResult<String> {
        validate_drive_id(file_id, "file_id")?;

        let url = format!("{}/export", self.file_url(file_id));
        let response = self
            .send("download_document", file_id, Replay::Safe, || {
                self.http.get(&url).query(&[("mimeType", "text/plain")])
            })
            .await?;

        response.text().await.map_err(|e| {
            WritingError::Download(format!("could not read export of {}: {}", file_id, e))
        })
    }

    async fn list_documents(&self, folder_id: Option<&str>) -> WritingResult<Vec<DriveFile>> {
        if let Some(folder_id) = folder_id {
            validate_drive_id(folder_id, "folder_id")?;
        }
        let query = list_query(folder_id);
        let url = format!("{}/files", self.config.api_base_url);
        let resource = folder_id.unwrap_or("root");

        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let response = self
                .send("list_documents", resource, Replay::Safe, || {
                    let mut params = vec![
                        ("q", query.as_str()),
                        ("spaces", "drive"),
                        ("fields", LIST_FIELDS),
                    ];
                    if let Some(token) = page_token.as_deref() {
                        params.push(("pageToken", token));
                    }
                    self.http.get(&url).query(&params)
                })
                .await?;
            let page: FileList = self.parse("list_documents", response).await?;

            files.extend(
                page.files
                    .into_iter()
                    .filter(|f| is_allowed_mime(&f.mime_type))
                    .map(DriveFile::from),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(files)
    }

    async fn delete_document(&self, file_id: &str) -> WritingResult<()> {
        validate_drive_id(file_id, "file_id")?;

        let url = self.file_url(file_id);
        self.send("delete_document", file_id, Replay::Safe, || self.http.delete(&url))
            .await?;

        tracing::info!(user_id = %self.user_id, file_id = %file_id, "Deleted Drive document");
        Ok(())
    }

    async fn get_file_info(&self, file_id: &str) -> WritingResult<Option<DriveFile>> {
        validate_drive_id(file_id, "file_id")?;

        let url = self.file_url(file_id);
        let result = self
            .send("get_file_info", file_id, Replay::Safe, || {
                self.http.get(&url).query(&[("fields", FILE_FIELDS)])
            })
            .await;

        match result {
            Ok(response) => {
                let file: ApiFile = self.parse("get_file_info", response).await?;
                Ok(Some(file.into()))
            }
            Err(WritingError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn share_document(&self, file_id: &str, email: &str, role: &str) -> WritingResult<()> {
        validate_drive_id(file_id, "file_id")?;
        validate_email(email)?;
        validate_share_role(role)?;

        let permission = json!({ "type": "user", "role": role, "emailAddress": email });
        let url = format!("{}/permissions", self.file_url(file_id));
        self.send("share_document", file_id, Replay::Safe, || {
            self.http
                .post(&url)
                .query(&[("sendNotificationEmail", "true")])
                .json(&permission)
        })
        .await?;

        tracing::info!(
            user_id = %self.user_id,
            file_id = %file_id,
            role = role,
            "Shared Drive document"
        );
        Ok(())
    }
}
