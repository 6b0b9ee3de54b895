//! External document storage (Google Drive).
//!
//! [`DriveApi`] is the seam between the sync reconciler and the provider.
//! [`client::GoogleDriveClient`] talks to the Drive v3 REST API; tests use an
//! in-memory implementation.
//!
//! Every method takes editor HTML where content goes up and returns plain
//! text where content comes down. Implementations own the conversion.

use std::future::Future;

use crate::error::WritingResult;
use crate::models::DriveFile;

pub mod auth;
pub mod client;

#[cfg(test)]
pub(crate) mod fake_server;
#[cfg(test)]
pub(crate) mod memory;

pub use auth::TokenRefresher;
pub use client::GoogleDriveClient;

/// Native Google Docs type, used for every uploaded document
pub const GOOGLE_DOC_MIME: &str = "application/vnd.google-apps.document";

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// File types that listings may return
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    GOOGLE_DOC_MIME,
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/msword",
    "text/plain",
    "application/pdf",
    "text/rtf",
];

/// Whether a listing may return files of this type
pub fn is_allowed_mime(mime_type: &str) -> bool {
    ALLOWED_MIME_TYPES.contains(&mime_type)
}

/// Trait for external document storage implementations.
///
/// Errors follow one mapping across implementations: rejected credentials
/// are `Authentication`, a missing resource is `NotFound`, any other refusal
/// is `Storage` and transport failures are `Network`.
pub trait DriveApi: Send + Sync {
    /// Create a folder and return its id. Always creates a new folder.
    fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> impl Future<Output = WritingResult<String>> + Send;

    /// Upload HTML as a new document and return the new file id.
    fn upload_document(
        &self,
        title: &str,
        html: &str,
        folder_id: Option<&str>,
    ) -> impl Future<Output = WritingResult<String>> + Send;

    /// Replace the content of an existing document.
    fn update_document(
        &self,
        file_id: &str,
        html: &str,
    ) -> impl Future<Output = WritingResult<()>> + Send;

    /// Export a document as plain text.
    fn download_document(&self, file_id: &str)
        -> impl Future<Output = WritingResult<String>> + Send;

    /// List non-trashed files of an allowed type, optionally inside a folder.
    fn list_documents(
        &self,
        folder_id: Option<&str>,
    ) -> impl Future<Output = WritingResult<Vec<DriveFile>>> + Send;

    fn delete_document(&self, file_id: &str) -> impl Future<Output = WritingResult<()>> + Send;

    /// File metadata, or None when the file does not exist.
    fn get_file_info(
        &self,
        file_id: &str,
    ) -> impl Future<Output = WritingResult<Option<DriveFile>>> + Send;

    /// Grant `email` access to a file with `role` (reader, commenter or writer).
    fn share_document(
        &self,
        file_id: &str,
        email: &str,
        role: &str,
    ) -> impl Future<Output = WritingResult<()>> + Send;
}
