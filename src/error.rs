//! Error types for Writing Center core.
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Writing Center operations
pub type WritingResult<T> = Result<T, WritingError>;

/// Main error type for Writing Center operations
#[derive(Error, Debug)]
pub enum WritingError {
    /// Missing, invalid or unrefreshable credentials for the storage provider
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The storage provider rejected an operation
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Export/download of remote content failed or is unsupported
    #[error("Download error: {0}")]
    Download(String),

    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("{0}")]
    Other(String),
}

impl WritingError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        WritingError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new storage error
    pub fn storage(message: impl Into<String>) -> Self {
        WritingError::Storage(message.into())
    }

    /// Create a new not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        WritingError::NotFound(message.into())
    }

    /// Whether the user has to reconnect their storage account to recover
    pub fn is_authentication(&self) -> bool {
        matches!(self, WritingError::Authentication(_))
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, WritingError::Network(_))
    }
}

impl From<reqwest::Error> for WritingError {
    fn from(err: reqwest::Error) -> Self {
        WritingError::Network(err.to_string())
    }
}
