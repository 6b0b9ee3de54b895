//! WritingCore - Rust implementation of the Writing Center application core.
//!
//! This library provides the core functionality for Writing Center:
//! - Data models (Document, KeyTerm, Annotation, SyncRecord, ...)
//! - Database operations (SQLite)
//! - Google Drive client and token refresh
//! - Export/import reconciliation between documents and Drive files
//! - Configuration management
//!
//! # Feature Flags
//!
//! - `server`: Include the JSON HTTP API (axum, tower-http) and the
//!   `writing-center-server` binary.

pub mod config;
pub mod database;
pub mod drive;
pub mod error;
pub mod html;
pub mod models;
#[cfg(feature = "server")]
pub mod server;
pub mod sync;
pub mod sync_store;
pub mod validation;

// Re-export commonly used types
pub use config::Config;
pub use database::Database;
pub use drive::{DriveApi, GoogleDriveClient, TokenRefresher};
pub use error::{WritingError, WritingResult};
pub use models::{Document, DocumentSummary, DriveFile, SyncRecord, SyncStatus};
pub use sync::{ExportOutcome, SyncReconciler};
