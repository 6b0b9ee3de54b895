//! Data models for Writing Center.
//!
//! This module defines the core entities: Document and its child records,
//! the per-document SyncRecord, per-user preferences and stored OAuth tokens.
//! Document IDs are UUID7 stored as 16 bytes internally, converted to hex
//! strings for JSON. All timestamps are Unix seconds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WritingError;

/// Title given to documents created without one
pub const DEFAULT_DOCUMENT_TITLE: &str = "Untitled Document";

/// Title given to imported documents whose remote name is empty
pub const IMPORTED_DOCUMENT_TITLE: &str = "Imported Document";

/// A writing document owned by a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// UUID7 hex (32 chars, no hyphens)
    pub id: String,
    pub title: String,
    /// Rich text content as HTML markup
    pub content: String,
    /// Owning user
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Lightweight document entry used by listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTerm {
    pub term: String,
    #[serde(default)]
    pub definition: String,
}

/// What a paragraph says and what it does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaAnalysis {
    pub paragraph_index: i64,
    pub says: String,
    pub does: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub annotation_id: String,
    pub content: String,
    pub paragraph_index: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reflection {
    pub reflection_key: String,
    pub content: String,
    pub updated_at: i64,
}

/// A source or reference cited by a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub source_text: String,
    pub citation: String,
    pub url: String,
    pub created_at: i64,
}

/// Focus-timer settings and task state for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSession {
    pub id: i64,
    pub session_data: serde_json::Value,
    pub work_duration: i64,
    pub short_break_duration: i64,
    pub long_break_duration: i64,
    pub sessions_before_long_break: i64,
    pub updated_at: i64,
}

/// Timer settings as supplied by a caller; durations are minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSettings {
    #[serde(default)]
    pub session_data: serde_json::Value,
    #[serde(default = "default_work_duration")]
    pub work_duration: i64,
    #[serde(default = "default_short_break")]
    pub short_break_duration: i64,
    #[serde(default = "default_long_break")]
    pub long_break_duration: i64,
    #[serde(default = "default_sessions_before_long_break")]
    pub sessions_before_long_break: i64,
}

fn default_work_duration() -> i64 {
    25
}

fn default_short_break() -> i64 {
    5
}

fn default_long_break() -> i64 {
    15
}

fn default_sessions_before_long_break() -> i64 {
    4
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            session_data: serde_json::json!({}),
            work_duration: default_work_duration(),
            short_break_duration: default_short_break(),
            long_break_duration: default_long_break(),
            sessions_before_long_break: default_sessions_before_long_break(),
        }
    }
}

/// Per-user UI preferences and the cached Drive root folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: String,
    pub sidebar_collapsed: bool,
    pub tutorial_completed: bool,
    pub theme_preferences: serde_json::Value,
    pub drive_sync_enabled: bool,
    /// Empty when no root folder has been created yet
    pub drive_folder_id: String,
}

/// Synchronization state of a document against its external counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error,
    /// Reserved for manual resolution; never set by the reconciler
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Error => "error",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = WritingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "error" => Ok(SyncStatus::Error),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(WritingError::validation(
                "sync_status",
                format!("unknown status '{}'", other),
            )),
        }
    }
}

/// Last known external counterpart of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub document_id: String,
    /// Empty until the first successful upload
    pub external_file_id: String,
    pub sync_status: SyncStatus,
    pub last_synced_at: i64,
    /// Empty when the last attempt succeeded
    pub error_message: String,
}

/// OAuth credentials for one user at one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    /// Unix seconds; None when the provider did not report an expiry
    pub expires_at: Option<i64>,
}

impl StoredToken {
    /// Whether the access token expires within `skew_secs` of `now`
    pub fn is_expired(&self, now: i64, skew_secs: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + skew_secs,
            None => false,
        }
    }
}

/// Metadata of a file on the external storage provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub modified_at: Option<String>,
    pub created_at: Option<String>,
    pub size: Option<u64>,
    #[serde(default)]
    pub trashed: bool,
}
