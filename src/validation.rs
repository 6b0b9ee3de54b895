//! Input validation for Writing Center.
//!
//! This module provides validation functions for all user inputs.
//! All validators return WritingError::Validation on failure.

use uuid::Uuid;

use crate::error::{WritingError, WritingResult};

// Limits
pub const MAX_USER_ID_LENGTH: usize = 150;
pub const MAX_TITLE_LENGTH: usize = 255;
pub const MAX_DOCUMENT_CONTENT_LENGTH: usize = 2_000_000; // 2MB of markup
pub const MAX_KEY_TERM_LENGTH: usize = 255;
pub const MAX_ANNOTATION_ID_LENGTH: usize = 50;
pub const MAX_REFLECTION_KEY_LENGTH: usize = 100;
pub const MAX_URL_LENGTH: usize = 200;
pub const MAX_DRIVE_ID_LENGTH: usize = 255;

/// Roles accepted by the Drive permissions API for user grants
pub const SHARE_ROLES: &[&str] = &["reader", "commenter", "writer"];

/// Validate and convert a UUID hex string to Uuid.
pub fn validate_uuid_hex(value: &str, field_name: &str) -> WritingResult<Uuid> {
    // Accept both hyphenated and non-hyphenated formats
    let cleaned = value.replace('-', "");
    Uuid::parse_str(&cleaned).map_err(|e| {
        WritingError::validation(field_name, format!("invalid UUID format: {}", e))
    })
}

/// Convert UUID to hex string (32 chars, no hyphens).
pub fn uuid_to_hex(value: &Uuid) -> String {
    value.simple().to_string()
}

/// Validate a document ID.
pub fn validate_document_id(document_id: &str) -> WritingResult<Uuid> {
    if document_id.trim().is_empty() {
        return Err(WritingError::validation("document_id", "is required"));
    }
    validate_uuid_hex(document_id, "document_id")
}

/// Validate a user ID supplied by the session layer.
pub fn validate_user_id(user_id: &str) -> WritingResult<()> {
    if user_id.trim().is_empty() {
        return Err(WritingError::validation("user_id", "is required"));
    }
    if user_id.len() > MAX_USER_ID_LENGTH {
        return Err(WritingError::validation(
            "user_id",
            format!("cannot exceed {} characters", MAX_USER_ID_LENGTH),
        ));
    }
    if user_id.chars().any(char::is_control) {
        return Err(WritingError::validation(
            "user_id",
            "cannot contain control characters",
        ));
    }
    Ok(())
}

/// Validate a document title.
pub fn validate_title(title: &str) -> WritingResult<()> {
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(WritingError::validation(
            "title",
            format!(
                "cannot exceed {} characters (got {})",
                MAX_TITLE_LENGTH,
                title.chars().count()
            ),
        ));
    }
    Ok(())
}

/// Validate document content. Empty content is allowed.
pub fn validate_document_content(content: &str) -> WritingResult<()> {
    if content.len() > MAX_DOCUMENT_CONTENT_LENGTH {
        return Err(WritingError::validation(
            "content",
            format!(
                "cannot exceed {} bytes (got {})",
                MAX_DOCUMENT_CONTENT_LENGTH,
                content.len()
            ),
        ));
    }
    Ok(())
}

fn validate_key(value: &str, field_name: &str, max_len: usize) -> WritingResult<()> {
    let stripped = value.trim();
    if stripped.is_empty() {
        return Err(WritingError::validation(
            field_name,
            "cannot be empty or whitespace only",
        ));
    }
    if stripped.chars().count() > max_len {
        return Err(WritingError::validation(
            field_name,
            format!("cannot exceed {} characters", max_len),
        ));
    }
    Ok(())
}

/// Validate a key term.
pub fn validate_key_term(term: &str) -> WritingResult<()> {
    validate_key(term, "term", MAX_KEY_TERM_LENGTH)
}

/// Validate an annotation ID (client-generated).
pub fn validate_annotation_id(annotation_id: &str) -> WritingResult<()> {
    validate_key(annotation_id, "annotation_id", MAX_ANNOTATION_ID_LENGTH)
}

/// Validate a reflection key.
pub fn validate_reflection_key(key: &str) -> WritingResult<()> {
    validate_key(key, "reflection_key", MAX_REFLECTION_KEY_LENGTH)
}

/// Validate a paragraph index (zero-based).
pub fn validate_paragraph_index(index: i64) -> WritingResult<()> {
    if index < 0 {
        return Err(WritingError::validation(
            "paragraph_index",
            format!("must be non-negative, got {}", index),
        ));
    }
    Ok(())
}

/// Parse a paragraph index sent as a JSON object key.
pub fn parse_paragraph_index(key: &str) -> WritingResult<i64> {
    let index: i64 = key.trim().parse().map_err(|_| {
        WritingError::validation("paragraph_index", format!("'{}' is not an integer", key))
    })?;
    validate_paragraph_index(index)?;
    Ok(index)
}

/// Validate a source URL. Empty is allowed.
pub fn validate_url(url: &str) -> WritingResult<()> {
    if url.is_empty() {
        return Ok(());
    }
    if url.len() > MAX_URL_LENGTH {
        return Err(WritingError::validation(
            "url",
            format!("cannot exceed {} characters", MAX_URL_LENGTH),
        ));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(WritingError::validation(
            "url",
            "must start with http:// or https://",
        ));
    }
    Ok(())
}

/// Validate a Drive file or folder ID.
///
/// Drive IDs are URL-safe tokens; anything else is rejected before it can
/// reach a query string.
pub fn validate_drive_id(value: &str, field_name: &str) -> WritingResult<()> {
    if value.is_empty() {
        return Err(WritingError::validation(field_name, "is required"));
    }
    if value.len() > MAX_DRIVE_ID_LENGTH {
        return Err(WritingError::validation(
            field_name,
            format!("cannot exceed {} characters", MAX_DRIVE_ID_LENGTH),
        ));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WritingError::validation(
            field_name,
            "may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

/// Validate an e-mail address for sharing.
pub fn validate_email(email: &str) -> WritingResult<()> {
    let invalid = || WritingError::validation("email", format!("'{}' is not a valid address", email));

    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(invalid());
    }
    Ok(())
}

/// Validate a permission role for sharing.
pub fn validate_share_role(role: &str) -> WritingResult<()> {
    if !SHARE_ROLES.contains(&role) {
        return Err(WritingError::validation(
            "role",
            format!("must be one of {}", SHARE_ROLES.join(", ")),
        ));
    }
    Ok(())
}
