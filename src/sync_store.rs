//! Persistence of per-document sync state.
//!
//! A document has at most one SyncRecord. Every write is an upsert keyed by
//! document id, so repeated attempts overwrite the previous outcome.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::database::{now_unix, uuid_bytes_to_hex, Database};
use crate::error::{WritingError, WritingResult};
use crate::models::{Document, SyncRecord, SyncStatus};
use crate::validation::{
    uuid_to_hex, validate_document_content, validate_document_id, validate_drive_id, validate_title,
    validate_user_id,
};

fn row_to_sync_record(row: &Row) -> rusqlite::Result<SyncRecord> {
    let id_bytes: Vec<u8> = row.get(0)?;
    let status: String = row.get(2)?;
    let sync_status = status.parse::<SyncStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(SyncRecord {
        document_id: uuid_bytes_to_hex(&id_bytes).unwrap_or_default(),
        external_file_id: row.get(1)?,
        sync_status,
        last_synced_at: row.get(3)?,
        error_message: row.get(4)?,
    })
}

impl Database {
    pub fn get_sync_record(&self, document_id: &str) -> WritingResult<Option<SyncRecord>> {
        let uuid = validate_document_id(document_id)?;
        let record = self
            .connection()
            .query_row(
                r#"
                SELECT document_id, external_file_id, sync_status, last_synced_at, error_message
                FROM sync_records
                WHERE document_id = ?
                "#,
                [uuid.as_bytes().to_vec()],
                row_to_sync_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Create or overwrite the sync record of a document.
    ///
    /// `last_synced_at` is stamped with the current time on every write.
    pub fn upsert_sync_record(
        &self,
        document_id: &str,
        external_file_id: &str,
        status: SyncStatus,
        error_message: &str,
    ) -> WritingResult<SyncRecord> {
        let uuid = validate_document_id(document_id)?;
        let now = now_unix();

        let changed = self.connection().execute(
            r#"
            INSERT INTO sync_records
                (document_id, external_file_id, sync_status, last_synced_at, error_message)
            SELECT id, ?, ?, ?, ? FROM documents WHERE id = ?
            ON CONFLICT(document_id) DO UPDATE SET
                external_file_id = excluded.external_file_id,
                sync_status = excluded.sync_status,
                last_synced_at = excluded.last_synced_at,
                error_message = excluded.error_message
            "#,
            params![
                external_file_id,
                status.as_str(),
                now,
                error_message,
                uuid.as_bytes().to_vec()
            ],
        )?;
        if changed == 0 {
            return Err(WritingError::not_found(format!("Document {}", document_id)));
        }

        Ok(SyncRecord {
            document_id: uuid_to_hex(&uuid),
            external_file_id: external_file_id.to_string(),
            sync_status: status,
            last_synced_at: now,
            error_message: error_message.to_string(),
        })
    }

    /// Sync records of every document the user owns
    pub fn list_sync_records(&self, user_id: &str) -> WritingResult<Vec<SyncRecord>> {
        let mut stmt = self.connection().prepare(
            r#"
            SELECT s.document_id, s.external_file_id, s.sync_status, s.last_synced_at, s.error_message
            FROM sync_records s
            JOIN documents d ON d.id = s.document_id
            WHERE d.user_id = ?
            ORDER BY s.last_synced_at DESC
            "#,
        )?;
        let records = stmt
            .query_map([user_id], row_to_sync_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Create a document that mirrors an external file, together with its
    /// `synced` record, in a single transaction.
    pub fn create_imported_document(
        &self,
        user_id: &str,
        title: &str,
        content: &str,
        external_file_id: &str,
    ) -> WritingResult<(Document, SyncRecord)> {
        validate_user_id(user_id)?;
        validate_title(title)?;
        validate_document_content(content)?;
        validate_drive_id(external_file_id, "file_id")?;

        let id = Uuid::now_v7();
        let key = id.as_bytes().to_vec();
        let now = now_unix();

        let tx = self.connection().unchecked_transaction()?;
        tx.execute(
            r#"
            INSERT INTO documents (id, user_id, title, content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![key, user_id, title, content, now, now],
        )?;
        tx.execute(
            r#"
            INSERT INTO sync_records
                (document_id, external_file_id, sync_status, last_synced_at, error_message)
            VALUES (?, ?, ?, ?, '')
            "#,
            params![key, external_file_id, SyncStatus::Synced.as_str(), now],
        )?;
        tx.commit()?;

        let document = Document {
            id: uuid_to_hex(&id),
            title: title.to_string(),
            content: content.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        let record = SyncRecord {
            document_id: document.id.clone(),
            external_file_id: external_file_id.to_string(),
            sync_status: SyncStatus::Synced,
            last_synced_at: now,
            error_message: String::new(),
        };
        Ok((document, record))
    }
}
