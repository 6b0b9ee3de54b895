//! Reconciliation between local documents and their Drive counterparts.
//!
//! Export pushes a document to Drive and records the outcome in its
//! SyncRecord; it never fails outright. Import pulls a Drive file into a
//! brand-new local document.
//!
//! Per document:
//!
//! ```text
//! (no record) --export--> pending --ok--> synced
//!                            |
//!                            +---fail--> error
//! synced | error --export--> pending
//! ```

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::DriveConfig;
use crate::database::{lock_db, Database};
use crate::drive::DriveApi;
use crate::error::{WritingError, WritingResult};
use crate::html::text_to_html;
use crate::models::{Document, DriveFile, SyncRecord, SyncStatus, IMPORTED_DOCUMENT_TITLE};
use crate::validation::{validate_drive_id, MAX_TITLE_LENGTH};

/// Result of one export attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportOutcome {
    pub document_id: String,
    /// Remote file id, when one is known
    pub file_id: Option<String>,
    pub status: SyncStatus,
    pub error: Option<String>,
    /// The failure was a credential problem the user must fix
    #[serde(skip)]
    pub needs_reauth: bool,
}

impl ExportOutcome {
    pub fn is_synced(&self) -> bool {
        self.status == SyncStatus::Synced
    }
}

/// Drives export/import for one user against one storage session.
pub struct SyncReconciler<D: DriveApi> {
    drive: D,
    db: Arc<Mutex<Database>>,
    user_id: String,
    root_folder_name: String,
}

impl<D: DriveApi> SyncReconciler<D> {
    pub fn new(drive: D, db: Arc<Mutex<Database>>, config: &DriveConfig, user_id: &str) -> Self {
        Self {
            drive,
            db,
            user_id: user_id.to_string(),
            root_folder_name: config.root_folder_name.clone(),
        }
    }

    pub fn drive(&self) -> &D {
        &self.drive
    }

    /// Id of the user's root folder, creating it when missing.
    ///
    /// A cached id is trusted only after Drive confirms it still exists and
    /// is not trashed. Lookup failures other than not-found propagate so a
    /// flaky connection never produces duplicate folders.
    pub async fn ensure_root_folder(&self) -> WritingResult<String> {
        let cached = lock_db(&self.db)?
            .get_or_create_preferences(&self.user_id)?
            .drive_folder_id;

        if !cached.is_empty() {
            match self.drive.get_file_info(&cached).await {
                Ok(Some(folder)) if !folder.trashed => return Ok(cached),
                Ok(_) | Err(WritingError::NotFound(_)) => {
                    tracing::warn!(
                        user_id = %self.user_id,
                        folder_id = %cached,
                        "Cached Drive folder is gone, creating a new one"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let folder_id = self
            .drive
            .create_folder(&self.root_folder_name, None)
            .await?;
        lock_db(&self.db)?.set_drive_folder_id(&self.user_id, &folder_id)?;

        tracing::info!(user_id = %self.user_id, folder_id = %folder_id, "Using new Drive root folder");
        Ok(folder_id)
    }

    /// Export a document the user owns, loading it first
    pub async fn export_document(&self, document_id: &str) -> WritingResult<ExportOutcome> {
        let document = lock_db(&self.db)?.require_document(&self.user_id, document_id)?;
        Ok(self.export(&document).await)
    }

    /// Push a document to Drive and record the outcome.
    pub async fn export(&self, document: &Document) -> ExportOutcome {
        let known_file_id = match self.begin_export(document) {
            Ok(file_id) => file_id,
            Err(e) => return self.fail(document, None, e),
        };

        let file_id = match self.push(document, known_file_id.as_deref()).await {
            Ok(file_id) => file_id,
            Err(e) => return self.fail(document, known_file_id, e),
        };

        let recorded = lock_db(&self.db).and_then(|db| {
            db.upsert_sync_record(&document.id, &file_id, SyncStatus::Synced, "")
        });
        if let Err(e) = recorded {
            tracing::error!(
                user_id = %self.user_id,
                document_id = %document.id,
                file_id = %file_id,
                error = %e,
                "Exported document but could not record sync state"
            );
            return ExportOutcome {
                document_id: document.id.clone(),
                file_id: Some(file_id),
                status: SyncStatus::Error,
                error: Some(format!("could not record sync state: {}", e)),
                needs_reauth: false,
            };
        }

        tracing::info!(
            user_id = %self.user_id,
            document_id = %document.id,
            file_id = %file_id,
            "Exported document to Drive"
        );
        ExportOutcome {
            document_id: document.id.clone(),
            file_id: Some(file_id),
            status: SyncStatus::Synced,
            error: None,
            needs_reauth: false,
        }
    }

    /// Mark the record pending, returning the remote file id if one is known
    fn begin_export(&self, document: &Document) -> WritingResult<Option<String>> {
        let db = lock_db(&self.db)?;
        let known = db
            .get_sync_record(&document.id)?
            .map(|record| record.external_file_id)
            .filter(|id| !id.is_empty());
        db.upsert_sync_record(
            &document.id,
            known.as_deref().unwrap_or(""),
            SyncStatus::Pending,
            "",
        )?;
        Ok(known)
    }

    async fn push(&self, document: &Document, known_file_id: Option<&str>) -> WritingResult<String> {
        let folder_id = self.ensure_root_folder().await?;

        let Some(file_id) = known_file_id else {
            return self
                .drive
                .upload_document(&document.title, &document.content, Some(&folder_id))
                .await;
        };

        match self.drive.update_document(file_id, &document.content).await {
            Ok(()) => Ok(file_id.to_string()),
            Err(WritingError::NotFound(_)) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    document_id = %document.id,
                    file_id = %file_id,
                    "Remote file disappeared, uploading a fresh copy"
                );
                self.drive
                    .upload_document(&document.title, &document.content, Some(&folder_id))
                    .await
            }
            Err(e) => Err(e),
        }
    }

    fn fail(
        &self,
        document: &Document,
        known_file_id: Option<String>,
        err: WritingError,
    ) -> ExportOutcome {
        let message = err.to_string();
        let needs_reauth = err.is_authentication();
        tracing::error!(
            user_id = %self.user_id,
            document_id = %document.id,
            error = %message,
            "Export to Drive failed"
        );

        let recorded = lock_db(&self.db).and_then(|db| {
            db.upsert_sync_record(
                &document.id,
                known_file_id.as_deref().unwrap_or(""),
                SyncStatus::Error,
                &message,
            )
        });
        if let Err(e) = recorded {
            tracing::error!(
                user_id = %self.user_id,
                document_id = %document.id,
                error = %e,
                "Could not record export failure"
            );
        }

        ExportOutcome {
            document_id: document.id.clone(),
            file_id: known_file_id,
            status: SyncStatus::Error,
            error: Some(message),
            needs_reauth,
        }
    }

    /// Create a new local document from a Drive file.
    ///
    /// Every call creates a new document, even for a file imported before.
    pub async fn import(&self, file_id: &str) -> WritingResult<Document> {
        if file_id.trim().is_empty() {
            return Err(WritingError::validation("drive_file_id", "is required"));
        }
        validate_drive_id(file_id, "drive_file_id")?;

        let info = match self.drive.get_file_info(file_id).await? {
            Some(info) if !info.trashed => info,
            _ => return Err(WritingError::not_found(format!("Drive file {}", file_id))),
        };

        let text = self.drive.download_document(file_id).await.map_err(|e| match e {
            WritingError::Authentication(_) => e,
            other => WritingError::Download(format!("could not download {}: {}", file_id, other)),
        })?;

        let title = import_title(&info);
        let (document, _) = lock_db(&self.db)?.create_imported_document(
            &self.user_id,
            &title,
            &text_to_html(&text),
            file_id,
        )?;

        tracing::info!(
            user_id = %self.user_id,
            document_id = %document.id,
            file_id = %file_id,
            "Imported document from Drive"
        );
        Ok(document)
    }

    /// Files of an allowed type in the user's root folder
    pub async fn list_remote(&self) -> WritingResult<Vec<DriveFile>> {
        let folder_id = self.ensure_root_folder().await?;
        self.drive.list_documents(Some(&folder_id)).await
    }

    /// Share the exported copy of a document
    pub async fn share(&self, document_id: &str, email: &str, role: &str) -> WritingResult<()> {
        let file_id = self.exported_file_id(document_id)?;
        self.drive.share_document(&file_id, email, role).await
    }

    /// Delete the exported copy of a document and forget it locally
    pub async fn delete_remote(&self, document_id: &str) -> WritingResult<()> {
        let file_id = self.exported_file_id(document_id)?;
        match self.drive.delete_document(&file_id).await {
            Ok(()) | Err(WritingError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        lock_db(&self.db)?.upsert_sync_record(document_id, "", SyncStatus::Pending, "")?;
        Ok(())
    }

    fn exported_file_id(&self, document_id: &str) -> WritingResult<String> {
        let db = lock_db(&self.db)?;
        db.require_document(&self.user_id, document_id)?;
        db.get_sync_record(document_id)?
            .map(|record| record.external_file_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                WritingError::not_found(format!("Document {} has not been exported", document_id))
            })
    }
}

fn import_title(info: &DriveFile) -> String {
    let name = info.name.trim();
    if name.is_empty() {
        IMPORTED_DOCUMENT_TITLE.to_string()
    } else {
        name.chars().take(MAX_TITLE_LENGTH).collect()
    }
}

/// Record a failed export when no reconciler could be built (for example
/// because the user's Drive credentials are unusable).
pub fn mark_failed(
    db: &Mutex<Database>,
    document_id: &str,
    message: &str,
) -> WritingResult<SyncRecord> {
    let db = lock_db(db)?;
    let known = db
        .get_sync_record(document_id)?
        .map(|record| record.external_file_id)
        .unwrap_or_default();
    db.upsert_sync_record(document_id, &known, SyncStatus::Error, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::memory::MemoryDrive;
    use crate::drive::{FOLDER_MIME, GOOGLE_DOC_MIME};

    const USER: &str = "42";

    fn reconciler() -> SyncReconciler<MemoryDrive> {
        let db = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));
        SyncReconciler::new(MemoryDrive::new(), db, &DriveConfig::default(), USER)
    }

    fn create(r: &SyncReconciler<MemoryDrive>, title: &str, content: &str) -> Document {
        lock_db(&r.db).unwrap().create_document(USER, title, content).unwrap()
    }

    fn record(r: &SyncReconciler<MemoryDrive>, document_id: &str) -> SyncRecord {
        lock_db(&r.db)
            .unwrap()
            .get_sync_record(document_id)
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_export_uploads_visible_text() {
        let r = reconciler();
        let doc = create(&r, "Essay", "<p>Hello <b>world</b></p>");

        let outcome = r.export(&doc).await;
        assert!(outcome.is_synced());
        assert_eq!(outcome.file_id.as_deref(), Some("f1"));
        assert_eq!(outcome.error, None);

        let file = r.drive().file("f1").unwrap();
        assert_eq!(file.content, "Hello world");
        assert_eq!(file.name, "Essay");
        assert_eq!(file.parent.as_deref(), Some("folder1"));

        let rec = record(&r, &doc.id);
        assert_eq!(rec.external_file_id, "f1");
        assert_eq!(rec.sync_status, SyncStatus::Synced);
        assert_eq!(rec.error_message, "");
    }

    #[tokio::test]
    async fn test_repeated_export_updates_same_file() {
        let r = reconciler();
        let doc = create(&r, "Essay", "<p>v1</p>");

        let first = r.export(&doc).await;
        let doc = lock_db(&r.db)
            .unwrap()
            .save_document(USER, &doc.id, "Essay", "<p>v2</p>")
            .unwrap();
        let second = r.export(&doc).await;

        assert_eq!(first.file_id, second.file_id);
        assert_eq!(r.drive().count_calls("upload_document"), 1);
        assert_eq!(r.drive().count_calls("update_document"), 1);
        assert_eq!(r.drive().count_calls("create_folder"), 1);
        assert_eq!(r.drive().file("f1").unwrap().content, "v2");
    }

    #[tokio::test]
    async fn test_failed_upload_records_error() {
        let r = reconciler();
        let doc = create(&r, "Essay", "<p>Hello</p>");
        r.drive()
            .fail_next("upload_document", WritingError::storage("quota exceeded"));

        let outcome = r.export(&doc).await;
        assert_eq!(outcome.status, SyncStatus::Error);
        assert_eq!(outcome.file_id, None);
        assert!(!outcome.error.as_deref().unwrap_or("").is_empty());

        let rec = record(&r, &doc.id);
        assert_eq!(rec.sync_status, SyncStatus::Error);
        assert!(rec.error_message.contains("quota exceeded"));
        assert!(!outcome.needs_reauth);
    }

    #[tokio::test]
    async fn test_revoked_credentials_flag_reauth() {
        let r = reconciler();
        let doc = create(&r, "Essay", "<p>Hello</p>");
        r.drive().fail_next(
            "create_folder",
            WritingError::Authentication("token revoked".into()),
        );

        let outcome = r.export(&doc).await;
        assert_eq!(outcome.status, SyncStatus::Error);
        assert!(outcome.needs_reauth);
    }

    #[tokio::test]
    async fn test_error_recovers_on_next_export() {
        let r = reconciler();
        let doc = create(&r, "Essay", "<p>Hello</p>");
        r.export(&doc).await;

        r.drive()
            .fail_next("update_document", WritingError::Network("timed out".into()));
        let failed = r.export(&doc).await;
        assert_eq!(failed.status, SyncStatus::Error);
        assert_eq!(failed.file_id.as_deref(), Some("f1"));
        assert_eq!(record(&r, &doc.id).external_file_id, "f1");

        let retried = r.export(&doc).await;
        assert!(retried.is_synced());
        assert_eq!(retried.file_id.as_deref(), Some("f1"));
        assert_eq!(record(&r, &doc.id).error_message, "");
    }

    #[tokio::test]
    async fn test_deleted_remote_file_is_reuploaded() {
        let r = reconciler();
        let doc = create(&r, "Essay", "<p>Hello</p>");
        r.export(&doc).await;
        r.drive().remove_file("f1");

        let outcome = r.export(&doc).await;
        assert!(outcome.is_synced());
        assert_eq!(outcome.file_id.as_deref(), Some("f2"));
        assert_eq!(record(&r, &doc.id).external_file_id, "f2");
    }

    #[tokio::test]
    async fn test_root_folder_is_cached() {
        let r = reconciler();
        let first = r.ensure_root_folder().await.unwrap();
        let second = r.ensure_root_folder().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(r.drive().folder_count(), 1);
        let prefs = lock_db(&r.db).unwrap().get_or_create_preferences(USER).unwrap();
        assert_eq!(prefs.drive_folder_id, first);
        assert_eq!(
            r.drive().file(&first).unwrap().name,
            "Writing Center Documents"
        );
    }

    #[tokio::test]
    async fn test_missing_root_folder_is_recreated() {
        let r = reconciler();
        lock_db(&r.db)
            .unwrap()
            .set_drive_folder_id(USER, "folder-deleted")
            .unwrap();

        let folder = r.ensure_root_folder().await.unwrap();
        assert_ne!(folder, "folder-deleted");
        let prefs = lock_db(&r.db).unwrap().get_or_create_preferences(USER).unwrap();
        assert_eq!(prefs.drive_folder_id, folder);
    }

    #[tokio::test]
    async fn test_trashed_root_folder_is_recreated() {
        let r = reconciler();
        let original = r.ensure_root_folder().await.unwrap();
        r.drive().trash_file(&original);

        let replacement = r.ensure_root_folder().await.unwrap();
        assert_ne!(replacement, original);
        assert_eq!(r.drive().folder_count(), 2);
    }

    #[tokio::test]
    async fn test_root_folder_lookup_failure_does_not_duplicate() {
        let r = reconciler();
        let original = r.ensure_root_folder().await.unwrap();
        let doc = create(&r, "Essay", "<p>Hello</p>");
        r.drive()
            .fail_next("get_file_info", WritingError::Network("connection reset".into()));

        let outcome = r.export(&doc).await;
        assert_eq!(outcome.status, SyncStatus::Error);
        assert_eq!(r.drive().folder_count(), 1);
        let prefs = lock_db(&r.db).unwrap().get_or_create_preferences(USER).unwrap();
        assert_eq!(prefs.drive_folder_id, original);
    }

    #[tokio::test]
    async fn test_export_document_checks_ownership() {
        let r = reconciler();
        let other = lock_db(&r.db)
            .unwrap()
            .create_document("7", "Theirs", "")
            .unwrap();

        assert!(matches!(
            r.export_document(&other.id).await,
            Err(WritingError::NotFound(_))
        ));
        assert!(r.drive().calls().is_empty());
    }

    #[tokio::test]
    async fn test_import_creates_synced_document() {
        let r = reconciler();
        r.drive().insert_file("f2", "Notes", GOOGLE_DOC_MIME, "Some text");

        let doc = r.import("f2").await.unwrap();
        assert_eq!(doc.title, "Notes");
        assert_eq!(doc.content, "<p>Some text</p>");
        assert_eq!(doc.user_id, USER);

        let rec = record(&r, &doc.id);
        assert_eq!(rec.external_file_id, "f2");
        assert_eq!(rec.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_import_untitled_file() {
        let r = reconciler();
        r.drive().insert_file("f3", "", "text/plain", "Body");

        let doc = r.import("f3").await.unwrap();
        assert_eq!(doc.title, IMPORTED_DOCUMENT_TITLE);
    }

    #[tokio::test]
    async fn test_import_twice_creates_two_documents() {
        let r = reconciler();
        r.drive().insert_file("f2", "Notes", GOOGLE_DOC_MIME, "Some text");

        let a = r.import("f2").await.unwrap();
        let b = r.import("f2").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(lock_db(&r.db).unwrap().list_documents(USER).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_import_errors() {
        let r = reconciler();
        assert!(matches!(
            r.import("").await,
            Err(WritingError::Validation { .. })
        ));
        assert!(matches!(
            r.import("missing").await,
            Err(WritingError::NotFound(_))
        ));

        r.drive().insert_file("f2", "Notes", GOOGLE_DOC_MIME, "Some text");
        r.drive()
            .fail_next("download_document", WritingError::storage("export too large"));
        assert!(matches!(
            r.import("f2").await,
            Err(WritingError::Download(_))
        ));

        r.drive().fail_next(
            "download_document",
            WritingError::Authentication("token revoked".into()),
        );
        assert!(r.import("f2").await.unwrap_err().is_authentication());

        assert!(lock_db(&r.db).unwrap().list_documents(USER).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_remote_only_returns_allowed_types() {
        let r = reconciler();
        let folder = r.ensure_root_folder().await.unwrap();
        r.drive()
            .insert_file_in(Some(&folder), "a", "Essay", GOOGLE_DOC_MIME, "");
        r.drive()
            .insert_file_in(Some(&folder), "b", "Photo", "image/png", "");
        r.drive()
            .insert_file_in(Some(&folder), "c", "Sub", FOLDER_MIME, "");
        r.drive()
            .insert_file_in(Some(&folder), "d", "Paper", "application/pdf", "");
        r.drive().insert_file("e", "Elsewhere", "text/plain", "");

        let files = r.list_remote().await.unwrap();
        let ids: Vec<&str> = files.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
    }

    #[tokio::test]
    async fn test_share_requires_export() {
        let r = reconciler();
        let doc = create(&r, "Essay", "<p>Hello</p>");

        assert!(matches!(
            r.share(&doc.id, "reader@example.com", "reader").await,
            Err(WritingError::NotFound(_))
        ));

        r.export(&doc).await;
        r.share(&doc.id, "reader@example.com", "reader").await.unwrap();
        assert_eq!(r.drive().count_calls("share_document"), 1);
    }

    #[tokio::test]
    async fn test_delete_remote_resets_record() {
        let r = reconciler();
        let doc = create(&r, "Essay", "<p>Hello</p>");
        r.export(&doc).await;

        r.delete_remote(&doc.id).await.unwrap();
        assert!(r.drive().file("f1").is_none());
        let rec = record(&r, &doc.id);
        assert_eq!(rec.external_file_id, "");
        assert_eq!(rec.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_mark_failed_keeps_file_id() {
        let db = Mutex::new(Database::new_in_memory().unwrap());
        let doc = lock_db(&db).unwrap().create_document(USER, "Essay", "").unwrap();
        lock_db(&db)
            .unwrap()
            .upsert_sync_record(&doc.id, "f1", SyncStatus::Synced, "")
            .unwrap();

        let rec = mark_failed(&db, &doc.id, "Authentication error: no token").unwrap();
        assert_eq!(rec.sync_status, SyncStatus::Error);
        assert_eq!(rec.external_file_id, "f1");
        assert_eq!(rec.error_message, "Authentication error: no token");
    }
}
