//! Database operations for Writing Center.
//!
//! This module provides all data access functionality using SQLite.
//! All methods return JSON-serializable types to support the HTTP API.
//!
//! Document IDs are stored as BLOB (16 bytes) and converted to hex strings
//! for JSON output. Every document-scoped operation takes the caller's user
//! ID and behaves as if the document did not exist when it belongs to
//! someone else.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{WritingError, WritingResult};
use crate::models::{
    Annotation, Document, DocumentSummary, KeyTerm, MetaAnalysis, Reflection, Source, StoredToken,
    TimerSession, TimerSettings, UserPreferences, DEFAULT_DOCUMENT_TITLE,
};
use crate::validation::{
    validate_annotation_id, validate_document_content, validate_document_id, validate_key_term,
    uuid_to_hex, validate_paragraph_index, validate_reflection_key, validate_title, validate_url,
    validate_user_id,
};

/// Provider name under which Google credentials are stored
pub const GOOGLE_PROVIDER: &str = "google";

/// Title of the document created for users who have none
pub const WELCOME_DOCUMENT_TITLE: &str = "Welcome Document";

/// Content of the document created for users who have none
pub const WELCOME_DOCUMENT_CONTENT: &str =
    "<p>Welcome to Writing Center! Start writing here...</p>";

/// Blank titles fall back to the default document title
fn title_or_default(title: &str) -> &str {
    if title.trim().is_empty() {
        DEFAULT_DOCUMENT_TITLE
    } else {
        title
    }
}

/// Convert UUID bytes to hex string
pub(crate) fn uuid_bytes_to_hex(bytes: &[u8]) -> Option<String> {
    if bytes.len() == 16 {
        Some(uuid_to_hex(&Uuid::from_slice(bytes).ok()?))
    } else {
        None
    }
}

pub(crate) fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Lock a shared database handle
pub fn lock_db(db: &Mutex<Database>) -> WritingResult<MutexGuard<'_, Database>> {
    db.lock()
        .map_err(|_| WritingError::Other("database lock poisoned".to_string()))
}

/// One paragraph's meta-analysis as supplied by the editor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParagraphNotes {
    pub paragraph_index: i64,
    pub says: String,
    pub does: String,
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Create a new database connection
    pub fn new<P: AsRef<Path>>(db_path: P) -> WritingResult<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let mut db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> WritingResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_database(&mut self) -> WritingResult<()> {
        self.conn.execute_batch(
            r#"
            -- Cascading deletes from documents rely on this
            PRAGMA foreign_keys = ON;

            -- Documents with UUID7 BLOB primary key
            -- All timestamps are Unix seconds (INTEGER)
            CREATE TABLE IF NOT EXISTS documents (
                id BLOB PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_user_updated
                ON documents (user_id, updated_at DESC);

            CREATE TABLE IF NOT EXISTS key_terms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id BLOB NOT NULL,
                term TEXT NOT NULL,
                definition TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                UNIQUE (document_id, term),
                FOREIGN KEY (document_id) REFERENCES documents (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS meta_analyses (
                document_id BLOB NOT NULL,
                paragraph_index INTEGER NOT NULL,
                says_content TEXT NOT NULL DEFAULT '',
                does_content TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (document_id, paragraph_index),
                FOREIGN KEY (document_id) REFERENCES documents (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS annotations (
                document_id BLOB NOT NULL,
                annotation_id TEXT NOT NULL,
                content TEXT NOT NULL,
                paragraph_index INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (document_id, annotation_id),
                FOREIGN KEY (document_id) REFERENCES documents (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS reflections (
                document_id BLOB NOT NULL,
                reflection_key TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (document_id, reflection_key),
                FOREIGN KEY (document_id) REFERENCES documents (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id BLOB NOT NULL,
                source_text TEXT NOT NULL,
                citation TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                FOREIGN KEY (document_id) REFERENCES documents (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS timer_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id BLOB NOT NULL,
                session_data TEXT NOT NULL DEFAULT '{}',
                work_duration INTEGER NOT NULL DEFAULT 25,
                short_break_duration INTEGER NOT NULL DEFAULT 5,
                long_break_duration INTEGER NOT NULL DEFAULT 15,
                sessions_before_long_break INTEGER NOT NULL DEFAULT 4,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (document_id) REFERENCES documents (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS user_preferences (
                user_id TEXT PRIMARY KEY,
                sidebar_collapsed INTEGER NOT NULL DEFAULT 0,
                tutorial_completed INTEGER NOT NULL DEFAULT 0,
                theme_preferences TEXT NOT NULL DEFAULT '{}',
                drive_sync_enabled INTEGER NOT NULL DEFAULT 0,
                drive_folder_id TEXT NOT NULL DEFAULT ''
            );

            -- One row per document; the reconciler upserts it on every attempt
            CREATE TABLE IF NOT EXISTS sync_records (
                document_id BLOB PRIMARY KEY,
                external_file_id TEXT NOT NULL DEFAULT '',
                sync_status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (sync_status IN ('synced', 'pending', 'error', 'conflict')),
                last_synced_at INTEGER NOT NULL,
                error_message TEXT NOT NULL DEFAULT '',
                FOREIGN KEY (document_id) REFERENCES documents (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS oauth_tokens (
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL DEFAULT '',
                client_id TEXT NOT NULL DEFAULT '',
                client_secret TEXT NOT NULL DEFAULT '',
                expires_at INTEGER,
                PRIMARY KEY (user_id, provider)
            );
            "#,
        )?;
        Ok(())
    }

    /// Get the underlying connection (for advanced operations)
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Resolve a document the user owns to its primary key bytes.
    pub(crate) fn owned_document_key(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> WritingResult<Vec<u8>> {
        let uuid = validate_document_id(document_id)?;
        let key = uuid.as_bytes().to_vec();

        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM documents WHERE id = ? AND user_id = ?",
                params![key, user_id],
                |_| Ok(()),
            )
            .optional()?;

        match exists {
            Some(()) => Ok(key),
            None => Err(WritingError::not_found(format!("Document {}", document_id))),
        }
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Create a new document owned by `user_id`
    pub fn create_document(
        &self,
        user_id: &str,
        title: &str,
        content: &str,
    ) -> WritingResult<Document> {
        validate_user_id(user_id)?;
        validate_title(title)?;
        validate_document_content(content)?;

        let title = title_or_default(title);
        let id = Uuid::now_v7();
        let now = now_unix();

        self.conn.execute(
            r#"
            INSERT INTO documents (id, user_id, title, content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![id.as_bytes().to_vec(), user_id, title, content, now, now],
        )?;

        Ok(Document {
            id: uuid_to_hex(&id),
            title: title.to_string(),
            content: content.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a document by ID, or None if it does not exist for this user
    pub fn get_document(&self, user_id: &str, document_id: &str) -> WritingResult<Option<Document>> {
        let uuid = validate_document_id(document_id)?;

        let document = self
            .conn
            .query_row(
                r#"
                SELECT id, user_id, title, content, created_at, updated_at
                FROM documents
                WHERE id = ? AND user_id = ?
                "#,
                params![uuid.as_bytes().to_vec(), user_id],
                |row| self.row_to_document(row),
            )
            .optional()?;
        Ok(document)
    }

    /// Get a document by ID, failing with NotFound when absent
    pub fn require_document(&self, user_id: &str, document_id: &str) -> WritingResult<Document> {
        self.get_document(user_id, document_id)?
            .ok_or_else(|| WritingError::not_found(format!("Document {}", document_id)))
    }

    /// Overwrite a document's title and content
    pub fn save_document(
        &self,
        user_id: &str,
        document_id: &str,
        title: &str,
        content: &str,
    ) -> WritingResult<Document> {
        validate_title(title)?;
        validate_document_content(content)?;
        let key = self.owned_document_key(user_id, document_id)?;

        self.conn.execute(
            "UPDATE documents SET title = ?, content = ?, updated_at = ? WHERE id = ?",
            params![title_or_default(title), content, now_unix(), key],
        )?;

        self.require_document(user_id, document_id)
    }

    /// List a user's documents, most recently updated first
    pub fn list_documents(&self, user_id: &str) -> WritingResult<Vec<DocumentSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, title, created_at, updated_at
            FROM documents
            WHERE user_id = ?
            ORDER BY updated_at DESC, id DESC
            "#,
        )?;

        let documents = stmt
            .query_map([user_id], |row| {
                let id_bytes: Vec<u8> = row.get(0)?;
                Ok(DocumentSummary {
                    id: uuid_bytes_to_hex(&id_bytes).unwrap_or_default(),
                    title: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(documents)
    }

    /// Delete a document and everything that hangs off it
    pub fn delete_document(&self, user_id: &str, document_id: &str) -> WritingResult<bool> {
        let uuid = validate_document_id(document_id)?;
        let deleted = self.conn.execute(
            "DELETE FROM documents WHERE id = ? AND user_id = ?",
            params![uuid.as_bytes().to_vec(), user_id],
        )?;
        Ok(deleted > 0)
    }

    /// The user's most recently updated document, creating a welcome document
    /// for users who have none yet
    pub fn latest_or_welcome_document(&self, user_id: &str) -> WritingResult<Document> {
        let latest = self
            .conn
            .query_row(
                r#"
                SELECT id, user_id, title, content, created_at, updated_at
                FROM documents
                WHERE user_id = ?
                ORDER BY updated_at DESC, id DESC
                LIMIT 1
                "#,
                [user_id],
                |row| self.row_to_document(row),
            )
            .optional()?;

        match latest {
            Some(document) => Ok(document),
            None => self.create_document(user_id, WELCOME_DOCUMENT_TITLE, WELCOME_DOCUMENT_CONTENT),
        }
    }

    fn row_to_document(&self, row: &Row) -> rusqlite::Result<Document> {
        let id_bytes: Vec<u8> = row.get(0)?;
        Ok(Document {
            id: uuid_bytes_to_hex(&id_bytes).unwrap_or_default(),
            user_id: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    // ========================================================================
    // Key terms
    // ========================================================================

    /// Replace the full set of key terms for a document
    pub fn save_key_terms(
        &self,
        user_id: &str,
        document_id: &str,
        terms: &[KeyTerm],
    ) -> WritingResult<()> {
        let key = self.owned_document_key(user_id, document_id)?;

        for (i, term) in terms.iter().enumerate() {
            validate_key_term(&term.term)?;
            if terms[..i].iter().any(|t| t.term.trim() == term.term.trim()) {
                return Err(WritingError::validation(
                    "terms",
                    format!("duplicate term '{}'", term.term.trim()),
                ));
            }
        }

        let now = now_unix();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM key_terms WHERE document_id = ?", [&key])?;
        for term in terms {
            tx.execute(
                r#"
                INSERT INTO key_terms (document_id, term, definition, created_at)
                VALUES (?, ?, ?, ?)
                "#,
                params![key, term.term.trim(), term.definition, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_key_terms(&self, user_id: &str, document_id: &str) -> WritingResult<Vec<KeyTerm>> {
        let key = self.owned_document_key(user_id, document_id)?;
        let mut stmt = self
            .conn
            .prepare("SELECT term, definition FROM key_terms WHERE document_id = ? ORDER BY id")?;
        let terms = stmt
            .query_map([key], |row| {
                Ok(KeyTerm {
                    term: row.get(0)?,
                    definition: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(terms)
    }

    // ========================================================================
    // Meta-analysis
    // ========================================================================

    /// Create or overwrite the meta-analysis of each given paragraph
    pub fn save_meta_analyses(
        &self,
        user_id: &str,
        document_id: &str,
        paragraphs: &[ParagraphNotes],
    ) -> WritingResult<()> {
        let key = self.owned_document_key(user_id, document_id)?;
        for paragraph in paragraphs {
            validate_paragraph_index(paragraph.paragraph_index)?;
        }

        let now = now_unix();
        let tx = self.conn.unchecked_transaction()?;
        for paragraph in paragraphs {
            tx.execute(
                r#"
                INSERT INTO meta_analyses
                    (document_id, paragraph_index, says_content, does_content, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(document_id, paragraph_index) DO UPDATE SET
                    says_content = excluded.says_content,
                    does_content = excluded.does_content,
                    updated_at = excluded.updated_at
                "#,
                params![key, paragraph.paragraph_index, paragraph.says, paragraph.does, now, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Meta-analyses ordered by paragraph index
    pub fn get_meta_analyses(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> WritingResult<Vec<MetaAnalysis>> {
        let key = self.owned_document_key(user_id, document_id)?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT paragraph_index, says_content, does_content, updated_at
            FROM meta_analyses
            WHERE document_id = ?
            ORDER BY paragraph_index
            "#,
        )?;
        let rows = stmt
            .query_map([key], |row| {
                Ok(MetaAnalysis {
                    paragraph_index: row.get(0)?,
                    says: row.get(1)?,
                    does: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========================================================================
    // Annotations
    // ========================================================================

    /// Create or overwrite an annotation identified by its client-side ID
    pub fn save_annotation(
        &self,
        user_id: &str,
        document_id: &str,
        annotation_id: &str,
        content: &str,
        paragraph_index: Option<i64>,
    ) -> WritingResult<Annotation> {
        validate_annotation_id(annotation_id)?;
        if let Some(index) = paragraph_index {
            validate_paragraph_index(index)?;
        }
        let key = self.owned_document_key(user_id, document_id)?;
        let now = now_unix();

        self.conn.execute(
            r#"
            INSERT INTO annotations
                (document_id, annotation_id, content, paragraph_index, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id, annotation_id) DO UPDATE SET
                content = excluded.content,
                paragraph_index = excluded.paragraph_index,
                updated_at = excluded.updated_at
            "#,
            params![key, annotation_id, content, paragraph_index, now, now],
        )?;

        let annotation = self.conn.query_row(
            r#"
            SELECT annotation_id, content, paragraph_index, created_at, updated_at
            FROM annotations
            WHERE document_id = ? AND annotation_id = ?
            "#,
            params![key, annotation_id],
            |row| self.row_to_annotation(row),
        )?;
        Ok(annotation)
    }

    pub fn get_annotations(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> WritingResult<Vec<Annotation>> {
        let key = self.owned_document_key(user_id, document_id)?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT annotation_id, content, paragraph_index, created_at, updated_at
            FROM annotations
            WHERE document_id = ?
            ORDER BY created_at, annotation_id
            "#,
        )?;
        let rows = stmt
            .query_map([key], |row| self.row_to_annotation(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_annotation(
        &self,
        user_id: &str,
        document_id: &str,
        annotation_id: &str,
    ) -> WritingResult<bool> {
        let key = self.owned_document_key(user_id, document_id)?;
        let deleted = self.conn.execute(
            "DELETE FROM annotations WHERE document_id = ? AND annotation_id = ?",
            params![key, annotation_id],
        )?;
        Ok(deleted > 0)
    }

    fn row_to_annotation(&self, row: &Row) -> rusqlite::Result<Annotation> {
        Ok(Annotation {
            annotation_id: row.get(0)?,
            content: row.get(1)?,
            paragraph_index: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    // ========================================================================
    // Reflections
    // ========================================================================

    pub fn save_reflection(
        &self,
        user_id: &str,
        document_id: &str,
        reflection_key: &str,
        content: &str,
    ) -> WritingResult<()> {
        validate_reflection_key(reflection_key)?;
        let key = self.owned_document_key(user_id, document_id)?;
        let now = now_unix();

        self.conn.execute(
            r#"
            INSERT INTO reflections (document_id, reflection_key, content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(document_id, reflection_key) DO UPDATE SET
                content = excluded.content,
                updated_at = excluded.updated_at
            "#,
            params![key, reflection_key, content, now, now],
        )?;
        Ok(())
    }

    pub fn get_reflections(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> WritingResult<Vec<Reflection>> {
        let key = self.owned_document_key(user_id, document_id)?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT reflection_key, content, updated_at
            FROM reflections
            WHERE document_id = ?
            ORDER BY reflection_key
            "#,
        )?;
        let rows = stmt
            .query_map([key], |row| {
                Ok(Reflection {
                    reflection_key: row.get(0)?,
                    content: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========================================================================
    // Sources
    // ========================================================================

    pub fn add_source(
        &self,
        user_id: &str,
        document_id: &str,
        source_text: &str,
        citation: &str,
        url: &str,
    ) -> WritingResult<Source> {
        if source_text.trim().is_empty() {
            return Err(WritingError::validation(
                "source_text",
                "cannot be empty or whitespace only",
            ));
        }
        validate_url(url)?;
        let key = self.owned_document_key(user_id, document_id)?;
        let now = now_unix();

        self.conn.execute(
            r#"
            INSERT INTO sources (document_id, source_text, citation, url, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![key, source_text, citation, url, now],
        )?;

        Ok(Source {
            id: self.conn.last_insert_rowid(),
            source_text: source_text.to_string(),
            citation: citation.to_string(),
            url: url.to_string(),
            created_at: now,
        })
    }

    pub fn get_sources(&self, user_id: &str, document_id: &str) -> WritingResult<Vec<Source>> {
        let key = self.owned_document_key(user_id, document_id)?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, source_text, citation, url, created_at
            FROM sources
            WHERE document_id = ?
            ORDER BY id
            "#,
        )?;
        let rows = stmt
            .query_map([key], |row| {
                Ok(Source {
                    id: row.get(0)?,
                    source_text: row.get(1)?,
                    citation: row.get(2)?,
                    url: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_source(
        &self,
        user_id: &str,
        document_id: &str,
        source_id: i64,
    ) -> WritingResult<bool> {
        let key = self.owned_document_key(user_id, document_id)?;
        let deleted = self.conn.execute(
            "DELETE FROM sources WHERE id = ? AND document_id = ?",
            params![source_id, key],
        )?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Timer sessions
    // ========================================================================

    /// Store timer settings for a document, overwriting its current session
    pub fn save_timer_session(
        &self,
        user_id: &str,
        document_id: &str,
        settings: &TimerSettings,
    ) -> WritingResult<TimerSession> {
        for (field, minutes) in [
            ("work_duration", settings.work_duration),
            ("short_break_duration", settings.short_break_duration),
            ("long_break_duration", settings.long_break_duration),
            ("sessions_before_long_break", settings.sessions_before_long_break),
        ] {
            if minutes <= 0 {
                return Err(WritingError::validation(field, "must be positive"));
            }
        }
        let key = self.owned_document_key(user_id, document_id)?;
        let now = now_unix();
        let session_data = settings.session_data.to_string();

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM timer_sessions WHERE document_id = ? ORDER BY updated_at DESC, id DESC LIMIT 1",
                [&key],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.conn.execute(
                    r#"
                    UPDATE timer_sessions
                    SET session_data = ?, work_duration = ?, short_break_duration = ?,
                        long_break_duration = ?, sessions_before_long_break = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                    params![
                        session_data,
                        settings.work_duration,
                        settings.short_break_duration,
                        settings.long_break_duration,
                        settings.sessions_before_long_break,
                        now,
                        id
                    ],
                )?;
            }
            None => {
                self.conn.execute(
                    r#"
                    INSERT INTO timer_sessions
                        (document_id, session_data, work_duration, short_break_duration,
                         long_break_duration, sessions_before_long_break, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                    params![
                        key,
                        session_data,
                        settings.work_duration,
                        settings.short_break_duration,
                        settings.long_break_duration,
                        settings.sessions_before_long_break,
                        now,
                        now
                    ],
                )?;
            }
        }

        self.get_timer_session(user_id, document_id)?
            .ok_or_else(|| WritingError::Other("timer session vanished after save".to_string()))
    }

    pub fn get_timer_session(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> WritingResult<Option<TimerSession>> {
        let key = self.owned_document_key(user_id, document_id)?;
        let session = self
            .conn
            .query_row(
                r#"
                SELECT id, session_data, work_duration, short_break_duration,
                       long_break_duration, sessions_before_long_break, updated_at
                FROM timer_sessions
                WHERE document_id = ?
                ORDER BY updated_at DESC, id DESC
                LIMIT 1
                "#,
                [key],
                |row| {
                    let data: String = row.get(1)?;
                    Ok(TimerSession {
                        id: row.get(0)?,
                        session_data: serde_json::from_str(&data)
                            .unwrap_or(serde_json::Value::Null),
                        work_duration: row.get(2)?,
                        short_break_duration: row.get(3)?,
                        long_break_duration: row.get(4)?,
                        sessions_before_long_break: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    // ========================================================================
    // User preferences
    // ========================================================================

    /// Get a user's preferences, creating the default row on first access
    pub fn get_or_create_preferences(&self, user_id: &str) -> WritingResult<UserPreferences> {
        validate_user_id(user_id)?;
        self.conn.execute(
            "INSERT INTO user_preferences (user_id) VALUES (?) ON CONFLICT(user_id) DO NOTHING",
            [user_id],
        )?;

        let prefs = self.conn.query_row(
            r#"
            SELECT user_id, sidebar_collapsed, tutorial_completed, theme_preferences,
                   drive_sync_enabled, drive_folder_id
            FROM user_preferences
            WHERE user_id = ?
            "#,
            [user_id],
            |row| {
                let theme: String = row.get(3)?;
                Ok(UserPreferences {
                    user_id: row.get(0)?,
                    sidebar_collapsed: row.get(1)?,
                    tutorial_completed: row.get(2)?,
                    theme_preferences: serde_json::from_str(&theme)
                        .unwrap_or_else(|_| serde_json::json!({})),
                    drive_sync_enabled: row.get(4)?,
                    drive_folder_id: row.get(5)?,
                })
            },
        )?;
        Ok(prefs)
    }

    /// Overwrite every preference field
    pub fn save_preferences(&self, prefs: &UserPreferences) -> WritingResult<()> {
        validate_user_id(&prefs.user_id)?;
        self.conn.execute(
            r#"
            INSERT INTO user_preferences
                (user_id, sidebar_collapsed, tutorial_completed, theme_preferences,
                 drive_sync_enabled, drive_folder_id)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                sidebar_collapsed = excluded.sidebar_collapsed,
                tutorial_completed = excluded.tutorial_completed,
                theme_preferences = excluded.theme_preferences,
                drive_sync_enabled = excluded.drive_sync_enabled,
                drive_folder_id = excluded.drive_folder_id
            "#,
            params![
                prefs.user_id,
                prefs.sidebar_collapsed,
                prefs.tutorial_completed,
                prefs.theme_preferences.to_string(),
                prefs.drive_sync_enabled,
                prefs.drive_folder_id
            ],
        )?;
        Ok(())
    }

    /// Cache the user's Drive root folder id
    pub fn set_drive_folder_id(&self, user_id: &str, folder_id: &str) -> WritingResult<()> {
        let mut prefs = self.get_or_create_preferences(user_id)?;
        prefs.drive_folder_id = folder_id.to_string();
        self.save_preferences(&prefs)
    }

    // ========================================================================
    // OAuth tokens
    // ========================================================================

    pub fn get_token(&self, user_id: &str, provider: &str) -> WritingResult<Option<StoredToken>> {
        let token = self
            .conn
            .query_row(
                r#"
                SELECT access_token, refresh_token, client_id, client_secret, expires_at
                FROM oauth_tokens
                WHERE user_id = ? AND provider = ?
                "#,
                params![user_id, provider],
                |row| {
                    Ok(StoredToken {
                        access_token: row.get(0)?,
                        refresh_token: row.get(1)?,
                        client_id: row.get(2)?,
                        client_secret: row.get(3)?,
                        expires_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(token)
    }

    /// Insert or replace the complete credential set for a user
    pub fn store_token(
        &self,
        user_id: &str,
        provider: &str,
        token: &StoredToken,
    ) -> WritingResult<()> {
        validate_user_id(user_id)?;
        self.conn.execute(
            r#"
            INSERT INTO oauth_tokens
                (user_id, provider, access_token, refresh_token, client_id, client_secret, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                client_id = excluded.client_id,
                client_secret = excluded.client_secret,
                expires_at = excluded.expires_at
            "#,
            params![
                user_id,
                provider,
                token.access_token,
                token.refresh_token,
                token.client_id,
                token.client_secret,
                token.expires_at
            ],
        )?;
        Ok(())
    }

    /// Persist a refreshed access token. Returns false if no token row exists.
    pub fn save_access_token(
        &self,
        user_id: &str,
        provider: &str,
        access_token: &str,
        expires_at: Option<i64>,
    ) -> WritingResult<bool> {
        let updated = self.conn.execute(
            r#"
            UPDATE oauth_tokens
            SET access_token = ?, expires_at = ?
            WHERE user_id = ? AND provider = ?
            "#,
            params![access_token, expires_at, user_id, provider],
        )?;
        Ok(updated > 0)
    }

    pub fn delete_token(&self, user_id: &str, provider: &str) -> WritingResult<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM oauth_tokens WHERE user_id = ? AND provider = ?",
            params![user_id, provider],
        )?;
        Ok(deleted > 0)
    }
}
