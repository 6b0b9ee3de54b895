//! In-memory [`DriveApi`] with call recording and failure injection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use super::{is_allowed_mime, DriveApi, FOLDER_MIME, GOOGLE_DOC_MIME};
use crate::error::{WritingError, WritingResult};
use crate::html::html_to_text;
use crate::models::DriveFile;

#[derive(Debug, Clone)]
pub(crate) struct MemoryFile {
    pub name: String,
    pub mime_type: String,
    pub content: String,
    pub parent: Option<String>,
    pub trashed: bool,
}

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<String, MemoryFile>,
    next_file: usize,
    next_folder: usize,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<WritingError>>,
}

impl MemoryState {
    fn begin(&mut self, operation: &str, argument: &str) -> WritingResult<()> {
        self.calls.push(format!("{}:{}", operation, argument));
        match self.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub(crate) struct MemoryDrive {
    state: Mutex<MemoryState>,
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `operation` fail with `err`
    pub fn fail_next(&self, operation: &str, err: WritingError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn insert_file(&self, id: &str, name: &str, mime_type: &str, content: &str) {
        self.insert_file_in(None, id, name, mime_type, content);
    }

    pub fn insert_file_in(
        &self,
        parent: Option<&str>,
        id: &str,
        name: &str,
        mime_type: &str,
        content: &str,
    ) {
        self.state.lock().unwrap().files.insert(
            id.to_string(),
            MemoryFile {
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                content: content.to_string(),
                parent: parent.map(String::from),
                trashed: false,
            },
        );
    }

    pub fn remove_file(&self, id: &str) {
        self.state.lock().unwrap().files.remove(id);
    }

    pub fn trash_file(&self, id: &str) {
        if let Some(file) = self.state.lock().unwrap().files.get_mut(id) {
            file.trashed = true;
        }
    }

    pub fn file(&self, id: &str) -> Option<MemoryFile> {
        self.state.lock().unwrap().files.get(id).cloned()
    }

    /// Recorded calls as `operation:argument`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, operation: &str) -> usize {
        let prefix = format!("{}:", operation);
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    pub fn folder_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .files
            .values()
            .filter(|f| f.mime_type == FOLDER_MIME)
            .count()
    }
}

fn to_drive_file(id: &str, file: &MemoryFile) -> DriveFile {
    DriveFile {
        id: id.to_string(),
        name: file.name.clone(),
        mime_type: file.mime_type.clone(),
        modified_at: None,
        created_at: None,
        size: Some(file.content.len() as u64),
        trashed: file.trashed,
    }
}

impl DriveApi for MemoryDrive {
    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> WritingResult<String> {
        let mut state = self.state.lock().unwrap();
        state.begin("create_folder", name)?;
        state.next_folder += 1;
        let id = format!("folder{}", state.next_folder);
        state.files.insert(
            id.clone(),
            MemoryFile {
                name: name.to_string(),
                mime_type: FOLDER_MIME.to_string(),
                content: String::new(),
                parent: parent_id.map(String::from),
                trashed: false,
            },
        );
        Ok(id)
    }

    async fn upload_document(
        &self,
        title: &str,
        html: &str,
        folder_id: Option<&str>,
    ) -> WritingResult<String> {
        let mut state = self.state.lock().unwrap();
        state.begin("upload_document", title)?;
        state.next_file += 1;
        let id = format!("f{}", state.next_file);
        state.files.insert(
            id.clone(),
            MemoryFile {
                name: title.to_string(),
                mime_type: GOOGLE_DOC_MIME.to_string(),
                content: html_to_text(html),
                parent: folder_id.map(String::from),
                trashed: false,
            },
        );
        Ok(id)
    }

    async fn update_document(&self, file_id: &str, html: &str) -> WritingResult<()> {
        let mut state = self.state.lock().unwrap();
        state.begin("update_document", file_id)?;
        match state.files.get_mut(file_id) {
            Some(file) => {
                file.content = html_to_text(html);
                Ok(())
            }
            None => Err(WritingError::not_found(format!("Drive file {}", file_id))),
        }
    }

    async fn download_document(&self, file_id: &str) -> WritingResult<String> {
        let mut state = self.state.lock().unwrap();
        state.begin("download_document", file_id)?;
        state
            .files
            .get(file_id)
            .map(|f| f.content.clone())
            .ok_or_else(|| WritingError::not_found(format!("Drive file {}", file_id)))
    }

    async fn list_documents(&self, folder_id: Option<&str>) -> WritingResult<Vec<DriveFile>> {
        let mut state = self.state.lock().unwrap();
        state.begin("list_documents", folder_id.unwrap_or(""))?;
        Ok(state
            .files
            .iter()
            .filter(|(_, f)| !f.trashed && is_allowed_mime(&f.mime_type))
            .filter(|(_, f)| folder_id.map_or(true, |p| f.parent.as_deref() == Some(p)))
            .map(|(id, f)| to_drive_file(id, f))
            .collect())
    }

    async fn delete_document(&self, file_id: &str) -> WritingResult<()> {
        let mut state = self.state.lock().unwrap();
        state.begin("delete_document", file_id)?;
        state
            .files
            .remove(file_id)
            .map(|_| ())
            .ok_or_else(|| WritingError::not_found(format!("Drive file {}", file_id)))
    }

    async fn get_file_info(&self, file_id: &str) -> WritingResult<Option<DriveFile>> {
        let mut state = self.state.lock().unwrap();
        state.begin("get_file_info", file_id)?;
        Ok(state.files.get(file_id).map(|f| to_drive_file(file_id, f)))
    }

    async fn share_document(&self, file_id: &str, email: &str, role: &str) -> WritingResult<()> {
        let mut state = self.state.lock().unwrap();
        state.begin("share_document", &format!("{}:{}:{}", file_id, email, role))?;
        if state.files.contains_key(file_id) {
            Ok(())
        } else {
            Err(WritingError::not_found(format!("Drive file {}", file_id)))
        }
    }
}
