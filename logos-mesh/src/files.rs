//! Local file blobs and the room's shared file metadata.
//!
//! Owned files keep their bytes in memory for the lifetime of the
//! session. Files announced by other participants are metadata only;
//! their content is fetched with a `file-request` and handed to the
//! caller on arrival, never retained here.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::protocol::{FileId, FileMetadata, FilePayload, ParticipantId};

/// Largest accepted upload: 50 MiB.
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// A file offered by the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

/// Content delivered by a `file-response`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub id: FileId,
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// File errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    #[error("file \"{name}\" is too large ({size} bytes, limit {limit})")]
    TooLarge { name: String, size: u64, limit: u64 },
    #[error("file {0} not found")]
    NotFound(FileId),
}

pub struct FileService {
    owner: ParticipantId,
    max_size: u64,
    local: HashMap<FileId, Vec<u8>>,
    shared: BTreeMap<FileId, FileMetadata>,
    pending: HashSet<FileId>,
}

impl FileService {
    pub fn new(owner: ParticipantId, max_size: u64) -> Self {
        Self {
            owner,
            max_size,
            local: HashMap::new(),
            shared: BTreeMap::new(),
            pending: HashSet::new(),
        }
    }

    /// Register a local upload and return its metadata.
    ///
    /// Oversize uploads are rejected before anything is stored.
    pub fn add_file(&mut self, upload: FileUpload) -> Result<FileMetadata, FileError> {
        let size = upload.bytes.len() as u64;
        if size > self.max_size {
            return Err(FileError::TooLarge {
                name: upload.name,
                size,
                limit: self.max_size,
            });
        }

        let metadata = FileMetadata {
            id: FileId::generate(),
            name: upload.name,
            mime_type: upload.mime_type,
            size,
            owner: self.owner.clone(),
        };
        self.local.insert(metadata.id.clone(), upload.bytes);
        self.shared.insert(metadata.id.clone(), metadata.clone());
        log::debug!("Added file {} ({} bytes)", metadata.id, size);
        Ok(metadata)
    }

    /// Drop a file's blob (if owned) and its metadata.
    pub fn remove_file(&mut self, id: &FileId) -> Result<FileMetadata, FileError> {
        self.local.remove(id);
        self.pending.remove(id);
        self.shared
            .remove(id)
            .ok_or_else(|| FileError::NotFound(id.clone()))
    }

    /// Record metadata announced by someone else. Returns true if new.
    pub fn register_shared(&mut self, metadata: FileMetadata) -> bool {
        if self.shared.contains_key(&metadata.id) {
            return false;
        }
        self.shared.insert(metadata.id.clone(), metadata);
        true
    }

    pub fn metadata(&self, id: &FileId) -> Option<&FileMetadata> {
        self.shared.get(id)
    }

    pub fn all_metadata(&self) -> Vec<FileMetadata> {
        self.shared.values().cloned().collect()
    }

    pub fn is_local(&self, id: &FileId) -> bool {
        self.local.contains_key(id)
    }

    /// Full content for a locally owned file, None otherwise.
    pub fn handle_file_request(&self, id: &FileId) -> Option<FilePayload> {
        let bytes = self.local.get(id)?;
        let metadata = self.shared.get(id)?;
        Some(FilePayload::new(metadata.clone(), bytes.clone()))
    }

    /// Turn a response into a download for the caller. The pending
    /// marker is cleared and the bytes are not kept.
    pub fn handle_file_response(&mut self, payload: FilePayload) -> ReceivedFile {
        if !self.pending.remove(&payload.id) {
            log::debug!("Received file {} that was not requested", payload.id);
        }
        let metadata = payload.metadata();
        if !self.shared.contains_key(&metadata.id) {
            self.shared.insert(metadata.id.clone(), metadata);
        }
        ReceivedFile {
            id: payload.id,
            name: payload.name,
            mime_type: payload.mime_type,
            bytes: payload.content,
        }
    }

    pub fn mark_pending(&mut self, id: FileId) {
        self.pending.insert(id);
    }

    pub fn is_pending(&self, id: &FileId) -> bool {
        self.pending.contains(id)
    }

    pub fn pending(&self) -> Vec<FileId> {
        let mut ids: Vec<_> = self.pending.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Release every blob and forget all metadata.
    pub fn clear(&mut self) {
        self.local.clear();
        self.shared.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> FileService {
        FileService::new(ParticipantId::new("a"), MAX_FILE_SIZE)
    }

    #[test]
    fn test_add_and_request() {
        let mut files = service();
        let meta = files
            .add_file(FileUpload::new("report.pdf", "application/pdf", vec![7; 10]))
            .unwrap();

        assert_eq!(meta.size, 10);
        assert_eq!(meta.owner.as_str(), "a");
        assert!(files.is_local(&meta.id));

        let payload = files.handle_file_request(&meta.id).unwrap();
        assert_eq!(payload.content, vec![7; 10]);
        assert_eq!(payload.metadata(), meta);
    }

    #[test]
    fn test_oversize_rejected_without_registration() {
        let mut files = FileService::new(ParticipantId::new("a"), 4);
        let err = files
            .add_file(FileUpload::new("big.bin", "application/octet-stream", vec![0; 5]))
            .unwrap_err();

        assert_eq!(
            err,
            FileError::TooLarge {
                name: "big.bin".into(),
                size: 5,
                limit: 4
            }
        );
        assert!(files.all_metadata().is_empty());
    }

    #[test]
    fn test_exactly_at_limit_is_accepted() {
        let mut files = FileService::new(ParticipantId::new("a"), 4);
        assert!(files.add_file(FileUpload::new("ok", "text/plain", vec![0; 4])).is_ok());
    }

    #[test]
    fn test_request_for_foreign_file() {
        let mut files = service();
        let meta = FileMetadata {
            id: FileId::new("x"),
            name: "n".into(),
            mime_type: "t".into(),
            size: 1,
            owner: ParticipantId::new("b"),
        };
        assert!(files.register_shared(meta.clone()));
        assert!(!files.register_shared(meta.clone()));
        assert!(files.handle_file_request(&meta.id).is_none());
        assert!(files.handle_file_request(&FileId::new("missing")).is_none());
    }

    #[test]
    fn test_response_clears_pending_and_keeps_no_bytes() {
        let mut files = service();
        let meta = FileMetadata {
            id: FileId::new("x"),
            name: "report.pdf".into(),
            mime_type: "application/pdf".into(),
            size: 3,
            owner: ParticipantId::new("b"),
        };
        files.register_shared(meta.clone());
        files.mark_pending(meta.id.clone());
        assert!(files.is_pending(&meta.id));

        let received = files.handle_file_response(FilePayload::new(meta.clone(), vec![1, 2, 3]));

        assert_eq!(received.bytes, vec![1, 2, 3]);
        assert!(!files.is_pending(&meta.id));
        assert!(!files.is_local(&meta.id));
        assert!(files.handle_file_request(&meta.id).is_none());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut files = service();
        let meta = files.add_file(FileUpload::new("a.txt", "text/plain", vec![1])).unwrap();

        assert_eq!(files.remove_file(&meta.id).unwrap(), meta);
        assert_eq!(files.remove_file(&meta.id), Err(FileError::NotFound(meta.id.clone())));

        files.add_file(FileUpload::new("b.txt", "text/plain", vec![1])).unwrap();
        files.mark_pending(FileId::new("p"));
        files.clear();
        assert!(files.all_metadata().is_empty());
        assert!(files.pending().is_empty());
    }
}
