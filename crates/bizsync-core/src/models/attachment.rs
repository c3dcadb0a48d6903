use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AttachmentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Audio,
    Image,
    File,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Audio => "audio",
            AttachmentKind::Image => "image",
            AttachmentKind::File => "file",
        }
    }

    fn default_content_type(&self) -> &'static str {
        match self {
            AttachmentKind::Audio => "audio/m4a",
            AttachmentKind::Image => "image/jpeg",
            AttachmentKind::File => "application/octet-stream",
        }
    }

    fn default_extension(&self) -> &'static str {
        match self {
            AttachmentKind::Audio => "m4a",
            AttachmentKind::Image => "jpg",
            AttachmentKind::File => "bin",
        }
    }
}

/// `Idle -> Recording -> Idle` (cancel), `Idle -> Uploading -> Uploaded`,
/// `Idle -> Uploading -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Recording,
    Uploading,
    Uploaded,
    Failed,
}

/// Where the attachment content lives before upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalSource {
    File(PathBuf),
    /// Captured in memory (finished recordings)
    Memory(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub source: LocalSource,
    pub kind: AttachmentKind,
    pub upload_state: UploadState,
    pub byte_size: Option<u64>,
    pub content_type: Option<String>,
    /// Hex SHA-256 of the uploaded bytes
    pub sha256: Option<String>,
    remote_url: Option<String>,
}

impl Attachment {
    pub fn from_path<P: AsRef<Path>>(path: P, kind: AttachmentKind) -> Self {
        Self::new(LocalSource::File(path.as_ref().to_path_buf()), kind)
    }

    pub fn from_bytes(bytes: Vec<u8>, kind: AttachmentKind) -> Self {
        Self::new(LocalSource::Memory(bytes), kind)
    }

    fn new(source: LocalSource, kind: AttachmentKind) -> Self {
        Self {
            source,
            kind,
            upload_state: UploadState::Idle,
            byte_size: None,
            content_type: None,
            sha256: None,
            remote_url: None,
        }
    }

    pub fn local_uri(&self) -> String {
        match &self.source {
            LocalSource::File(path) => format!("file://{}", path.display()),
            LocalSource::Memory(bytes) => format!("memory://{}-bytes", bytes.len()),
        }
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.remote_url.as_deref()
    }

    pub fn is_uploaded(&self) -> bool {
        self.upload_state == UploadState::Uploaded && self.remote_url.is_some()
    }

    /// Set the remote reference. It can be set exactly once.
    pub fn set_remote_url(&mut self, url: String) -> Result<(), AttachmentError> {
        if let Some(existing) = &self.remote_url {
            return Err(AttachmentError::InvalidState(format!(
                "remote url already set to {}",
                existing
            )));
        }
        self.remote_url = Some(url);
        self.upload_state = UploadState::Uploaded;
        Ok(())
    }

    /// File extension used for the storage key
    pub fn extension(&self) -> String {
        match &self.source {
            LocalSource::File(path) => path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_else(|| self.kind.default_extension().to_string()),
            LocalSource::Memory(_) => self.kind.default_extension().to_string(),
        }
    }
}

/// Infer a MIME type from the file extension, falling back to the kind default
pub fn infer_content_type(source: &LocalSource, kind: AttachmentKind) -> String {
    let ext = match source {
        LocalSource::File(path) => path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase()),
        LocalSource::Memory(_) => None,
    };

    let mime = match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("m4a") => "audio/m4a",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => kind.default_content_type(),
    };
    mime.to_string()
}
