/// Failures reported by the hosted collaborators (persistence, push, storage).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Row not found")]
    NotFound,
    #[error("Rejected by backend: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Network(_))
    }
}

/// Attachment pipeline failures. None of these ever leave a partial object
/// visible to readers.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("Upload failed: {0}")]
    Network(String),
    #[error("Attachment is {size} bytes, cap is {cap}")]
    SizeExceeded { size: u64, cap: u64 },
    #[error("Failed to read attachment: {0}")]
    Read(#[from] std::io::Error),
    #[error("Another recording is already active")]
    RecordingBusy,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Invalid attachment state: {0}")]
    InvalidState(String),
}

impl AttachmentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AttachmentError::Network(_))
    }
}

impl From<BackendError> for AttachmentError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Network(msg) => AttachmentError::Network(msg),
            other => AttachmentError::Network(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Transient; the operation may be retried
    #[error("Network error: {0}")]
    Network(String),
    /// Size or format problem; terminal
    #[error("Validation error: {0}")]
    Validation(String),
    /// A pushed row could not be fetched
    #[error("Could not resolve {table} row {row_id}: {reason}")]
    Resolution {
        table: String,
        row_id: String,
        reason: String,
    },
    /// A pending entry was never matched by an echo
    #[error("Message {0} was not confirmed by the backend")]
    Conflict(String),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error("{0} is no longer running")]
    Closed(&'static str),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Attachment(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<BackendError> for SyncError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Network(msg) => SyncError::Network(msg),
            BackendError::NotFound => SyncError::Validation("row not found".to_string()),
            BackendError::Rejected(msg) => SyncError::Validation(msg),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_is_retryable() {
        assert!(SyncError::Network("offline".into()).is_retryable());
        assert!(!SyncError::Validation("too big".into()).is_retryable());
        assert!(!SyncError::Conflict("tmp-1".into()).is_retryable());
        assert!(SyncError::from(AttachmentError::Network("reset".into())).is_retryable());
        assert!(!SyncError::from(AttachmentError::SizeExceeded { size: 10, cap: 5 }).is_retryable());
    }

    #[test]
    fn test_backend_error_mapping() {
        let err: SyncError = BackendError::Network("timeout".into()).into();
        assert!(matches!(err, SyncError::Network(msg) if msg == "timeout"));

        let err: SyncError = BackendError::Rejected("constraint".into()).into();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_size_exceeded_message() {
        let err = AttachmentError::SizeExceeded { size: 6, cap: 5 };
        assert_eq!(err.to_string(), "Attachment is 6 bytes, cap is 5");
    }
}
