//! Attachment pipeline: record or pick content, validate it, upload it to
//! object storage under a unique key and hand back a stable reference.

pub mod recording;

pub use recording::{AudioCapture, AudioDevice, RecordingSession, RecordingSlot};

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::ObjectStorage;
use crate::config::SyncConfig;
use crate::error::AttachmentError;
use crate::models::{infer_content_type, Attachment, AttachmentKind, LocalSource, UploadState};

/// `<kind>/<unix-millis>-<random suffix>.<ext>`
pub fn generate_key(kind: AttachmentKind, extension: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}/{}-{}.{}",
        kind.as_str(),
        Utc::now().timestamp_millis(),
        &suffix[..12],
        extension
    )
}

pub struct AttachmentPipeline {
    storage: Arc<dyn ObjectStorage>,
    device: RwLock<Option<Arc<dyn AudioDevice>>>,
    slot: RecordingSlot,
    config: SyncConfig,
}

impl AttachmentPipeline {
    pub fn new(storage: Arc<dyn ObjectStorage>, config: &SyncConfig) -> Self {
        Self {
            storage,
            device: RwLock::new(None),
            slot: RecordingSlot::new(),
            config: config.clone(),
        }
    }

    pub fn with_audio_device(self, device: Arc<dyn AudioDevice>) -> Self {
        self.set_audio_device(device);
        self
    }

    /// Attach or replace the capture device. Holders of this pipeline
    /// keep sharing its single recording slot.
    pub fn set_audio_device(&self, device: Arc<dyn AudioDevice>) {
        *self.device.write() = Some(device);
    }

    pub fn is_recording(&self) -> bool {
        self.slot.is_busy()
    }

    /// Begin recording audio. Rejected while another recording is open.
    pub fn start_recording(&self) -> Result<RecordingSession, AttachmentError> {
        let device = self
            .device
            .read()
            .clone()
            .ok_or_else(|| AttachmentError::Device("no audio device configured".into()))?;
        RecordingSession::start(&self.slot, device.as_ref(), self.config.max_recording())
    }

    /// Upload the attachment and return its remote URL.
    /// Already-uploaded attachments return their existing URL.
    pub async fn upload(&self, attachment: &mut Attachment) -> Result<String, AttachmentError> {
        if let Some(url) = attachment.remote_url() {
            return Ok(url.to_string());
        }
        if attachment.upload_state == UploadState::Recording {
            return Err(AttachmentError::InvalidState(
                "cannot upload while recording".into(),
            ));
        }

        attachment.upload_state = UploadState::Uploading;
        match self.transfer(attachment).await {
            Ok(url) => {
                attachment.set_remote_url(url.clone())?;
                Ok(url)
            }
            Err(e) => {
                warn!(uri = %attachment.local_uri(), error = %e, "Attachment upload failed");
                attachment.upload_state = UploadState::Failed;
                Err(e)
            }
        }
    }

    async fn transfer(&self, attachment: &mut Attachment) -> Result<String, AttachmentError> {
        let cap = self.config.max_bytes_for(attachment.kind);

        let bytes = match &attachment.source {
            LocalSource::File(path) => {
                // Reject before reading the whole file
                let size = tokio::fs::metadata(path).await?.len();
                check_size(size, cap)?;
                tokio::fs::read(path).await?
            }
            LocalSource::Memory(bytes) => bytes.clone(),
        };
        let size = bytes.len() as u64;
        check_size(size, cap)?;

        let content_type = infer_content_type(&attachment.source, attachment.kind);
        let digest = hex::encode(Sha256::digest(&bytes));
        let key = generate_key(attachment.kind, &attachment.extension());

        attachment.byte_size = Some(size);
        attachment.content_type = Some(content_type.clone());
        attachment.sha256 = Some(digest);

        let url = self
            .storage
            .upload(&self.config.attachment_bucket, &key, bytes, &content_type)
            .await?;
        info!(key = %key, size, content_type = %content_type, "Attachment uploaded");
        Ok(url)
    }
}

fn check_size(size: u64, cap: u64) -> Result<(), AttachmentError> {
    if size > cap {
        Err(AttachmentError::SizeExceeded { size, cap })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeDevice {
        opened: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    struct FakeCapture {
        released: Arc<AtomicUsize>,
    }

    impl AudioDevice for FakeDevice {
        fn open(&self) -> Result<Box<dyn AudioCapture>, AttachmentError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeCapture {
                released: self.released.clone(),
            }))
        }
    }

    impl AudioCapture for FakeCapture {
        fn finish(&mut self) -> Result<Vec<u8>, AttachmentError> {
            Ok(vec![7; 64])
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pipeline() -> (Arc<MemoryBackend>, AttachmentPipeline, Arc<FakeDevice>) {
        let backend = Arc::new(MemoryBackend::new());
        let device = Arc::new(FakeDevice::default());
        let config = SyncConfig {
            image_max_bytes: 16,
            ..SyncConfig::default()
        };
        let pipeline = AttachmentPipeline::new(backend.clone(), &config).with_audio_device(device.clone());
        (backend, pipeline, device)
    }

    #[test]
    fn test_generate_key_is_unique_and_shaped() {
        let a = generate_key(AttachmentKind::Image, "png");
        let b = generate_key(AttachmentKind::Image, "png");
        assert_ne!(a, b);
        assert!(a.starts_with("image/"));
        assert!(a.ends_with(".png"));
        let stem = a.trim_start_matches("image/").trim_end_matches(".png");
        let (millis, suffix) = stem.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 12);
    }

    #[tokio::test]
    async fn test_upload_file_sets_metadata_and_remote_url() {
        let (backend, pipeline, _) = pipeline();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt.png");
        std::fs::write(&path, [1u8, 2, 3, 4]).unwrap();

        let mut attachment = Attachment::from_path(&path, AttachmentKind::Image);
        let url = pipeline.upload(&mut attachment).await.unwrap();

        assert!(url.starts_with("memory://attachments/image/"));
        assert_eq!(attachment.upload_state, UploadState::Uploaded);
        assert_eq!(attachment.remote_url(), Some(url.as_str()));
        assert_eq!(attachment.byte_size, Some(4));
        assert_eq!(attachment.content_type.as_deref(), Some("image/png"));
        assert_eq!(attachment.sha256.as_ref().unwrap().len(), 64);
        assert_eq!(backend.object_count(), 1);

        // Uploading again is a no-op returning the same reference
        assert_eq!(pipeline.upload(&mut attachment).await.unwrap(), url);
        assert_eq!(backend.object_count(), 1);
    }

    #[tokio::test]
    async fn test_oversize_attachment_is_rejected_before_transfer() {
        let (backend, pipeline, _) = pipeline();
        let mut attachment = Attachment::from_bytes(vec![0; 17], AttachmentKind::Image);

        let err = pipeline.upload(&mut attachment).await.unwrap_err();
        assert!(matches!(err, AttachmentError::SizeExceeded { size: 17, cap: 16 }));
        assert_eq!(attachment.upload_state, UploadState::Failed);
        assert!(attachment.remote_url().is_none());
        assert_eq!(backend.object_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_a_read_error() {
        let (_, pipeline, _) = pipeline();
        let mut attachment = Attachment::from_path("/definitely/not/here.pdf", AttachmentKind::File);
        let err = pipeline.upload(&mut attachment).await.unwrap_err();
        assert!(matches!(err, AttachmentError::Read(_)));
    }

    #[tokio::test]
    async fn test_network_failure_then_retry() {
        let (backend, pipeline, _) = pipeline();
        let mut attachment = Attachment::from_bytes(vec![1; 8], AttachmentKind::File);

        backend.set_offline(true);
        let err = pipeline.upload(&mut attachment).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(attachment.upload_state, UploadState::Failed);
        assert_eq!(backend.object_count(), 0);

        backend.set_offline(false);
        pipeline.upload(&mut attachment).await.unwrap();
        assert!(attachment.is_uploaded());
    }

    #[test]
    fn test_only_one_recording_at_a_time() {
        let (_, pipeline, device) = pipeline();
        let session = pipeline.start_recording().unwrap();
        assert!(pipeline.is_recording());

        assert!(matches!(
            pipeline.start_recording(),
            Err(AttachmentError::RecordingBusy)
        ));
        assert_eq!(device.opened.load(Ordering::SeqCst), 1);

        session.cancel();
        assert!(!pipeline.is_recording());
        assert_eq!(device.released.load(Ordering::SeqCst), 1);
        assert!(pipeline.start_recording().is_ok());
    }

    #[test]
    fn test_dropped_recording_releases_device() {
        let (_, pipeline, device) = pipeline();
        {
            let _session = pipeline.start_recording().unwrap();
        }
        assert_eq!(device.released.load(Ordering::SeqCst), 1);
        assert!(!pipeline.is_recording());
    }

    #[tokio::test]
    async fn test_stopped_recording_uploads() {
        let (backend, pipeline, device) = pipeline();
        let session = pipeline.start_recording().unwrap();
        assert!(!session.is_expired());

        let mut attachment = session.stop().unwrap();
        assert_eq!(attachment.upload_state, UploadState::Uploading);
        assert!(!pipeline.is_recording());
        assert_eq!(device.released.load(Ordering::SeqCst), 0);

        let url = pipeline.upload(&mut attachment).await.unwrap();
        assert!(url.contains("/audio/"));
        assert!(url.ends_with(".m4a"));
        assert_eq!(backend.object_count(), 1);
    }

    #[tokio::test]
    async fn test_recording_cap_fires_and_stop_still_finalizes() {
        let backend = Arc::new(MemoryBackend::new());
        let config = SyncConfig {
            max_recording_secs: 0,
            ..SyncConfig::default()
        };
        let pipeline = AttachmentPipeline::new(backend, &config)
            .with_audio_device(Arc::new(FakeDevice::default()));
        let session = pipeline.start_recording().unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), session.until_expired())
            .await
            .unwrap();
        assert!(session.is_expired());
        assert_eq!(session.remaining(), std::time::Duration::ZERO);

        let attachment = session.stop().unwrap();
        assert_eq!(attachment.kind, AttachmentKind::Audio);
        assert!(!pipeline.is_recording());
    }

    #[test]
    fn test_recording_without_device() {
        let backend = Arc::new(MemoryBackend::new());
        let pipeline = AttachmentPipeline::new(backend, &SyncConfig::default());
        assert!(matches!(pipeline.start_recording(), Err(AttachmentError::Device(_))));
        assert!(!pipeline.is_recording());
    }
}
