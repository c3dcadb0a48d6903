use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::error::AttachmentError;
use crate::models::{Attachment, AttachmentKind, UploadState};

/// Microphone (or any audio source) the pipeline records from
pub trait AudioDevice: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioCapture>, AttachmentError>;
}

/// An open capture on the device
pub trait AudioCapture: Send {
    /// Stop capturing and return the encoded audio
    fn finish(&mut self) -> Result<Vec<u8>, AttachmentError>;

    /// Stop capturing and discard everything
    fn release(&mut self);
}

/// Gate allowing a single open recording at a time
#[derive(Clone)]
pub struct RecordingSlot {
    semaphore: Arc<Semaphore>,
}

impl Default for RecordingSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSlot {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    fn try_claim(&self) -> Result<OwnedSemaphorePermit, AttachmentError> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| AttachmentError::RecordingBusy)
    }
}

/// An active recording. The device and the recording slot are released
/// when the session ends, whichever way it ends.
pub struct RecordingSession {
    capture: Option<Box<dyn AudioCapture>>,
    _permit: OwnedSemaphorePermit,
    started: Instant,
    max_duration: Duration,
}

impl RecordingSession {
    pub(crate) fn start(
        slot: &RecordingSlot,
        device: &dyn AudioDevice,
        max_duration: Duration,
    ) -> Result<Self, AttachmentError> {
        let permit = slot.try_claim()?;
        let capture = device.open()?;
        info!("Recording started");
        Ok(Self {
            capture: Some(capture),
            _permit: permit,
            started: Instant::now(),
            max_duration,
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.max_duration.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.max_duration
    }

    /// Resolves once the duration cap is reached; race it against user input
    /// and call [`stop`](Self::stop) when it fires.
    pub fn until_expired(&self) -> tokio::time::Sleep {
        tokio::time::sleep(self.remaining())
    }

    /// Finalize the recording into an attachment ready for upload
    pub fn stop(mut self) -> Result<Attachment, AttachmentError> {
        let mut capture = self
            .capture
            .take()
            .ok_or_else(|| AttachmentError::InvalidState("recording already finished".into()))?;
        let result = capture.finish();
        if result.is_err() {
            capture.release();
        }
        let bytes = result?;
        info!(duration_ms = self.elapsed().as_millis() as u64, bytes = bytes.len(), "Recording stopped");

        let mut attachment = Attachment::from_bytes(bytes, AttachmentKind::Audio);
        attachment.upload_state = UploadState::Uploading;
        Ok(attachment)
    }

    /// Abandon the recording. Never produces an attachment.
    pub fn cancel(mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.release();
        }
        debug!("Recording cancelled");
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.release();
            debug!("Recording dropped, device released");
        }
    }
}
