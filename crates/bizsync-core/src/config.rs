use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{ATTACHMENT_BUCKET, AUDIO_MAX_BYTES, FILE_MAX_BYTES, IMAGE_MAX_BYTES};
use crate::models::AttachmentKind;

/// Tuning knobs for the synchronization core, loadable from a JSON file.
/// Every field has a default so a partial (or empty) file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Attempts to fetch the full row behind a push event
    pub resolve_attempts: u32,
    /// Base backoff between resolution attempts (doubles each retry)
    pub resolve_backoff_ms: u64,
    /// Per-attempt deadline for a row fetch; a timeout counts as a failed attempt
    pub resolve_timeout_ms: u64,
    /// Attempts to persist an outgoing message on transient failure
    pub persist_attempts: u32,
    pub persist_backoff_ms: u64,
    pub persist_timeout_ms: u64,
    /// Max distance between a pending send and a heuristic echo match
    pub echo_window_secs: u64,
    /// A persisted message with no echo after this long is surfaced as Failed
    pub confirm_timeout_secs: u64,
    pub sweep_interval_ms: u64,
    pub feed_page_size: usize,
    pub max_recording_secs: u64,
    pub image_max_bytes: u64,
    pub audio_max_bytes: u64,
    pub file_max_bytes: u64,
    pub attachment_bucket: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resolve_attempts: 3,
            resolve_backoff_ms: 200,
            resolve_timeout_ms: 5000,
            persist_attempts: 3,
            persist_backoff_ms: 500,
            persist_timeout_ms: 10_000,
            echo_window_secs: 30,
            confirm_timeout_secs: 20,
            sweep_interval_ms: 1000,
            feed_page_size: 20,
            max_recording_secs: 300,
            image_max_bytes: IMAGE_MAX_BYTES,
            audio_max_bytes: AUDIO_MAX_BYTES,
            file_max_bytes: FILE_MAX_BYTES,
            attachment_bucket: ATTACHMENT_BUCKET.to_string(),
        }
    }
}

impl SyncConfig {
    /// Load config from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize config")
    }

    /// Upload cap for a given attachment kind
    pub fn max_bytes_for(&self, kind: AttachmentKind) -> u64 {
        match kind {
            AttachmentKind::Image => self.image_max_bytes,
            AttachmentKind::Audio => self.audio_max_bytes,
            AttachmentKind::File => self.file_max_bytes,
        }
    }

    pub fn resolve_backoff(&self) -> Duration {
        Duration::from_millis(self.resolve_backoff_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms.max(1))
    }

    pub fn persist_backoff(&self) -> Duration {
        Duration::from_millis(self.persist_backoff_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms.max(1))
    }

    pub fn echo_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.echo_window_secs as i64)
    }

    pub fn confirm_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.confirm_timeout_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn max_recording(&self) -> Duration {
        Duration::from_secs(self.max_recording_secs)
    }
}
