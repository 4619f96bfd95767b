//! Recorder configuration
//!
//! Every field has a default, so a partial (or missing) config file still
//! produces a usable configuration.

use crate::recorder::state::QualityTier;
use crate::utils::error::RecorderResult;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Recorder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Quality tier used for new recordings
    pub quality: QualityTier,

    /// Preferred capture width in pixels
    pub ideal_width: u32,

    /// Preferred capture height in pixels
    pub ideal_height: u32,

    /// Whether capture streams include a microphone track
    pub capture_audio: bool,

    /// Interval at which the platform recorder delivers chunks
    pub recorder_timeslice_ms: u64,

    /// Container/codec requested from the platform recorder
    pub mime_type: String,

    /// Face-detection sampling interval (100ms = 10 samples per second)
    pub sample_interval_ms: u64,

    /// Resolution of the elapsed-time ticker
    pub elapsed_tick_ms: u64,

    /// How long a permission prompt may stay pending before it counts as denied
    pub permission_prompt_timeout_ms: u64,

    /// Number of recordings kept in the library before the oldest is evicted
    pub max_recordings: usize,

    /// Capacity of the recorder -> state machine chunk channel
    pub chunk_channel_capacity: usize,

    /// Directory for the on-disk store (in-memory store when unset)
    pub storage_dir: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            quality: QualityTier::Hd,
            ideal_width: 1280,
            ideal_height: 720,
            capture_audio: true,
            recorder_timeslice_ms: 1000,
            mime_type: "video/webm;codecs=vp9,opus".to_string(),
            sample_interval_ms: 100,
            elapsed_tick_ms: 1000,
            permission_prompt_timeout_ms: 60_000,
            max_recordings: 50,
            chunk_channel_capacity: 64,
            storage_dir: None,
        }
    }
}

impl RecorderConfig {
    /// Load configuration from a JSON file, falling back to defaults when the file is absent
    pub fn load(path: &Path) -> RecorderResult<Self> {
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: RecorderConfig = serde_json::from_str(&content)?;

        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn save(&self, path: &Path) -> RecorderResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn recorder_timeslice(&self) -> Duration {
        Duration::from_millis(self.recorder_timeslice_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn elapsed_tick(&self) -> Duration {
        Duration::from_millis(self.elapsed_tick_ms)
    }

    pub fn permission_prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_prompt_timeout_ms)
    }
}
