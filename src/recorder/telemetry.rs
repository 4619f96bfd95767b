//! Status panel formatting

use super::state::{QualityTier, RecordingState};
use crate::capture::permissions::PermissionState;
use crate::capture::traits::FacingMode;
use crate::detection::types::{DetectionStats, TrackingStatus};
use serde::Serialize;

/// Everything a status panel shows, in one read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub permission: PermissionState,
    pub camera_ready: bool,
    pub facing_mode: FacingMode,
    pub state: RecordingState,
    pub quality: QualityTier,
    pub elapsed_secs: u64,
    /// `MM:SS` or `H:MM:SS`
    pub elapsed: String,
    pub estimated_bytes: u64,
    pub estimated_size: String,
    pub faces_in_frame: usize,
    pub tracking_status: String,
    pub detection_stats: DetectionStats,
    pub recordings_stored: usize,
    pub storage_used_bytes: u64,
    pub storage_used: String,
}

impl TelemetrySnapshot {
    pub fn tracking(faces_in_frame: usize) -> String {
        TrackingStatus::from_face_count(faces_in_frame).to_string()
    }
}

/// `MM:SS`, or `H:MM:SS` from one hour on
pub fn format_elapsed(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// Human-readable size with 1024-based units, one decimal, trailing `.0` dropped
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", rounded, UNITS[unit])
    }
}
