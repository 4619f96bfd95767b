//! Recording state management
//!
//! Defines the recording lifecycle states, quality tiers, the in-progress
//! session and the persisted recording record.

use crate::detection::types::DetectionFrame;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current state of the recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording in progress
    #[default]
    Idle,
    /// Recorder running, chunks accumulating
    Recording,
    /// Recorder flushing and payload being finalized/persisted
    Processing,
    /// Recording persisted
    Saved,
}

/// Recorder bitrate preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QualityTier {
    #[default]
    #[serde(rename = "HD")]
    Hd,
    #[serde(rename = "SD")]
    Sd,
    #[serde(rename = "LOW")]
    Low,
}

impl QualityTier {
    /// Target bitrate in bits per second
    pub fn bitrate(self) -> u64 {
        match self {
            QualityTier::Hd => 8_000_000,
            QualityTier::Sd => 4_000_000,
            QualityTier::Low => 2_000_000,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            QualityTier::Hd => "HD",
            QualityTier::Sd => "SD",
            QualityTier::Low => "LOW",
        }
    }
}

/// Projected payload size for `elapsed_secs` at the tier's bitrate.
/// Display only; never used as the real size.
pub fn estimate_bytes(quality: QualityTier, elapsed_secs: u64) -> u64 {
    quality.bitrate() / 8 * elapsed_secs
}

/// The in-progress recording
#[derive(Debug, Clone, Default)]
pub struct RecordingSession {
    pub state: RecordingState,
    /// Whole seconds since start
    pub elapsed_secs: u64,
    pub quality: QualityTier,
    /// Encoded chunks in arrival order
    pub chunks: Vec<Vec<u8>>,
    pub last_frame: Option<DetectionFrame>,
    pub started_at: Option<DateTime<Utc>>,
}

impl RecordingSession {
    pub fn new(quality: QualityTier) -> Self {
        Self {
            quality,
            ..Default::default()
        }
    }

    pub fn estimated_bytes(&self) -> u64 {
        estimate_bytes(self.quality, self.elapsed_secs)
    }

    /// True payload size so far
    pub fn buffered_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    /// Concatenate chunks into the final payload, emptying the buffer
    pub fn take_payload(&mut self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.buffered_bytes() as usize);
        for chunk in self.chunks.drain(..) {
            payload.extend_from_slice(&chunk);
        }
        payload
    }
}

/// A finished recording as stored in the recordings collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecording {
    pub id: String,
    /// Display name
    pub title: String,
    /// Storage key of the binary payload
    #[serde(alias = "url", default)]
    pub payload_key: String,
    /// Payload size in bytes
    pub size: u64,
    /// Duration in seconds
    pub duration: u64,
    pub quality: QualityTier,
    /// Faces in the last detection frame at stop time
    pub face_detection_count: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub thumbnail_time: f64,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl PersistedRecording {
    /// Build a record for a payload of `size` bytes; `payload_key` is filled by the store
    pub fn new(
        size: u64,
        duration: u64,
        quality: QualityTier,
        face_detection_count: usize,
        mime_type: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: format!(
                "Face Tracked Recording {}",
                now.with_timezone(&Local).format("%-m/%-d/%Y")
            ),
            payload_key: String::new(),
            size,
            duration,
            quality,
            face_detection_count,
            timestamp: now,
            thumbnail_time: duration as f64 / 2.0,
            mime_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_uses_tier_bitrate() {
        assert_eq!(estimate_bytes(QualityTier::Hd, 10), 10_000_000);
        assert_eq!(estimate_bytes(QualityTier::Sd, 10), 5_000_000);
        assert_eq!(estimate_bytes(QualityTier::Low, 3), 750_000);
        assert_eq!(estimate_bytes(QualityTier::Hd, 0), 0);
    }

    #[test]
    fn test_take_payload_concatenates_in_order() {
        let mut session = RecordingSession::new(QualityTier::Sd);
        session.chunks = vec![vec![1, 2], vec![3], vec![4, 5, 6]];

        assert_eq!(session.buffered_bytes(), 6);
        assert_eq!(session.take_payload(), vec![1, 2, 3, 4, 5, 6]);
        assert!(session.chunks.is_empty());
    }

    #[test]
    fn test_record_title_and_thumbnail() {
        let record = PersistedRecording::new(2048, 9, QualityTier::Low, 2, None);
        assert!(record.title.starts_with("Face Tracked Recording "));
        assert_eq!(record.thumbnail_time, 4.5);
        assert!(Uuid::parse_str(&record.id).is_ok());
    }

    #[test]
    fn test_legacy_record_with_url_field() {
        let json = r#"{
            "id": "abc",
            "title": "Face Tracked Recording 1/2/2024",
            "url": "blob:legacy",
            "size": 10,
            "duration": 3,
            "quality": "HD",
            "faceDetectionCount": 1,
            "timestamp": "2024-01-02T10:00:00Z",
            "thumbnailTime": 1.5
        }"#;

        let record: PersistedRecording = serde_json::from_str(json).unwrap();
        assert_eq!(record.payload_key, "blob:legacy");
        assert_eq!(record.quality, QualityTier::Hd);
        assert_eq!(record.mime_type, None);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RecordingState::Processing).unwrap(),
            "\"processing\""
        );
    }
}
