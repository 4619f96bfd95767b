//! Detection data types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Axis-aligned box in source-frame pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LandmarkKind {
    LeftEye,
    RightEye,
    Nose,
    Mouth,
}

/// A facial landmark in source-frame pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f64,
    pub y: f64,
    #[serde(rename = "type")]
    pub kind: LandmarkKind,
}

/// One detected face
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// Unique within its frame
    pub id: String,
    #[serde(flatten)]
    pub bbox: BoundingBox,
    /// In [0, 1]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub landmarks: Vec<Landmark>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

/// Result of one sampling tick; possibly empty
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionFrame {
    pub sequence: u64,
    pub captured_at: i64,
    pub detections: Vec<Detection>,
}

impl DetectionFrame {
    pub fn face_count(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// Running totals across all frames since the sampler was armed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStats {
    pub frames_sampled: u64,
    pub total_detections: u64,
    /// Mean confidence across every detection seen, rounded to 2 dp
    pub average_confidence: f64,
    /// Capture time of the last non-empty frame
    pub last_detection_at: Option<i64>,
    #[serde(skip)]
    confidence_sum: f64,
}

impl DetectionStats {
    pub fn record(&mut self, frame: &DetectionFrame) {
        self.frames_sampled += 1;
        if frame.is_empty() {
            return;
        }

        self.total_detections += frame.detections.len() as u64;
        self.confidence_sum += frame.detections.iter().map(|d| d.confidence).sum::<f64>();
        self.average_confidence =
            round2(self.confidence_sum / self.total_detections as f64);
        self.last_detection_at = Some(frame.captured_at);
    }
}

/// Status label derived from the latest frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "faces", rename_all = "lowercase")]
pub enum TrackingStatus {
    Searching,
    Tracking,
    Multiple(usize),
}

impl TrackingStatus {
    pub fn from_face_count(count: usize) -> Self {
        match count {
            0 => TrackingStatus::Searching,
            1 => TrackingStatus::Tracking,
            n => TrackingStatus::Multiple(n),
        }
    }
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingStatus::Searching => write!(f, "Searching"),
            TrackingStatus::Tracking => write!(f, "Tracking"),
            TrackingStatus::Multiple(n) => write!(f, "{n} Faces"),
        }
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
