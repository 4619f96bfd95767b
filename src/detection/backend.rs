//! Detection backends
//!
//! The sampler drives a `DetectionBackend`; the model itself is swappable.
//! `MockDetectionBackend` synthesizes plausible faces for demos and tests.

use super::types::{round2, BoundingBox, Detection, Landmark, LandmarkKind};
use crate::capture::traits::{StreamMetadata, VideoFrame};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    /// One frame failed; sampling continues
    #[error("Detection failed for one frame: {0}")]
    Transient(String),

    /// The backend is unusable; sampling halts
    #[error("Detection backend failed: {0}")]
    Fatal(String),
}

impl DetectionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectionError::Fatal(_))
    }
}

/// A face detection model
pub trait DetectionBackend: Send {
    fn name(&self) -> &str;

    /// Bind to a stream before the first `detect`. Errors here are fatal.
    fn attach(&mut self, metadata: &StreamMetadata) -> Result<(), DetectionError>;

    /// Detect faces in one frame
    fn detect(&mut self, frame: &VideoFrame) -> Result<Vec<Detection>, DetectionError>;

    /// Release model resources
    fn detach(&mut self);
}

const DEFAULT_FRAME_WIDTH: u32 = 1280;
const DEFAULT_FRAME_HEIGHT: u32 = 720;

/// Landmark positions as fractions of the face box
const LANDMARK_LAYOUT: [(f64, f64, LandmarkKind); 4] = [
    (0.3, 0.35, LandmarkKind::LeftEye),
    (0.7, 0.35, LandmarkKind::RightEye),
    (0.5, 0.55, LandmarkKind::Nose),
    (0.5, 0.75, LandmarkKind::Mouth),
];

/// Randomized stand-in for a real model
pub struct MockDetectionBackend {
    rng: StdRng,
    detection_probability: f64,
    max_faces: usize,
    attached: bool,
}

impl MockDetectionBackend {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic output for tests
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            detection_probability: 0.85,
            max_faces: 3,
            attached: false,
        }
    }

    /// Chance that a frame contains any face, clamped to [0, 1]
    pub fn with_detection_probability(mut self, probability: f64) -> Self {
        self.detection_probability = probability.clamp(0.0, 1.0);
        self
    }

    fn synthesize_face(&mut self, index: usize, frame: &VideoFrame) -> Detection {
        let frame_width = if frame.width > 0 { frame.width } else { DEFAULT_FRAME_WIDTH };
        let frame_height = if frame.height > 0 { frame.height } else { DEFAULT_FRAME_HEIGHT };

        let width = self.rng.gen_range(120..=200).min(frame_width);
        let height = ((width as f64 * 1.2) as u32).min(frame_height);
        let x = self.rng.gen_range(0..=frame_width - width);
        let y = self.rng.gen_range(0..=frame_height - height);
        let confidence = round2(self.rng.gen_range(0.7..=1.0));

        let landmarks = LANDMARK_LAYOUT
            .iter()
            .map(|&(fx, fy, kind)| Landmark {
                x: x as f64 + width as f64 * fx,
                y: y as f64 + height as f64 * fy,
                kind,
            })
            .collect();

        Detection {
            id: format!("face_{}_{}", index, frame.timestamp_ms),
            bbox: BoundingBox {
                x,
                y,
                width,
                height,
            },
            confidence,
            landmarks,
            timestamp: frame.timestamp_ms,
        }
    }
}

impl Default for MockDetectionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionBackend for MockDetectionBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn attach(&mut self, metadata: &StreamMetadata) -> Result<(), DetectionError> {
        tracing::debug!(
            "Mock detector attached to {}x{} stream",
            metadata.width,
            metadata.height
        );
        self.attached = true;
        Ok(())
    }

    fn detect(&mut self, frame: &VideoFrame) -> Result<Vec<Detection>, DetectionError> {
        if !self.attached {
            return Err(DetectionError::Fatal("detector is not attached".to_string()));
        }
        if !self.rng.gen_bool(self.detection_probability) {
            return Ok(Vec::new());
        }

        let count = self.rng.gen_range(1..=self.max_faces);
        Ok((0..count).map(|i| self.synthesize_face(i, frame)).collect())
    }

    fn detach(&mut self) {
        self.attached = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32) -> VideoFrame {
        VideoFrame {
            width,
            height,
            timestamp_ms: 1_700_000_000_000,
            data: Vec::new(),
        }
    }

    fn attached(backend: MockDetectionBackend) -> MockDetectionBackend {
        let mut backend = backend;
        backend
            .attach(&StreamMetadata {
                width: 1280,
                height: 720,
                has_audio: true,
            })
            .unwrap();
        backend
    }

    #[test]
    fn test_detect_before_attach_is_fatal() {
        let mut backend = MockDetectionBackend::seeded(1);
        let err = backend.detect(&frame(1280, 720)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_faces_stay_inside_frame() {
        let mut backend = attached(MockDetectionBackend::seeded(7).with_detection_probability(1.0));

        for _ in 0..200 {
            let faces = backend.detect(&frame(640, 480)).unwrap();
            assert!((1..=3).contains(&faces.len()));
            for face in faces {
                assert!((120..=200).contains(&face.bbox.width));
                assert_eq!(face.bbox.height, (face.bbox.width as f64 * 1.2) as u32);
                assert!(face.bbox.x + face.bbox.width <= 640);
                assert!(face.bbox.y + face.bbox.height <= 480);
                assert!((0.7..=1.0).contains(&face.confidence));
                assert_eq!(face.landmarks.len(), 4);
            }
        }
    }

    #[test]
    fn test_zero_probability_yields_empty_frames() {
        let mut backend = attached(MockDetectionBackend::seeded(3).with_detection_probability(0.0));
        for _ in 0..50 {
            assert!(backend.detect(&frame(1280, 720)).unwrap().is_empty());
        }
    }

    #[test]
    fn test_unknown_frame_size_uses_default() {
        let mut backend = attached(MockDetectionBackend::seeded(11).with_detection_probability(1.0));
        let faces = backend.detect(&frame(0, 0)).unwrap();
        for face in faces {
            assert!(face.bbox.x + face.bbox.width <= 1280);
            assert!(face.bbox.y + face.bbox.height <= 720);
        }
    }

    #[test]
    fn test_ids_unique_within_frame() {
        let mut backend = attached(MockDetectionBackend::seeded(5).with_detection_probability(1.0));
        for _ in 0..50 {
            let faces = backend.detect(&frame(1280, 720)).unwrap();
            let mut ids: Vec<_> = faces.iter().map(|f| f.id.clone()).collect();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), faces.len());
        }
    }

    #[test]
    fn test_detach_stops_detection() {
        let mut backend = attached(MockDetectionBackend::seeded(2));
        backend.detach();
        assert!(backend.detect(&frame(1280, 720)).is_err());
    }
}
