//! Face detection
//!
//! A swappable backend behind a fixed-cadence sampler.

pub mod backend;
pub mod sampler;
pub mod types;

pub use backend::{DetectionBackend, DetectionError, MockDetectionBackend};
pub use sampler::{DetectionSampler, HaltReason, SamplerEvent};
pub use types::{
    BoundingBox, Detection, DetectionFrame, DetectionStats, Landmark, LandmarkKind,
    TrackingStatus,
};
