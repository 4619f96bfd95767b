//! Camera capture
//!
//! Permission resolution, exclusive stream ownership and the provider seams
//! the platform plugs into.

pub mod permissions;
pub mod session;
pub mod simulated;
pub mod traits;

#[cfg(feature = "native-camera")]
pub mod native;

pub use permissions::{PermissionGate, PermissionOutcome, PermissionReason, PermissionState};
pub use session::{CaptureEvent, CaptureHandle, CaptureSession};
pub use traits::{
    AccessFailure, ChunkSink, DeviceKind, FacingMode, MediaCaptureProvider, MediaStream,
    PermissionProvider, PermissionStatus, PlatformRecorder, RecorderEvent, RecorderOptions,
    StreamConstraints, StreamMetadata, VideoFrame,
};
