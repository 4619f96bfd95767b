//! Capture trait definitions
//!
//! Platform-agnostic seams for permission queries, stream acquisition and
//! the platform recorder. Concrete providers live in `simulated` and, with the
//! `native-camera` feature, `native`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Which camera a stream is opened against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera, facing the user
    #[default]
    User,
    /// Back camera
    Environment,
}

impl FacingMode {
    /// The opposite camera
    pub fn flipped(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

impl fmt::Display for FacingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacingMode::User => write!(f, "user"),
            FacingMode::Environment => write!(f, "environment"),
        }
    }
}

/// Device class whose authorization is queried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Camera,
    Microphone,
}

/// Authorization state reported by the platform for one device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    /// Hard denial; cannot be changed in-process
    Denied,
    /// Not decided yet; requesting a stream will prompt the user
    Prompt,
}

/// Reason a stream could not be opened
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessFailure {
    #[error("access was rejected by the user")]
    UserRejected,

    #[error("no camera device found")]
    NoDevice,

    #[error("camera is in use by another application")]
    DeviceBusy,

    #[error("{0}")]
    Other(String),
}

/// Stream request sent to the capture provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConstraints {
    pub facing_mode: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub audio: bool,
}

impl StreamConstraints {
    /// 1280x720 with audio, the default recording setup
    pub fn new(facing_mode: FacingMode) -> Self {
        Self {
            facing_mode,
            ideal_width: 1280,
            ideal_height: 720,
            audio: true,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.ideal_width = width;
        self.ideal_height = height;
        self
    }

    pub fn with_audio(mut self, audio: bool) -> Self {
        self.audio = audio;
        self
    }
}

/// Stream properties known once the first frame is decodable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
}

/// A decoded video frame grabbed for analysis
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,
    /// Raw pixel data; may be empty for synthetic sources
    pub data: Vec<u8>,
}

/// Options handed to the platform recorder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderOptions {
    pub mime_type: String,
    pub bits_per_second: u64,
    /// Chunk delivery interval
    pub timeslice: Duration,
}

/// Messages from the platform recorder, delivered in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    /// Encoded media data
    Chunk(Vec<u8>),
    /// Non-fatal recorder problem
    Error(String),
    /// Flush complete; no more chunks follow
    Stopped,
}

/// Producer side of the bounded recorder -> state machine channel.
/// Senders await when the channel is full; nothing is dropped.
pub type ChunkSink = mpsc::Sender<RecorderEvent>;

/// Source of camera/microphone authorization state
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Whether the platform can capture media at all
    fn supports_capture(&self) -> bool;

    /// Current authorization for one device class
    async fn query(&self, device: DeviceKind) -> anyhow::Result<PermissionStatus>;
}

/// Opens capture streams
#[async_trait]
pub trait MediaCaptureProvider: Send + Sync {
    /// Acquire a camera (+ microphone) stream. Prompts the user when undecided.
    async fn open_stream(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Arc<dyn MediaStream>, AccessFailure>;
}

/// A live camera+microphone stream holding a hardware claim
#[async_trait]
pub trait MediaStream: Send + Sync {
    /// Unique stream identifier
    fn id(&self) -> &str;

    /// Resolves once metadata is available (first frame decodable)
    async fn ready(&self) -> Result<StreamMetadata, AccessFailure>;

    /// Whether the tracks are still running
    fn is_live(&self) -> bool;

    /// Resolves when the stream ends, whether stopped or lost
    async fn ended(&self);

    /// Stop all tracks and release the device. Idempotent.
    fn stop(&self);

    /// Latest decodable frame, if any
    fn grab_frame(&self) -> Option<VideoFrame>;

    /// Start the platform recorder on this stream
    fn start_recorder(
        &self,
        options: &RecorderOptions,
        sink: ChunkSink,
    ) -> Result<Box<dyn PlatformRecorder>, AccessFailure>;
}

/// Handle to a running platform recorder
pub trait PlatformRecorder: Send {
    /// Ask the recorder to flush its final chunk and send `RecorderEvent::Stopped`
    fn request_stop(&mut self);
}
