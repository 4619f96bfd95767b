//! Recording system module
//!
//! This module implements the recording lifecycle:
//! - RecordingStateMachine driving Idle -> Recording -> Processing -> Saved
//! - SessionController composing permissions, capture, detection and storage
//! - Telemetry formatting for status displays

pub mod coordinator;
pub mod machine;
pub mod state;
pub mod telemetry;

pub use coordinator::{ControllerEvent, SessionController};
pub use machine::{MachineEvent, MachineOptions, MachineSnapshot, RecordingStateMachine, SaveOutcome};
pub use state::{PersistedRecording, QualityTier, RecordingSession, RecordingState};
pub use telemetry::{format_elapsed, format_file_size, TelemetrySnapshot};
