//! Error types and handling
//!
//! Common error types used across the recorder.

use crate::detection::DetectionError;
use crate::store::PersistenceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a permission request did not end in `Granted`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDenial {
    /// Retryable in-process by resolving permissions again
    Denied,
    /// Needs user action outside the app (device or browser settings)
    Blocked,
}

impl fmt::Display for PermissionDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionDenial::Denied => write!(f, "denied"),
            PermissionDenial::Blocked => write!(f, "blocked"),
        }
    }
}

/// Recorder-wide error type
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Capability unsupported: {0}")]
    Capability(String),

    #[error("Permission {kind}: {reason}")]
    Permission {
        kind: PermissionDenial,
        reason: String,
    },

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Detection error: {0}")]
    Detection(#[from] DetectionError),

    #[error("Invalid state transition: {0}")]
    Precondition(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecorderError {
    pub fn precondition(message: impl Into<String>) -> Self {
        RecorderError::Precondition(message.into())
    }

    /// Whether retrying the same operation in-process can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            RecorderError::Permission { kind, .. } => *kind == PermissionDenial::Denied,
            RecorderError::Capture(_) | RecorderError::Persistence(_) => true,
            RecorderError::Detection(e) => !e.is_fatal(),
            RecorderError::Capability(_)
            | RecorderError::Precondition(_)
            | RecorderError::Io(_)
            | RecorderError::Serialization(_) => false,
        }
    }

    /// Stable error code for frontends
    pub fn code(&self) -> &'static str {
        match self {
            RecorderError::Capability(_) => "CAPABILITY_UNSUPPORTED",
            RecorderError::Permission {
                kind: PermissionDenial::Denied,
                ..
            } => "PERMISSION_DENIED",
            RecorderError::Permission {
                kind: PermissionDenial::Blocked,
                ..
            } => "PERMISSION_BLOCKED",
            RecorderError::Capture(_) => "CAPTURE_ERROR",
            RecorderError::Detection(e) if e.is_fatal() => "DETECTION_FATAL",
            RecorderError::Detection(_) => "DETECTION_TRANSIENT",
            RecorderError::Precondition(_) => "PRECONDITION_FAILED",
            RecorderError::Persistence(_) => "PERSISTENCE_ERROR",
            RecorderError::Io(_) => "IO_ERROR",
            RecorderError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Error response for frontend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&RecorderError> for ErrorResponse {
    fn from(error: &RecorderError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

impl From<RecorderError> for ErrorResponse {
    fn from(error: RecorderError) -> Self {
        ErrorResponse::from(&error)
    }
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;
