//! Shared utilities

pub mod error;

pub use error::{ErrorResponse, PermissionDenial, RecorderError, RecorderResult};
