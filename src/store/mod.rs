//! Recording persistence
//!
//! Recordings live in a key-value backend: one JSON collection under
//! `facetrack_recordings` plus one binary payload per recording under
//! `facetrack_media/<id>`.

pub mod backend;
pub mod library;

pub use backend::{DirectoryBackend, KeyValueBackend, MemoryBackend};
pub use library::RecordingLibrary;

use crate::recorder::state::PersistedRecording;
use async_trait::async_trait;
use thiserror::Error;

/// Key of the recordings collection
pub const RECORDINGS_KEY: &str = "facetrack_recordings";

/// Key prefix for recording payloads
pub const MEDIA_PREFIX: &str = "facetrack_media";

/// Current layout version of the recordings collection
pub const SCHEMA_VERSION: u32 = 1;

/// Storage key for a recording's payload
pub fn media_key(id: &str) -> String {
    format!("{MEDIA_PREFIX}/{id}")
}

/// Persistence failures. Cloneable so a failed save can be reported to
/// several observers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Storage quota exceeded: needed {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("Storage IO failed: {0}")]
    Io(String),

    #[error("Stored data is malformed: {0}")]
    Serialization(String),

    #[error("Unsupported recordings schema version {0}")]
    UnsupportedSchema(u32),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Recording not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

/// Result of a successful insert
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    /// The stored record, with its payload key filled in
    pub record: PersistedRecording,
    /// Records pushed out by the capacity limit, oldest last
    pub evicted: Vec<PersistedRecording>,
}

/// The persisted set of recordings, newest first
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store the payload and prepend the record, evicting past capacity.
    /// Either everything is committed or nothing is.
    async fn insert(
        &self,
        record: PersistedRecording,
        payload: &[u8],
    ) -> Result<InsertOutcome, PersistenceError>;

    /// All records, newest first
    async fn list(&self) -> Result<Vec<PersistedRecording>, PersistenceError>;

    async fn load_payload(&self, id: &str) -> Result<Vec<u8>, PersistenceError>;

    /// Delete a record and its payload
    async fn remove(&self, id: &str) -> Result<(), PersistenceError>;

    /// Sum of stored payload sizes
    async fn total_bytes(&self) -> Result<u64, PersistenceError> {
        Ok(self.list().await?.iter().map(|r| r.size).sum())
    }
}
