//! Key-value storage backends

use super::PersistenceError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

/// Synchronous byte-oriented key-value storage
pub trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError>;

    /// Removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

/// In-memory storage with an optional byte quota
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    quota: Mutex<Option<u64>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: u64) -> Self {
        let backend = Self::new();
        backend.set_quota(Some(quota));
        backend
    }

    /// Change the quota; existing entries are kept even when over it
    pub fn set_quota(&self, quota: Option<u64>) {
        *self.quota.lock() = quota;
    }

    /// Total bytes stored across all keys
    pub fn used_bytes(&self) -> u64 {
        self.entries.lock().values().map(|v| v.len() as u64).sum()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock();

        if let Some(quota) = *self.quota.lock() {
            let others: u64 = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len() as u64)
                .sum();
            let needed = value.len() as u64;
            let available = quota.saturating_sub(others);
            if needed > available {
                return Err(PersistenceError::QuotaExceeded { needed, available });
            }
        }

        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One file per key under a root directory. Writes go to a temp file in the
/// same directory and are renamed into place.
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(PersistenceError::Backend(format!("invalid storage key: {key}")));
        }
        Ok(self.root.join(relative))
    }
}

impl KeyValueBackend for DirectoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(value)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| PersistenceError::from(e.error))?;

        tracing::debug!("Wrote {} bytes to {:?}", value.len(), path);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
