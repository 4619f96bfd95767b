//! Capped recording library
//!
//! Keeps the newest recordings (50 by default) in a versioned JSON envelope,
//! evicting the oldest insertions first.

use super::backend::KeyValueBackend;
use super::{
    media_key, InsertOutcome, PersistenceError, RecordStore, RECORDINGS_KEY, SCHEMA_VERSION,
};
use crate::recorder::state::PersistedRecording;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default number of recordings kept
pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    recordings: &'a [PersistedRecording],
}

#[derive(Deserialize)]
struct Envelope {
    recordings: Vec<PersistedRecording>,
}

/// Recordings collection over a key-value backend. Backend calls run on
/// tokio's blocking pool.
pub struct RecordingLibrary<B: KeyValueBackend> {
    inner: Arc<LibraryInner<B>>,
}

struct LibraryInner<B> {
    backend: B,
    capacity: usize,
    /// Committed collection; `None` until first loaded. The lock also
    /// serializes writers so readers never see a half-applied insert.
    committed: Mutex<Option<Vec<PersistedRecording>>>,
}

impl<B: KeyValueBackend + 'static> RecordingLibrary<B> {
    pub fn new(backend: B) -> Self {
        Self::with_capacity(backend, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(backend: B, capacity: usize) -> Self {
        Self {
            inner: Arc::new(LibraryInner {
                backend,
                capacity: capacity.max(1),
                committed: Mutex::new(None),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&LibraryInner<B>) -> Result<T, PersistenceError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| PersistenceError::Backend(format!("storage task failed: {e}")))?
    }
}

impl<B: KeyValueBackend> LibraryInner<B> {
    fn load_collection(&self) -> Result<Vec<PersistedRecording>, PersistenceError> {
        let Some(bytes) = self.backend.get(RECORDINGS_KEY)? else {
            return Ok(Vec::new());
        };

        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        if value.is_array() {
            tracing::debug!("Loaded legacy unversioned recordings collection");
            return Ok(serde_json::from_value(value)?);
        }

        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| {
                PersistenceError::Serialization("recordings envelope has no version".into())
            })?;
        if version != SCHEMA_VERSION as u64 {
            return Err(PersistenceError::UnsupportedSchema(
                u32::try_from(version).unwrap_or(u32::MAX),
            ));
        }

        let envelope: Envelope = serde_json::from_value(value)?;
        Ok(envelope.recordings)
    }

    fn write_collection(&self, recordings: &[PersistedRecording]) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec(&EnvelopeRef {
            version: SCHEMA_VERSION,
            recordings,
        })?;
        self.backend.set(RECORDINGS_KEY, &bytes)
    }

    fn cached(
        &self,
        committed: &mut Option<Vec<PersistedRecording>>,
    ) -> Result<Vec<PersistedRecording>, PersistenceError> {
        if let Some(list) = committed.as_ref() {
            return Ok(list.clone());
        }
        let list = self.load_collection()?;
        *committed = Some(list.clone());
        Ok(list)
    }

    fn list(&self) -> Result<Vec<PersistedRecording>, PersistenceError> {
        let mut committed = self.committed.lock();
        self.cached(&mut committed)
    }

    fn insert(
        &self,
        mut record: PersistedRecording,
        payload: &[u8],
    ) -> Result<InsertOutcome, PersistenceError> {
        let mut committed = self.committed.lock();
        let mut list = self.cached(&mut committed)?;

        let key = media_key(&record.id);
        self.backend.set(&key, payload)?;
        record.payload_key = key.clone();

        list.insert(0, record.clone());
        let evicted = if list.len() > self.capacity {
            list.split_off(self.capacity)
        } else {
            Vec::new()
        };

        if let Err(e) = self.write_collection(&list) {
            if let Err(cleanup) = self.backend.remove(&key) {
                tracing::warn!("Failed to roll back payload {}: {}", key, cleanup);
            }
            return Err(e);
        }
        *committed = Some(list);

        for old in &evicted {
            tracing::debug!("Evicted recording {}", old.id);
            if let Err(e) = self.backend.remove(&old.payload_key) {
                tracing::warn!("Failed to delete evicted payload {}: {}", old.payload_key, e);
            }
        }

        Ok(InsertOutcome { record, evicted })
    }

    fn load_payload(&self, id: &str) -> Result<Vec<u8>, PersistenceError> {
        let key = self
            .list()?
            .into_iter()
            .find(|r| r.id == id)
            .map(|r| r.payload_key)
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
        self.backend
            .get(&key)?
            .ok_or(PersistenceError::NotFound(key))
    }

    fn remove(&self, id: &str) -> Result<(), PersistenceError> {
        let mut committed = self.committed.lock();
        let mut list = self.cached(&mut committed)?;

        let index = list
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
        let removed = list.remove(index);

        self.write_collection(&list)?;
        *committed = Some(list);

        if let Err(e) = self.backend.remove(&removed.payload_key) {
            tracing::warn!("Failed to delete payload {}: {}", removed.payload_key, e);
        }
        Ok(())
    }
}

#[async_trait]
impl<B: KeyValueBackend + 'static> RecordStore for RecordingLibrary<B> {
    async fn insert(
        &self,
        record: PersistedRecording,
        payload: &[u8],
    ) -> Result<InsertOutcome, PersistenceError> {
        let payload = payload.to_vec();
        let outcome = self
            .blocking(move |inner| inner.insert(record, &payload))
            .await?;
        tracing::info!(
            "Saved recording {} ({} bytes, {} evicted)",
            outcome.record.id,
            outcome.record.size,
            outcome.evicted.len()
        );
        Ok(outcome)
    }

    async fn list(&self) -> Result<Vec<PersistedRecording>, PersistenceError> {
        self.blocking(|inner| inner.list()).await
    }

    async fn load_payload(&self, id: &str) -> Result<Vec<u8>, PersistenceError> {
        let id = id.to_string();
        self.blocking(move |inner| inner.load_payload(&id)).await
    }

    async fn remove(&self, id: &str) -> Result<(), PersistenceError> {
        let id = id.to_string();
        self.blocking(move |inner| inner.remove(&id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::state::QualityTier;
    use crate::store::backend::{DirectoryBackend, MemoryBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    fn record(size: u64) -> PersistedRecording {
        PersistedRecording::new(size, 5, QualityTier::Hd, 1, None)
    }

    #[tokio::test]
    async fn test_insert_prepends_and_stores_payload() {
        let library = RecordingLibrary::new(MemoryBackend::new());

        let first = library.insert(record(3), b"abc").await.unwrap().record;
        let second = library.insert(record(2), b"de").await.unwrap().record;

        let list = library.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, second.id);
        assert_eq!(list[1].id, first.id);
        assert_eq!(first.payload_key, media_key(&first.id));
        assert_eq!(library.load_payload(&first.id).await.unwrap(), b"abc");
        assert_eq!(library.total_bytes().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_insertion() {
        let library = RecordingLibrary::new(MemoryBackend::new());
        let mut ids = Vec::new();
        for i in 0..51u8 {
            let outcome = library.insert(record(1), &[i]).await.unwrap();
            ids.push(outcome.record.id.clone());
            if i < 50 {
                assert!(outcome.evicted.is_empty());
            } else {
                assert_eq!(outcome.evicted.len(), 1);
                assert_eq!(outcome.evicted[0].id, ids[0]);
            }
        }

        let list = library.list().await.unwrap();
        assert_eq!(list.len(), 50);
        assert_eq!(list[0].id, ids[50]);
        assert!(list.iter().all(|r| r.id != ids[0]));
        assert!(!library.backend().contains(&media_key(&ids[0])));
        assert!(matches!(
            library.load_payload(&ids[0]).await,
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_quota_failure_leaves_collection_untouched() {
        let library = RecordingLibrary::new(MemoryBackend::new());
        library.insert(record(4), b"keep").await.unwrap();
        let before = library.backend().keys();

        library.backend().set_quota(Some(library.backend().used_bytes() + 10));
        let err = library.insert(record(100), &[0; 100]).await.unwrap_err();

        assert!(matches!(err, PersistenceError::QuotaExceeded { .. }));
        assert_eq!(library.list().await.unwrap().len(), 1);
        assert_eq!(library.backend().keys(), before);
    }

    #[tokio::test]
    async fn test_collection_write_failure_rolls_back_payload() {
        let library = RecordingLibrary::new(MemoryBackend::new());
        library.insert(record(1), b"a").await.unwrap();

        // Room for the payload but not for the grown collection
        let used = library.backend().used_bytes();
        library.backend().set_quota(Some(used + 8));
        let err = library.insert(record(8), &[1; 8]).await.unwrap_err();

        assert!(matches!(err, PersistenceError::QuotaExceeded { .. }));
        assert_eq!(library.list().await.unwrap().len(), 1);
        assert_eq!(library.backend().used_bytes(), used);
    }

    #[tokio::test]
    async fn test_reads_legacy_array_and_rewrites_envelope() {
        let backend = MemoryBackend::new();
        let legacy = vec![record(7)];
        backend
            .set(RECORDINGS_KEY, &serde_json::to_vec(&legacy).unwrap())
            .unwrap();
        let library = RecordingLibrary::new(backend);

        assert_eq!(library.list().await.unwrap(), legacy);

        library.insert(record(1), b"x").await.unwrap();
        let raw = library.backend().get(RECORDINGS_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["recordings"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_schema_version_is_an_error() {
        let backend = MemoryBackend::new();
        backend
            .set(RECORDINGS_KEY, br#"{"version":2,"recordings":[]}"#)
            .unwrap();
        let library = RecordingLibrary::new(backend);

        assert_eq!(
            library.list().await.unwrap_err(),
            PersistenceError::UnsupportedSchema(2)
        );
        assert!(library.insert(record(1), b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_deletes_record_and_payload() {
        let library = RecordingLibrary::new(MemoryBackend::new());
        let stored = library.insert(record(2), b"hi").await.unwrap().record;

        library.remove(&stored.id).await.unwrap();

        assert!(library.list().await.unwrap().is_empty());
        assert!(!library.backend().contains(&stored.payload_key));
        assert!(matches!(
            library.remove(&stored.id).await,
            Err(PersistenceError::NotFound(_))
        ));
    }

    /// Memory backend whose writes block the calling thread
    struct SlowBackend {
        inner: MemoryBackend,
        delay: Duration,
    }

    impl KeyValueBackend for SlowBackend {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
            std::thread::sleep(self.delay);
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), PersistenceError> {
            self.inner.remove(key)
        }
    }

    #[tokio::test]
    async fn test_slow_writes_do_not_stall_the_runtime() {
        let library = RecordingLibrary::new(SlowBackend {
            inner: MemoryBackend::new(),
            delay: Duration::from_millis(150),
        });
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        library.insert(record(3), b"abc").await.unwrap();
        ticker.abort();

        // Two 150ms writes ran while the single-threaded runtime kept ticking
        assert!(ticks.load(Ordering::SeqCst) >= 5);
        assert_eq!(library.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_directory_library_survives_reopen() {
        let dir = tempdir().unwrap();
        let stored = {
            let library = RecordingLibrary::new(DirectoryBackend::new(dir.path()).unwrap());
            library.insert(record(5), b"hello").await.unwrap().record
        };

        let reopened = RecordingLibrary::new(DirectoryBackend::new(dir.path()).unwrap());
        let list = reopened.list().await.unwrap();

        assert_eq!(list, vec![stored.clone()]);
        assert_eq!(reopened.load_payload(&stored.id).await.unwrap(), b"hello");
    }
}
