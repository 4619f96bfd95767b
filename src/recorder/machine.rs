//! Recording state machine
//!
//! Idle -> Recording -> Processing -> Saved. A driver task owns the chunk
//! receiver and the elapsed ticker while a recording runs; it finalizes the
//! payload once the platform recorder has flushed and hands it to the store.
//! A failed save keeps the payload in Processing until it is retried,
//! exported or discarded.

use super::state::{PersistedRecording, QualityTier, RecordingSession, RecordingState};
use crate::capture::permissions::PermissionState;
use crate::capture::session::CaptureSession;
use crate::capture::traits::{MediaStream, PlatformRecorder, RecorderEvent, RecorderOptions};
use crate::config::RecorderConfig;
use crate::detection::types::DetectionFrame;
use crate::store::{PersistenceError, RecordStore};
use crate::utils::error::{RecorderError, RecorderResult};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Tunables for the state machine
#[derive(Debug, Clone)]
pub struct MachineOptions {
    pub mime_type: String,
    pub timeslice: Duration,
    pub elapsed_tick: Duration,
    pub chunk_channel_capacity: usize,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self::from(&RecorderConfig::default())
    }
}

impl From<&RecorderConfig> for MachineOptions {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            mime_type: config.mime_type.clone(),
            timeslice: config.recorder_timeslice(),
            elapsed_tick: config.elapsed_tick(),
            chunk_channel_capacity: config.chunk_channel_capacity.max(1),
        }
    }
}

/// Result of the most recent save attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(PersistedRecording),
    Failed(PersistenceError),
}

/// State machine notifications
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    StateChanged(RecordingState),
    Tick { elapsed_secs: u64, estimated_bytes: u64 },
    ChunkReceived { bytes: usize, buffered_bytes: u64 },
    /// Non-fatal recorder problem; recording continues
    RecorderWarning(String),
    /// The capture stream ended while recording
    CaptureLost,
    Saved(PersistedRecording),
    SaveFailed(PersistenceError),
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSnapshot {
    pub state: RecordingState,
    pub elapsed_secs: u64,
    pub quality: QualityTier,
    pub estimated_bytes: u64,
    pub buffered_bytes: u64,
    pub chunk_count: usize,
    /// A finalized payload is waiting to be persisted
    pub has_pending_save: bool,
}

struct FinalizedRecording {
    record: PersistedRecording,
    payload: Arc<Vec<u8>>,
}

struct MachineShared {
    session: Mutex<RecordingSession>,
    recorder: Mutex<Option<Box<dyn PlatformRecorder>>>,
    pending: Mutex<Option<FinalizedRecording>>,
    persisting: AtomicBool,
    store: Arc<dyn RecordStore>,
    latest_frame: Arc<RwLock<Option<DetectionFrame>>>,
    options: MachineOptions,
    outcome_tx: watch::Sender<Option<SaveOutcome>>,
    event_tx: broadcast::Sender<MachineEvent>,
}

impl MachineShared {
    fn emit(&self, event: MachineEvent) {
        let _ = self.event_tx.send(event);
    }

    fn transition(&self, session: &mut RecordingSession, state: RecordingState) {
        if session.state != state {
            tracing::info!("Recording state: {:?} -> {:?}", session.state, state);
            session.state = state;
            self.emit(MachineEvent::StateChanged(state));
        }
    }

    fn request_flush(&self) {
        if let Some(recorder) = self.recorder.lock().as_mut() {
            recorder.request_stop();
        }
    }

    /// Recording -> Processing. Returns false if not recording.
    fn enter_processing(&self) -> bool {
        let moved = {
            let mut session = self.session.lock();
            if session.state == RecordingState::Recording {
                session.last_frame = self.latest_frame.read().clone();
                self.transition(&mut session, RecordingState::Processing);
                true
            } else {
                false
            }
        };
        if moved {
            self.request_flush();
        }
        moved
    }

    /// Face count comes from the frame captured when recording stopped
    fn finalize(&self) {
        let finalized = {
            let mut session = self.session.lock();
            if session.state == RecordingState::Recording {
                session.last_frame = self.latest_frame.read().clone();
            }
            self.transition(&mut session, RecordingState::Processing);
            let face_count = session
                .last_frame
                .as_ref()
                .map(DetectionFrame::face_count)
                .unwrap_or(0);

            let payload = session.take_payload();
            let record = PersistedRecording::new(
                payload.len() as u64,
                session.elapsed_secs,
                session.quality,
                face_count,
                Some(self.options.mime_type.clone()),
            );
            FinalizedRecording {
                record,
                payload: Arc::new(payload),
            }
        };

        tracing::info!(
            "Finalized recording {}: {} bytes over {}s",
            finalized.record.id,
            finalized.record.size,
            finalized.record.duration
        );
        *self.recorder.lock() = None;
        *self.pending.lock() = Some(finalized);
    }

    async fn persist(&self) -> RecorderResult<PersistedRecording> {
        let (record, payload) = match self.pending.lock().as_ref() {
            Some(pending) => (pending.record.clone(), pending.payload.clone()),
            None => return Err(RecorderError::precondition("no recording awaiting save")),
        };
        if self.persisting.swap(true, Ordering::SeqCst) {
            return Err(RecorderError::precondition("a save is already in progress"));
        }

        let result = self.store.insert(record, &payload).await;
        self.persisting.store(false, Ordering::SeqCst);

        match result {
            Ok(outcome) => {
                *self.pending.lock() = None;
                {
                    let mut session = self.session.lock();
                    session.chunks.clear();
                    self.transition(&mut session, RecordingState::Saved);
                }
                self.emit(MachineEvent::Saved(outcome.record.clone()));
                self.outcome_tx
                    .send_replace(Some(SaveOutcome::Saved(outcome.record.clone())));
                Ok(outcome.record)
            }
            Err(e) => {
                tracing::error!("Failed to save recording: {}", e);
                self.emit(MachineEvent::SaveFailed(e.clone()));
                self.outcome_tx.send_replace(Some(SaveOutcome::Failed(e.clone())));
                Err(e.into())
            }
        }
    }
}

/// Drives one recording session at a time
pub struct RecordingStateMachine {
    shared: Arc<MachineShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RecordingStateMachine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        latest_frame: Arc<RwLock<Option<DetectionFrame>>>,
        quality: QualityTier,
        options: MachineOptions,
    ) -> Self {
        let (outcome_tx, _) = watch::channel(None);
        let (event_tx, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(MachineShared {
                session: Mutex::new(RecordingSession::new(quality)),
                recorder: Mutex::new(None),
                pending: Mutex::new(None),
                persisting: AtomicBool::new(false),
                store,
                latest_frame,
                options,
                outcome_tx,
                event_tx,
            }),
            driver: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn state(&self) -> RecordingState {
        self.shared.session.lock().state
    }

    pub fn quality(&self) -> QualityTier {
        self.shared.session.lock().quality
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        let has_pending_save = self.shared.pending.lock().is_some();
        let session = self.shared.session.lock();
        MachineSnapshot {
            state: session.state,
            elapsed_secs: session.elapsed_secs,
            quality: session.quality,
            estimated_bytes: session.estimated_bytes(),
            buffered_bytes: session.buffered_bytes(),
            chunk_count: session.chunks.len(),
            has_pending_save,
        }
    }

    /// Detection frame captured when the last recording stopped
    pub fn last_frame(&self) -> Option<DetectionFrame> {
        self.shared.session.lock().last_frame.clone()
    }

    /// Change the tier for the next recording
    pub fn set_quality(&self, quality: QualityTier) -> RecorderResult<()> {
        let mut session = self.shared.session.lock();
        match session.state {
            RecordingState::Idle | RecordingState::Saved => {
                session.quality = quality;
                tracing::debug!("Quality set to {}", quality.label());
                Ok(())
            }
            state => Err(RecorderError::precondition(format!(
                "cannot change quality while {state:?}"
            ))),
        }
    }

    /// Idle -> Recording on the capture session's ready handle
    pub fn start(&self, capture: &CaptureSession, permission: PermissionState) -> RecorderResult<()> {
        if permission != PermissionState::Granted {
            return Err(RecorderError::precondition(format!(
                "camera permission is {permission:?}, not granted"
            )));
        }
        let handle = capture
            .current()
            .filter(|h| h.is_ready())
            .ok_or_else(|| RecorderError::precondition("no ready camera stream"))?;

        let shared = &self.shared;
        let (tx, rx) = mpsc::channel(shared.options.chunk_channel_capacity);

        {
            let mut session = shared.session.lock();
            if session.state != RecordingState::Idle {
                return Err(RecorderError::precondition(format!(
                    "cannot start recording while {:?}",
                    session.state
                )));
            }

            let options = RecorderOptions {
                mime_type: shared.options.mime_type.clone(),
                bits_per_second: session.quality.bitrate(),
                timeslice: shared.options.timeslice,
            };
            let recorder = handle
                .stream()
                .start_recorder(&options, tx)
                .map_err(|e| RecorderError::Capture(e.to_string()))?;
            *shared.recorder.lock() = Some(recorder);

            let quality = session.quality;
            *session = RecordingSession {
                started_at: Some(Utc::now()),
                ..RecordingSession::new(quality)
            };
            shared.outcome_tx.send_replace(None);
            shared.transition(&mut session, RecordingState::Recording);
        }

        let guard = capture.recording_guard();
        guard.store(true, Ordering::SeqCst);

        let task = tokio::spawn(drive(
            shared.clone(),
            rx,
            handle.stream().clone(),
            guard,
        ));
        *self.driver.lock() = Some(task);

        tracing::info!(
            "Recording started on stream {} at {}",
            handle.id(),
            self.quality().label()
        );
        Ok(())
    }

    /// Recording -> Processing; the recorder is asked to flush
    pub fn stop(&self) -> RecorderResult<()> {
        if self.shared.enter_processing() {
            tracing::info!("Stopping recording");
            Ok(())
        } else {
            Err(RecorderError::precondition(format!(
                "cannot stop while {:?}",
                self.state()
            )))
        }
    }

    /// Wait until the current recording is saved or its save fails
    pub async fn wait_for_save(&self) -> RecorderResult<PersistedRecording> {
        if self.state() == RecordingState::Idle {
            return Err(RecorderError::precondition("no recording to wait for"));
        }

        let mut rx = self.shared.outcome_tx.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RecorderError::precondition("state machine dropped"))?
            .clone();

        match outcome {
            Some(SaveOutcome::Saved(record)) => Ok(record),
            Some(SaveOutcome::Failed(e)) => Err(e.into()),
            None => Err(RecorderError::precondition("no save outcome")),
        }
    }

    /// Try saving a payload whose previous save failed
    pub async fn retry_persist(&self) -> RecorderResult<PersistedRecording> {
        tracing::info!("Retrying recording save");
        self.shared.persist().await
    }

    /// Write the unsaved payload to a local file. The payload stays pending.
    pub async fn export_pending(&self, path: &Path) -> RecorderResult<u64> {
        let payload = self
            .shared
            .pending
            .lock()
            .as_ref()
            .map(|p| p.payload.clone())
            .ok_or_else(|| RecorderError::precondition("no recording awaiting save"))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, payload.as_slice()).await?;

        tracing::info!("Exported {} bytes to {:?}", payload.len(), path);
        Ok(payload.len() as u64)
    }

    /// Drop an unsaved payload or clear a saved session, returning to Idle
    pub fn discard(&self) -> RecorderResult<()> {
        let shared = &self.shared;
        if shared.persisting.load(Ordering::SeqCst) {
            return Err(RecorderError::precondition("a save is in progress"));
        }

        let mut session = shared.session.lock();
        match session.state {
            RecordingState::Idle => return Ok(()),
            RecordingState::Saved => {}
            RecordingState::Processing => {
                if shared.pending.lock().take().is_none() {
                    return Err(RecorderError::precondition(
                        "recording is still being processed",
                    ));
                }
                tracing::warn!("Discarding unsaved recording");
            }
            RecordingState::Recording => {
                return Err(RecorderError::precondition("stop the recording first"));
            }
        }

        let quality = session.quality;
        *session = RecordingSession::new(quality);
        shared.outcome_tx.send_replace(None);
        shared.emit(MachineEvent::StateChanged(RecordingState::Idle));
        tracing::info!("Recording session reset");
        Ok(())
    }

    /// Saved -> Idle
    pub fn reset(&self) -> RecorderResult<()> {
        if self.state() != RecordingState::Saved {
            return Err(RecorderError::precondition(format!(
                "cannot reset while {:?}",
                self.state()
            )));
        }
        self.discard()
    }
}

impl Drop for RecordingStateMachine {
    fn drop(&mut self) {
        if let Some(task) = self.driver.lock().take() {
            task.abort();
        }
    }
}

async fn drive(
    shared: Arc<MachineShared>,
    mut rx: mpsc::Receiver<RecorderEvent>,
    stream: Arc<dyn MediaStream>,
    guard: Arc<AtomicBool>,
) {
    let tick = shared.options.elapsed_tick;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
    let mut ticking = true;
    let mut watching_stream = true;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(RecorderEvent::Chunk(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    let bytes = data.len();
                    let buffered_bytes = {
                        let mut session = shared.session.lock();
                        session.chunks.push(data);
                        session.buffered_bytes()
                    };
                    tracing::debug!("Chunk received: {} bytes ({} buffered)", bytes, buffered_bytes);
                    shared.emit(MachineEvent::ChunkReceived { bytes, buffered_bytes });
                }
                Some(RecorderEvent::Error(message)) => {
                    tracing::warn!("Recorder error: {}", message);
                    shared.emit(MachineEvent::RecorderWarning(message));
                }
                Some(RecorderEvent::Stopped) | None => break,
            },
            _ = ticker.tick(), if ticking => {
                let update = {
                    let mut session = shared.session.lock();
                    if session.state == RecordingState::Recording {
                        session.elapsed_secs += 1;
                        Some((session.elapsed_secs, session.estimated_bytes()))
                    } else {
                        None
                    }
                };
                match update {
                    Some((elapsed_secs, estimated_bytes)) => {
                        shared.emit(MachineEvent::Tick { elapsed_secs, estimated_bytes });
                    }
                    None => ticking = false,
                }
            }
            _ = stream.ended(), if watching_stream => {
                watching_stream = false;
                if shared.enter_processing() {
                    tracing::warn!("Camera stream ended during recording; finalizing");
                    shared.emit(MachineEvent::CaptureLost);
                }
            }
        }
    }

    if shared.session.lock().state == RecordingState::Recording {
        tracing::warn!("Recorder stopped on its own; finalizing");
        if !stream.is_live() {
            shared.emit(MachineEvent::CaptureLost);
        }
    }

    guard.store(false, Ordering::SeqCst);
    shared.finalize();
    // Failures are reported through the outcome channel
    let _ = shared.persist().await;
}
