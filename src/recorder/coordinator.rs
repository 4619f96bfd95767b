//! Session controller
//!
//! Wires the permission gate, capture session, detection sampler and
//! recording state machine together and exposes one event stream for the UI.

use super::machine::{MachineEvent, MachineOptions, RecordingStateMachine};
use super::state::{PersistedRecording, QualityTier, RecordingState};
use super::telemetry::{format_elapsed, format_file_size, TelemetrySnapshot};
use crate::capture::permissions::{PermissionGate, PermissionOutcome, PermissionState};
use crate::capture::session::{CaptureEvent, CaptureHandle, CaptureSession};
use crate::capture::traits::{
    FacingMode, MediaCaptureProvider, PermissionProvider, StreamConstraints,
};
use crate::config::RecorderConfig;
use crate::detection::backend::DetectionBackend;
use crate::detection::sampler::{DetectionSampler, SamplerEvent};
use crate::store::RecordStore;
use crate::utils::error::{RecorderError, RecorderResult};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Events emitted by the controller
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Permission resolution finished
    Permission(PermissionOutcome),
    Capture(CaptureEvent),
    Detection(SamplerEvent),
    Recording(MachineEvent),
}

/// Owns one recording session end to end
pub struct SessionController {
    gate: PermissionGate,
    capture: CaptureSession,
    sampler: DetectionSampler,
    machine: RecordingStateMachine,
    store: Arc<dyn RecordStore>,
    event_tx: broadcast::Sender<ControllerEvent>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionController {
    /// Create a controller. Must be called inside a tokio runtime.
    pub fn new(
        config: &RecorderConfig,
        permissions: Arc<dyn PermissionProvider>,
        camera: Arc<dyn MediaCaptureProvider>,
        detector: Box<dyn DetectionBackend>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        let gate = PermissionGate::new(
            permissions,
            camera.clone(),
            config.permission_prompt_timeout(),
        );
        let constraints = StreamConstraints::new(FacingMode::User)
            .with_resolution(config.ideal_width, config.ideal_height)
            .with_audio(config.capture_audio);
        let capture = CaptureSession::new(camera, constraints);
        let sampler = DetectionSampler::new(detector, config.sample_interval());
        let machine = RecordingStateMachine::new(
            store.clone(),
            sampler.latest_frame_slot(),
            config.quality,
            MachineOptions::from(config),
        );

        let forwarders = vec![
            forward(capture.subscribe(), event_tx.clone(), ControllerEvent::Capture),
            forward(sampler.subscribe(), event_tx.clone(), ControllerEvent::Detection),
            forward(machine.subscribe(), event_tx.clone(), ControllerEvent::Recording),
        ];

        Self {
            gate,
            capture,
            sampler,
            machine,
            store,
            event_tx,
            forwarders: Mutex::new(forwarders),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_tx.subscribe()
    }

    pub fn permission(&self) -> PermissionState {
        self.gate.state()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.machine.state()
    }

    pub fn capture(&self) -> &CaptureSession {
        &self.capture
    }

    pub fn sampler(&self) -> &DetectionSampler {
        &self.sampler
    }

    pub fn machine(&self) -> &RecordingStateMachine {
        &self.machine
    }

    pub async fn resolve_permissions(&self) -> PermissionOutcome {
        let outcome = self.gate.resolve_permissions().await;
        let _ = self
            .event_tx
            .send(ControllerEvent::Permission(outcome.clone()));
        outcome
    }

    /// Open the camera and start face sampling on it
    pub async fn open_camera(&self, facing_mode: FacingMode) -> RecorderResult<CaptureHandle> {
        let permission = self.gate.state();
        if permission != PermissionState::Granted {
            return Err(RecorderError::precondition(format!(
                "resolve permissions first (currently {permission:?})"
            )));
        }
        self.ensure_not_recording("stop recording before reopening the camera")?;

        self.sampler.disarm().await;
        let handle = self.capture.open(facing_mode, permission).await?;
        self.arm_sampler(&handle).await;
        Ok(handle)
    }

    pub async fn close_camera(&self) {
        self.sampler.disarm().await;
        self.capture.close().await;
    }

    /// Switch between front and back cameras. Refused while recording.
    pub async fn flip_camera(&self) -> RecorderResult<CaptureHandle> {
        self.ensure_not_recording("stop recording before switching cameras")?;

        self.sampler.disarm().await;
        let handle = self.capture.flip(self.gate.state()).await?;
        self.arm_sampler(&handle).await;
        Ok(handle)
    }

    /// Checked before touching the sampler so a refused request leaves it running
    fn ensure_not_recording(&self, message: &'static str) -> RecorderResult<()> {
        if self.capture.is_recording() || self.machine.state() == RecordingState::Recording {
            return Err(RecorderError::precondition(message));
        }
        Ok(())
    }

    async fn arm_sampler(&self, handle: &CaptureHandle) {
        // Detection failures are reported as sampler events; the camera stays usable
        if let Err(e) = self.sampler.arm(handle).await {
            tracing::warn!("Face detection unavailable: {}", e);
        }
    }

    /// Start recording; a saved session is cleared first
    pub fn start_recording(&self) -> RecorderResult<()> {
        if self.machine.state() == RecordingState::Saved {
            self.machine.reset()?;
        }
        self.machine.start(&self.capture, self.gate.state())
    }

    pub fn stop_recording(&self) -> RecorderResult<()> {
        self.machine.stop()
    }

    pub async fn wait_for_save(&self) -> RecorderResult<PersistedRecording> {
        self.machine.wait_for_save().await
    }

    pub async fn retry_save(&self) -> RecorderResult<PersistedRecording> {
        self.machine.retry_persist().await
    }

    pub async fn export_pending(&self, path: &Path) -> RecorderResult<u64> {
        self.machine.export_pending(path).await
    }

    pub fn discard_recording(&self) -> RecorderResult<()> {
        self.machine.discard()
    }

    pub fn set_quality(&self, quality: QualityTier) -> RecorderResult<()> {
        self.machine.set_quality(quality)
    }

    pub async fn recordings(&self) -> RecorderResult<Vec<PersistedRecording>> {
        Ok(self.store.list().await?)
    }

    pub async fn delete_recording(&self, id: &str) -> RecorderResult<()> {
        self.store.remove(id).await?;
        tracing::info!("Deleted recording {}", id);
        Ok(())
    }

    /// Current status panel values
    pub async fn snapshot(&self) -> RecorderResult<TelemetrySnapshot> {
        let recordings = self.store.list().await?;
        let storage_used_bytes: u64 = recordings.iter().map(|r| r.size).sum();

        let machine = self.machine.snapshot();
        let faces_in_frame = self
            .sampler
            .latest_frame()
            .map(|frame| frame.face_count())
            .unwrap_or(0);

        Ok(TelemetrySnapshot {
            permission: self.gate.state(),
            camera_ready: self.capture.has_ready_handle(),
            facing_mode: self.capture.facing_mode(),
            state: machine.state,
            quality: machine.quality,
            elapsed_secs: machine.elapsed_secs,
            elapsed: format_elapsed(machine.elapsed_secs),
            estimated_bytes: machine.estimated_bytes,
            estimated_size: format_file_size(machine.estimated_bytes),
            faces_in_frame,
            tracking_status: TelemetrySnapshot::tracking(faces_in_frame),
            detection_stats: self.sampler.stats(),
            recordings_stored: recordings.len(),
            storage_used_bytes,
            storage_used: format_file_size(storage_used_bytes),
        })
    }

    /// Stop sampling and release the camera
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down session");
        self.close_camera().await;
        for task in self.forwarders.lock().drain(..) {
            task.abort();
        }
    }
}

fn forward<T: Clone + Send + 'static>(
    mut rx: broadcast::Receiver<T>,
    tx: broadcast::Sender<ControllerEvent>,
    wrap: fn(T) -> ControllerEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let _ = tx.send(wrap(event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event forwarder lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
