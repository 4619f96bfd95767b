//! Capture session
//!
//! Owns at most one live capture handle. Opening a new handle (including a
//! camera flip) always stops the previous one first, so two hardware claims
//! never overlap.

use super::permissions::PermissionState;
use super::traits::{FacingMode, MediaCaptureProvider, MediaStream, StreamConstraints, StreamMetadata};
use crate::utils::error::{RecorderError, RecorderResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// An open, ready camera+microphone stream
#[derive(Clone)]
pub struct CaptureHandle {
    stream: Arc<dyn MediaStream>,
    facing_mode: FacingMode,
    metadata: StreamMetadata,
    opened_at: DateTime<Utc>,
}

impl CaptureHandle {
    pub fn id(&self) -> &str {
        self.stream.id()
    }

    pub fn facing_mode(&self) -> FacingMode {
        self.facing_mode
    }

    pub fn metadata(&self) -> StreamMetadata {
        self.metadata
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Ready means metadata arrived and the tracks are still running
    pub fn is_ready(&self) -> bool {
        self.stream.is_live()
    }

    pub fn stream(&self) -> &Arc<dyn MediaStream> {
        &self.stream
    }
}

impl fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("id", &self.id())
            .field("facing_mode", &self.facing_mode)
            .field("metadata", &self.metadata)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Capture lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Stream metadata available; sampling may begin
    Ready {
        stream_id: String,
        facing_mode: FacingMode,
        metadata: StreamMetadata,
    },
    /// Closed on request
    Closed { stream_id: String },
    /// Lost without being asked to close
    Ended { stream_id: String },
    /// Acquisition failed; the session has no handle
    Failed { message: String },
}

/// Owns the single active capture handle
pub struct CaptureSession {
    provider: Arc<dyn MediaCaptureProvider>,
    template: StreamConstraints,
    current: Arc<RwLock<Option<CaptureHandle>>>,
    facing_mode: RwLock<FacingMode>,
    /// Serializes open/close/flip so callers never see two handles in flight
    op_lock: Mutex<()>,
    recording_guard: Arc<AtomicBool>,
    event_tx: broadcast::Sender<CaptureEvent>,
}

impl CaptureSession {
    /// `template` supplies resolution and audio settings; its facing mode is the initial one
    pub fn new(provider: Arc<dyn MediaCaptureProvider>, template: StreamConstraints) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            provider,
            facing_mode: RwLock::new(template.facing_mode),
            template,
            current: Arc::new(RwLock::new(None)),
            op_lock: Mutex::new(()),
            recording_guard: Arc::new(AtomicBool::new(false)),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.event_tx.subscribe()
    }

    /// The open handle, if any
    pub fn current(&self) -> Option<CaptureHandle> {
        self.current.read().clone()
    }

    pub fn has_ready_handle(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .map(CaptureHandle::is_ready)
            .unwrap_or(false)
    }

    /// Facing mode of the current (or last requested) handle
    pub fn facing_mode(&self) -> FacingMode {
        *self.facing_mode.read()
    }

    /// Flag set by the recording state machine while a recording is running
    pub(crate) fn recording_guard(&self) -> Arc<AtomicBool> {
        self.recording_guard.clone()
    }

    /// A recording is using the current handle
    pub fn is_recording(&self) -> bool {
        self.recording_guard.load(Ordering::SeqCst)
    }

    /// Open a stream for `facing_mode`, replacing any open handle
    pub async fn open(
        &self,
        facing_mode: FacingMode,
        permission: PermissionState,
    ) -> RecorderResult<CaptureHandle> {
        if permission != PermissionState::Granted {
            return Err(RecorderError::precondition(format!(
                "camera permission is {permission:?}, not granted"
            )));
        }
        if self.is_recording() {
            return Err(RecorderError::precondition(
                "cannot replace the camera while recording",
            ));
        }

        let _op = self.op_lock.lock().await;
        self.open_locked(facing_mode).await
    }

    /// Stop and release the current handle. No-op when nothing is open.
    pub async fn close(&self) {
        let _op = self.op_lock.lock().await;
        self.close_locked();
    }

    /// Reopen with the opposite camera. Rejected while recording.
    pub async fn flip(&self, permission: PermissionState) -> RecorderResult<CaptureHandle> {
        if self.is_recording() {
            return Err(RecorderError::precondition(
                "stop recording before switching cameras",
            ));
        }
        if permission != PermissionState::Granted {
            return Err(RecorderError::precondition(format!(
                "camera permission is {permission:?}, not granted"
            )));
        }

        let _op = self.op_lock.lock().await;
        let next = self.facing_mode().flipped();
        tracing::info!("Switching camera to {}", next);
        self.open_locked(next).await
    }

    async fn open_locked(&self, facing_mode: FacingMode) -> RecorderResult<CaptureHandle> {
        self.close_locked();
        *self.facing_mode.write() = facing_mode;

        let constraints = StreamConstraints {
            facing_mode,
            ..self.template.clone()
        };

        let stream = match self.provider.open_stream(&constraints).await {
            Ok(stream) => stream,
            Err(failure) => {
                tracing::error!("Camera initialization failed: {}", failure);
                let _ = self.event_tx.send(CaptureEvent::Failed {
                    message: failure.to_string(),
                });
                return Err(RecorderError::Capture(failure.to_string()));
            }
        };

        let metadata = match stream.ready().await {
            Ok(metadata) => metadata,
            Err(failure) => {
                stream.stop();
                tracing::error!("Camera stream never became ready: {}", failure);
                let _ = self.event_tx.send(CaptureEvent::Failed {
                    message: failure.to_string(),
                });
                return Err(RecorderError::Capture(failure.to_string()));
            }
        };

        let handle = CaptureHandle {
            stream,
            facing_mode,
            metadata,
            opened_at: Utc::now(),
        };
        *self.current.write() = Some(handle.clone());
        self.watch_for_end(&handle);

        tracing::info!(
            "Camera ready: {} {}x{} (audio: {})",
            facing_mode,
            metadata.width,
            metadata.height,
            metadata.has_audio
        );
        let _ = self.event_tx.send(CaptureEvent::Ready {
            stream_id: handle.id().to_string(),
            facing_mode,
            metadata,
        });

        Ok(handle)
    }

    fn close_locked(&self) {
        let previous = self.current.write().take();
        if let Some(handle) = previous {
            handle.stream.stop();
            tracing::info!("Camera stream {} closed", handle.id());
            let _ = self.event_tx.send(CaptureEvent::Closed {
                stream_id: handle.id().to_string(),
            });
        }
    }

    /// Drop the handle if its stream ends without `close()`
    fn watch_for_end(&self, handle: &CaptureHandle) {
        let stream = handle.stream.clone();
        let current = self.current.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            stream.ended().await;

            let lost = {
                let mut guard = current.write();
                let is_current = guard
                    .as_ref()
                    .map(|h| h.id() == stream.id())
                    .unwrap_or(false);
                if is_current {
                    *guard = None;
                }
                is_current
            };

            if lost {
                tracing::warn!("Camera stream {} ended unexpectedly", stream.id());
                let _ = event_tx.send(CaptureEvent::Ended {
                    stream_id: stream.id().to_string(),
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::SimulatedCamera;
    use crate::capture::traits::AccessFailure;
    use std::time::Duration;

    fn session(camera: Arc<SimulatedCamera>) -> CaptureSession {
        CaptureSession::new(camera, StreamConstraints::new(FacingMode::User))
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_requires_granted_permission() {
        let camera = Arc::new(SimulatedCamera::new());
        let session = session(camera.clone());

        for state in [
            PermissionState::Checking,
            PermissionState::Denied,
            PermissionState::Blocked,
        ] {
            let result = session.open(FacingMode::User, state).await;
            assert!(matches!(result, Err(RecorderError::Precondition(_))));
        }
        assert_eq!(camera.open_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_returns_ready_handle_at_ideal_resolution() {
        let camera = Arc::new(SimulatedCamera::new());
        let session = session(camera.clone());
        let mut events = session.subscribe();

        let handle = session
            .open(FacingMode::User, PermissionState::Granted)
            .await
            .unwrap();

        assert!(handle.is_ready());
        assert_eq!(handle.metadata().width, 1280);
        assert_eq!(handle.metadata().height, 720);
        assert!(handle.metadata().has_audio);
        assert!(matches!(events.recv().await.unwrap(), CaptureEvent::Ready { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_handle_across_open_close_flip() {
        let camera = Arc::new(SimulatedCamera::new());
        let session = session(camera.clone());
        let granted = PermissionState::Granted;

        session.open(FacingMode::User, granted).await.unwrap();
        session.open(FacingMode::User, granted).await.unwrap();
        session.flip(granted).await.unwrap();
        session.close().await;
        session.flip(granted).await.unwrap();
        session.open(FacingMode::Environment, granted).await.unwrap();
        session.close().await;
        session.close().await;

        assert_eq!(camera.open_calls(), 5);
        assert_eq!(camera.max_live_streams(), 1);
        assert_eq!(camera.live_streams(), 0);
        assert!(session.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flip_switches_facing_mode() {
        let camera = Arc::new(SimulatedCamera::new());
        let session = session(camera.clone());

        session
            .open(FacingMode::User, PermissionState::Granted)
            .await
            .unwrap();
        let flipped = session.flip(PermissionState::Granted).await.unwrap();

        assert_eq!(flipped.facing_mode(), FacingMode::Environment);
        assert_eq!(
            camera.last_stream().unwrap().facing_mode(),
            FacingMode::Environment
        );
        assert_eq!(camera.live_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flip_rejected_while_recording_leaves_handle() {
        let camera = Arc::new(SimulatedCamera::new());
        let session = session(camera.clone());
        let handle = session
            .open(FacingMode::User, PermissionState::Granted)
            .await
            .unwrap();

        session.recording_guard().store(true, Ordering::SeqCst);
        let result = session.flip(PermissionState::Granted).await;

        assert!(matches!(result, Err(RecorderError::Precondition(_))));
        assert_eq!(session.current().unwrap().id(), handle.id());
        assert!(handle.is_ready());
        assert_eq!(camera.open_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_leaves_session_without_handle() {
        let camera = Arc::new(SimulatedCamera::new());
        let session = session(camera.clone());
        session
            .open(FacingMode::User, PermissionState::Granted)
            .await
            .unwrap();

        camera.fail_next_open(AccessFailure::DeviceBusy);
        let result = session.open(FacingMode::User, PermissionState::Granted).await;

        assert!(matches!(result, Err(RecorderError::Capture(_))));
        assert!(session.current().is_none());
        assert_eq!(camera.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_end_clears_handle() {
        let camera = Arc::new(SimulatedCamera::new());
        let session = session(camera.clone());
        let mut events = session.subscribe();
        session
            .open(FacingMode::User, PermissionState::Granted)
            .await
            .unwrap();
        let _ready = events.recv().await.unwrap();

        camera.last_stream().unwrap().disconnect();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(event, CaptureEvent::Ended { .. }));
        assert!(session.current().is_none());
        assert!(!session.has_ready_handle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_does_not_report_unexpected_end() {
        let camera = Arc::new(SimulatedCamera::new());
        let session = session(camera.clone());
        let mut events = session.subscribe();
        session
            .open(FacingMode::User, PermissionState::Granted)
            .await
            .unwrap();

        session.close().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(events.recv().await.unwrap(), CaptureEvent::Ready { .. }));
        assert!(matches!(events.recv().await.unwrap(), CaptureEvent::Closed { .. }));
        assert!(events.try_recv().is_err());
    }
}
