//! Camera and microphone permission resolution
//!
//! The gate must resolve `Granted` before any capture stream is opened.
//! Resolution never fails: every path ends in Granted, Denied or Blocked,
//! with a reason the UI can show.

use super::traits::{
    AccessFailure, DeviceKind, FacingMode, MediaCaptureProvider, PermissionProvider,
    PermissionStatus, StreamConstraints,
};
use crate::utils::error::{PermissionDenial, RecorderError, RecorderResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Permission state as seen by the rest of the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    /// Resolution in progress (or not started)
    #[default]
    Checking,
    Granted,
    /// Retryable by resolving again
    Denied,
    /// Needs out-of-band action; retrying in-process will not help
    Blocked,
}

/// Why the gate ended where it did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum PermissionReason {
    CapabilityUnsupported,
    BlockedByPlatform,
    UserRejected,
    NoCamera,
    CameraInUse,
    PromptTimedOut,
    QueryFailed(String),
    AccessFailed(String),
}

impl PermissionReason {
    /// Short reason for logs and error values
    pub fn summary(&self) -> String {
        match self {
            PermissionReason::CapabilityUnsupported => "capability unsupported".to_string(),
            PermissionReason::BlockedByPlatform => "blocked by platform".to_string(),
            PermissionReason::UserRejected => "access rejected by user".to_string(),
            PermissionReason::NoCamera => "no camera found".to_string(),
            PermissionReason::CameraInUse => "camera in use".to_string(),
            PermissionReason::PromptTimedOut => "permission prompt timed out".to_string(),
            PermissionReason::QueryFailed(e) => format!("permission query failed: {e}"),
            PermissionReason::AccessFailed(e) => format!("camera access failed: {e}"),
        }
    }

    /// What the user can do about it
    pub fn remedy(&self) -> &'static str {
        match self {
            PermissionReason::CapabilityUnsupported => {
                "Camera access is not supported on this platform. Please use a platform with camera support."
            }
            PermissionReason::BlockedByPlatform => {
                "Camera or microphone access has been blocked. Please enable permissions in your device settings."
            }
            PermissionReason::UserRejected => {
                "Camera access was denied. Please allow camera access and try again."
            }
            PermissionReason::NoCamera => "No camera found. Please connect a camera and try again.",
            PermissionReason::CameraInUse => {
                "Camera is already in use by another application. Please close other apps and try again."
            }
            PermissionReason::PromptTimedOut => {
                "The permission prompt was not answered. Please try again."
            }
            PermissionReason::QueryFailed(_) => {
                "Unable to check camera permissions. Please try again."
            }
            PermissionReason::AccessFailed(_) => {
                "Failed to access camera. Please check your camera settings and try again."
            }
        }
    }
}

/// Result of one permission resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOutcome {
    pub state: PermissionState,
    pub reason: Option<PermissionReason>,
}

impl PermissionOutcome {
    fn granted() -> Self {
        Self {
            state: PermissionState::Granted,
            reason: None,
        }
    }

    fn denied(reason: PermissionReason) -> Self {
        Self {
            state: PermissionState::Denied,
            reason: Some(reason),
        }
    }

    fn blocked(reason: PermissionReason) -> Self {
        Self {
            state: PermissionState::Blocked,
            reason: Some(reason),
        }
    }

    pub fn is_granted(&self) -> bool {
        self.state == PermissionState::Granted
    }

    /// Only `Denied` can be retried in-process
    pub fn is_retryable(&self) -> bool {
        self.state == PermissionState::Denied
    }

    /// Convert into the recorder error taxonomy
    pub fn into_result(self) -> RecorderResult<()> {
        let reason = self
            .reason
            .as_ref()
            .map(PermissionReason::summary)
            .unwrap_or_default();
        match (self.state, self.reason) {
            (PermissionState::Granted, _) => Ok(()),
            (PermissionState::Blocked, Some(PermissionReason::CapabilityUnsupported)) => {
                Err(RecorderError::Capability(reason))
            }
            (PermissionState::Blocked, _) => Err(RecorderError::Permission {
                kind: PermissionDenial::Blocked,
                reason,
            }),
            (PermissionState::Denied, _) | (PermissionState::Checking, _) => {
                Err(RecorderError::Permission {
                    kind: PermissionDenial::Denied,
                    reason,
                })
            }
        }
    }
}

/// Resolves camera/microphone authorization before capture
pub struct PermissionGate {
    permissions: Arc<dyn PermissionProvider>,
    capture: Arc<dyn MediaCaptureProvider>,
    prompt_timeout: Duration,
    state: RwLock<PermissionState>,
}

impl PermissionGate {
    pub fn new(
        permissions: Arc<dyn PermissionProvider>,
        capture: Arc<dyn MediaCaptureProvider>,
        prompt_timeout: Duration,
    ) -> Self {
        Self {
            permissions,
            capture,
            prompt_timeout,
            state: RwLock::new(PermissionState::Checking),
        }
    }

    /// Last resolved state
    pub fn state(&self) -> PermissionState {
        *self.state.read()
    }

    /// Resolve whether the camera and microphone may be used
    pub async fn resolve_permissions(&self) -> PermissionOutcome {
        *self.state.write() = PermissionState::Checking;

        let outcome = self.evaluate().await;

        *self.state.write() = outcome.state;
        match &outcome.reason {
            None => tracing::info!("Camera and microphone permissions granted"),
            Some(reason) => tracing::warn!(
                "Camera permission {:?}: {}",
                outcome.state,
                reason.summary()
            ),
        }
        outcome
    }

    async fn evaluate(&self) -> PermissionOutcome {
        if !self.permissions.supports_capture() {
            return PermissionOutcome::blocked(PermissionReason::CapabilityUnsupported);
        }

        let (camera, microphone) = tokio::join!(
            self.permissions.query(DeviceKind::Camera),
            self.permissions.query(DeviceKind::Microphone)
        );
        let (camera, microphone) = match (camera, microphone) {
            (Ok(camera), Ok(microphone)) => (camera, microphone),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Permission check failed: {:#}", e);
                return PermissionOutcome::denied(PermissionReason::QueryFailed(e.to_string()));
            }
        };

        if camera == PermissionStatus::Denied || microphone == PermissionStatus::Denied {
            return PermissionOutcome::blocked(PermissionReason::BlockedByPlatform);
        }

        if camera == PermissionStatus::Granted && microphone == PermissionStatus::Granted {
            return PermissionOutcome::granted();
        }

        self.request_access().await
    }

    /// Prompt by opening a trial stream, then release it straight away
    async fn request_access(&self) -> PermissionOutcome {
        tracing::debug!("Requesting camera access with a trial stream");
        let constraints = StreamConstraints::new(FacingMode::User);

        let opened =
            tokio::time::timeout(self.prompt_timeout, self.capture.open_stream(&constraints)).await;

        match opened {
            Ok(Ok(stream)) => {
                stream.stop();
                PermissionOutcome::granted()
            }
            Ok(Err(failure)) => classify_failure(failure),
            Err(_) => PermissionOutcome::denied(PermissionReason::PromptTimedOut),
        }
    }
}

fn classify_failure(failure: AccessFailure) -> PermissionOutcome {
    match failure {
        AccessFailure::UserRejected => PermissionOutcome::denied(PermissionReason::UserRejected),
        AccessFailure::NoDevice => PermissionOutcome::blocked(PermissionReason::NoCamera),
        AccessFailure::DeviceBusy => PermissionOutcome::blocked(PermissionReason::CameraInUse),
        AccessFailure::Other(e) => PermissionOutcome::denied(PermissionReason::AccessFailed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::{SimulatedCamera, SimulatedPermissions};

    fn gate(
        permissions: SimulatedPermissions,
        camera: Arc<SimulatedCamera>,
    ) -> PermissionGate {
        PermissionGate::new(Arc::new(permissions), camera, Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_platform_is_blocked_without_prompt() {
        let camera = Arc::new(SimulatedCamera::new());
        let gate = gate(SimulatedPermissions::unsupported(), camera.clone());

        let outcome = gate.resolve_permissions().await;

        assert_eq!(outcome.state, PermissionState::Blocked);
        assert_eq!(outcome.reason, Some(PermissionReason::CapabilityUnsupported));
        assert!(!outcome.is_retryable());
        assert_eq!(camera.open_calls(), 0);
        assert!(matches!(
            outcome.into_result(),
            Err(RecorderError::Capability(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_denial_of_either_device_blocks() {
        for device in [DeviceKind::Camera, DeviceKind::Microphone] {
            let permissions = SimulatedPermissions::granted();
            permissions.set(device, PermissionStatus::Denied);
            let camera = Arc::new(SimulatedCamera::new());
            let gate = gate(permissions, camera.clone());

            let outcome = gate.resolve_permissions().await;

            assert_eq!(outcome.state, PermissionState::Blocked);
            assert_eq!(outcome.reason, Some(PermissionReason::BlockedByPlatform));
            assert_eq!(camera.open_calls(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_granted_skips_prompt() {
        let camera = Arc::new(SimulatedCamera::new());
        let gate = gate(SimulatedPermissions::granted(), camera.clone());

        let outcome = gate.resolve_permissions().await;

        assert!(outcome.is_granted());
        assert_eq!(gate.state(), PermissionState::Granted);
        assert_eq!(camera.open_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_success_releases_trial_stream() {
        let camera = Arc::new(SimulatedCamera::new());
        let gate = gate(SimulatedPermissions::new(), camera.clone());

        let outcome = gate.resolve_permissions().await;

        assert!(outcome.is_granted());
        assert_eq!(camera.open_calls(), 1);
        assert_eq!(camera.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_failures_are_classified() {
        let cases = [
            (AccessFailure::UserRejected, PermissionState::Denied),
            (AccessFailure::NoDevice, PermissionState::Blocked),
            (AccessFailure::DeviceBusy, PermissionState::Blocked),
            (
                AccessFailure::Other("driver crashed".into()),
                PermissionState::Denied,
            ),
        ];

        for (failure, expected) in cases {
            let camera = Arc::new(SimulatedCamera::new());
            camera.fail_next_open(failure.clone());
            let gate = gate(SimulatedPermissions::new(), camera.clone());

            let outcome = gate.resolve_permissions().await;

            assert_eq!(outcome.state, expected, "failure {failure:?}");
            assert_eq!(camera.live_streams(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_can_be_retried() {
        let camera = Arc::new(SimulatedCamera::new());
        camera.fail_next_open(AccessFailure::UserRejected);
        let gate = gate(SimulatedPermissions::new(), camera.clone());

        let first = gate.resolve_permissions().await;
        assert!(first.is_retryable());

        let second = gate.resolve_permissions().await;
        assert!(second.is_granted());
        assert_eq!(camera.open_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_query_is_generic_denial() {
        let permissions = SimulatedPermissions::new();
        permissions.fail_queries("permissions API unavailable");
        let camera = Arc::new(SimulatedCamera::new());
        let gate = gate(permissions, camera.clone());

        let outcome = gate.resolve_permissions().await;

        assert_eq!(outcome.state, PermissionState::Denied);
        assert!(matches!(
            outcome.reason,
            Some(PermissionReason::QueryFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_prompt_times_out_as_denied() {
        let camera = Arc::new(SimulatedCamera::new().with_open_delay(Duration::from_secs(300)));
        let gate = gate(SimulatedPermissions::new(), camera.clone());

        let outcome = gate.resolve_permissions().await;

        assert_eq!(outcome.state, PermissionState::Denied);
        assert_eq!(outcome.reason, Some(PermissionReason::PromptTimedOut));
        assert!(matches!(
            outcome.into_result(),
            Err(RecorderError::Permission {
                kind: PermissionDenial::Denied,
                ..
            })
        ));
    }
}
