//! Headless demo: resolves permissions, opens the camera, records for a few
//! seconds and prints the status panel.
//!
//! Environment:
//! - `FACETRACK_CONFIG`: path to a JSON config file
//! - `FACETRACK_DEMO_SECS`: recording length in seconds (default 5)
//! - `FACETRACK_NATIVE=1`: use the local webcam (needs the `native-camera` feature)

use anyhow::Context;
use facetrack_recorder::capture::simulated::{SimulatedCamera, SimulatedPermissions};
use facetrack_recorder::capture::{FacingMode, MediaCaptureProvider, PermissionProvider};
use facetrack_recorder::detection::MockDetectionBackend;
use facetrack_recorder::store::{DirectoryBackend, MemoryBackend, RecordStore, RecordingLibrary};
use facetrack_recorder::{init_logging, RecorderConfig, SessionController};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = match std::env::var_os("FACETRACK_CONFIG") {
        Some(path) => RecorderConfig::load(&PathBuf::from(path)).context("loading config")?,
        None => RecorderConfig::default(),
    };
    let demo_secs: u64 = std::env::var("FACETRACK_DEMO_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);

    let store: Arc<dyn RecordStore> = match &config.storage_dir {
        Some(dir) => Arc::new(RecordingLibrary::with_capacity(
            DirectoryBackend::new(dir).context("opening storage directory")?,
            config.max_recordings,
        )),
        None => Arc::new(RecordingLibrary::with_capacity(
            MemoryBackend::new(),
            config.max_recordings,
        )),
    };

    let (permissions, camera) = providers(&config);
    let controller = SessionController::new(
        &config,
        permissions,
        camera,
        Box::new(MockDetectionBackend::new()),
        store,
    );

    let outcome = controller.resolve_permissions().await;
    if !outcome.is_granted() {
        if let Some(reason) = &outcome.reason {
            eprintln!("Camera unavailable: {}", reason.summary());
            eprintln!("{}", reason.remedy());
        }
        return Ok(());
    }

    controller.open_camera(FacingMode::User).await?;
    controller.start_recording()?;
    tracing::info!("Recording for {}s", demo_secs);
    tokio::time::sleep(Duration::from_secs(demo_secs)).await;
    controller.stop_recording()?;

    match controller.wait_for_save().await {
        Ok(record) => tracing::info!("Saved \"{}\" ({} bytes)", record.title, record.size),
        Err(e) => {
            tracing::error!("Save failed: {}", e);
            let rescue = std::env::temp_dir().join("facetrack-unsaved.webm");
            let bytes = controller.export_pending(&rescue).await?;
            tracing::info!("Wrote {} unsaved bytes to {:?}", bytes, rescue);
        }
    }

    let snapshot = controller.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    controller.shutdown().await;
    Ok(())
}

type Providers = (Arc<dyn PermissionProvider>, Arc<dyn MediaCaptureProvider>);

#[cfg(feature = "native-camera")]
fn providers(config: &RecorderConfig) -> Providers {
    use facetrack_recorder::capture::native::{NativeCamera, NativePermissions};

    if std::env::var("FACETRACK_NATIVE").as_deref() == Ok("1") {
        return (
            Arc::new(NativePermissions),
            Arc::new(NativeCamera::new(config.capture_audio)),
        );
    }
    simulated()
}

#[cfg(not(feature = "native-camera"))]
fn providers(_config: &RecorderConfig) -> Providers {
    simulated()
}

fn simulated() -> Providers {
    (
        Arc::new(SimulatedPermissions::new()),
        Arc::new(SimulatedCamera::new()),
    )
}
