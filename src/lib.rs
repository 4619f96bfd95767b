//! FaceTrack Recorder - camera recording with live face tracking.
//!
//! This is the core library of the recorder. It resolves camera/microphone
//! permissions, owns the capture stream, samples it for faces and records it
//! into a capped local library.

pub mod capture;
pub mod config;
pub mod detection;
pub mod recorder;
pub mod store;
pub mod utils;

pub use config::RecorderConfig;
pub use recorder::SessionController;
pub use utils::error::{ErrorResponse, RecorderError, RecorderResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facetrack_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_ok() {
        tracing::info!("Starting FaceTrack Recorder v{}", env!("CARGO_PKG_VERSION"));
    }
}
