//! Detection sampler
//!
//! Samples the live capture handle at a fixed cadence (10 Hz by default),
//! runs the detection backend on each frame and publishes the result. The
//! loop runs as a tokio task and stops when disarmed, when the stream ends,
//! or when the backend reports a fatal error.

use super::backend::{DetectionBackend, DetectionError};
use super::types::{DetectionFrame, DetectionStats};
use crate::capture::session::CaptureHandle;
use crate::utils::error::{RecorderError, RecorderResult};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Why sampling stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    Disarmed,
    StreamClosed,
    Fatal(String),
}

/// Sampler notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerEvent {
    Frame(DetectionFrame),
    /// The frame was published empty
    TransientError { sequence: u64, message: String },
    Halted(HaltReason),
}

struct ActiveRun {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Fixed-cadence detection loop over one capture handle
pub struct DetectionSampler {
    backend: Arc<Mutex<Box<dyn DetectionBackend>>>,
    interval: Duration,
    latest: Arc<RwLock<Option<DetectionFrame>>>,
    stats: Arc<RwLock<DetectionStats>>,
    ticks: Arc<AtomicU64>,
    event_tx: broadcast::Sender<SamplerEvent>,
    run: tokio::sync::Mutex<Option<ActiveRun>>,
}

impl DetectionSampler {
    pub fn new(backend: Box<dyn DetectionBackend>, interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            backend: Arc::new(Mutex::new(backend)),
            interval,
            latest: Arc::new(RwLock::new(None)),
            stats: Arc::new(RwLock::new(DetectionStats::default())),
            ticks: Arc::new(AtomicU64::new(0)),
            event_tx,
            run: tokio::sync::Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SamplerEvent> {
        self.event_tx.subscribe()
    }

    /// Most recently published frame
    pub fn latest_frame(&self) -> Option<DetectionFrame> {
        self.latest.read().clone()
    }

    /// Shared slot the recording state machine reads at stop time
    pub(crate) fn latest_frame_slot(&self) -> Arc<RwLock<Option<DetectionFrame>>> {
        self.latest.clone()
    }

    pub fn stats(&self) -> DetectionStats {
        self.stats.read().clone()
    }

    /// Sampling ticks completed since the last `arm`
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        self.run
            .lock()
            .await
            .as_ref()
            .map(|run| !run.task.is_finished())
            .unwrap_or(false)
    }

    /// Start sampling `handle`. Any previous run is stopped first.
    pub async fn arm(&self, handle: &CaptureHandle) -> RecorderResult<()> {
        let mut run = self.run.lock().await;
        if let Some(previous) = run.take() {
            stop_run(previous).await;
        }

        if !handle.is_ready() {
            return Err(RecorderError::precondition(
                "detection needs a ready capture handle",
            ));
        }

        let attached = self.backend.lock().attach(&handle.metadata());
        if let Err(err) = attached {
            let fatal = DetectionError::Fatal(err.to_string());
            tracing::error!("Detector failed to attach: {}", fatal);
            let _ = self
                .event_tx
                .send(SamplerEvent::Halted(HaltReason::Fatal(fatal.to_string())));
            return Err(fatal.into());
        }

        *self.latest.write() = None;
        *self.stats.write() = DetectionStats::default();
        self.ticks.store(0, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(sample_loop(
            handle.clone(),
            self.backend.clone(),
            self.interval,
            SamplerShared {
                latest: self.latest.clone(),
                stats: self.stats.clone(),
                ticks: self.ticks.clone(),
                event_tx: self.event_tx.clone(),
            },
            shutdown_rx,
        ));

        tracing::info!(
            "Detection sampler armed on stream {} every {:?}",
            handle.id(),
            self.interval
        );
        *run = Some(ActiveRun {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Stop sampling and wait for the backend to be released
    pub async fn disarm(&self) {
        let previous = self.run.lock().await.take();
        if let Some(previous) = previous {
            stop_run(previous).await;
        }
    }
}

async fn stop_run(run: ActiveRun) {
    let _ = run.shutdown.send(());
    if let Err(e) = run.task.await {
        tracing::warn!("Detection task ended abnormally: {}", e);
    }
}

struct SamplerShared {
    latest: Arc<RwLock<Option<DetectionFrame>>>,
    stats: Arc<RwLock<DetectionStats>>,
    ticks: Arc<AtomicU64>,
    event_tx: broadcast::Sender<SamplerEvent>,
}

impl SamplerShared {
    fn publish(&self, frame: DetectionFrame) {
        self.stats.write().record(&frame);
        *self.latest.write() = Some(frame.clone());
        let _ = self.event_tx.send(SamplerEvent::Frame(frame));
    }
}

async fn sample_loop(
    handle: CaptureHandle,
    backend: Arc<Mutex<Box<dyn DetectionBackend>>>,
    interval: Duration,
    shared: SamplerShared,
    mut shutdown: oneshot::Receiver<()>,
) {
    let stream = handle.stream().clone();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sequence = 0u64;

    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => break HaltReason::Disarmed,
            _ = stream.ended() => break HaltReason::StreamClosed,
            _ = ticker.tick() => {
                sequence += 1;
                shared.ticks.fetch_add(1, Ordering::SeqCst);

                let Some(frame) = stream.grab_frame() else {
                    // Not decodable right now; skip without publishing
                    continue;
                };

                let result = backend.lock().detect(&frame);
                match result {
                    Ok(mut detections) => {
                        dedupe_ids(&mut detections);
                        tracing::trace!("Frame {}: {} face(s)", sequence, detections.len());
                        shared.publish(DetectionFrame {
                            sequence,
                            captured_at: frame.timestamp_ms,
                            detections,
                        });
                    }
                    Err(err) if err.is_fatal() => {
                        tracing::error!("{}", err);
                        break HaltReason::Fatal(err.to_string());
                    }
                    Err(err) => {
                        tracing::warn!("{}", err);
                        shared.publish(DetectionFrame {
                            sequence,
                            captured_at: Utc::now().timestamp_millis(),
                            detections: Vec::new(),
                        });
                        let _ = shared.event_tx.send(SamplerEvent::TransientError {
                            sequence,
                            message: err.to_string(),
                        });
                    }
                }
            }
        }
    };

    backend.lock().detach();
    tracing::info!("Detection sampler halted: {:?}", reason);
    let _ = shared.event_tx.send(SamplerEvent::Halted(reason));
}

/// Re-key duplicate ids so ids are unique within a frame
fn dedupe_ids(detections: &mut [super::types::Detection]) {
    let originals: HashSet<String> = detections.iter().map(|d| d.id.clone()).collect();
    let mut seen = HashSet::new();
    for (index, detection) in detections.iter_mut().enumerate() {
        if seen.insert(detection.id.clone()) {
            continue;
        }
        // Rewritten ids must not clash with any id already in the frame
        let mut suffix = index;
        let id = loop {
            let candidate = format!("{}#{}", detection.id, suffix);
            if !seen.contains(&candidate) && !originals.contains(&candidate) {
                break candidate;
            }
            suffix += 1;
        };
        seen.insert(id.clone());
        detection.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::permissions::PermissionState;
    use crate::capture::session::CaptureSession;
    use crate::capture::simulated::SimulatedCamera;
    use crate::capture::traits::{FacingMode, StreamConstraints, StreamMetadata, VideoFrame};
    use crate::detection::backend::MockDetectionBackend;
    use crate::detection::types::{BoundingBox, Detection};
    use std::collections::VecDeque;

    /// Backend replaying scripted results, then empty frames
    struct ScriptedBackend {
        attach_error: Option<DetectionError>,
        script: VecDeque<Result<Vec<Detection>, DetectionError>>,
        detached: Arc<std::sync::atomic::AtomicBool>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<Vec<Detection>, DetectionError>>) -> Self {
            Self {
                attach_error: None,
                script: script.into(),
                detached: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            }
        }
    }

    impl DetectionBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn attach(&mut self, _metadata: &StreamMetadata) -> Result<(), DetectionError> {
            match self.attach_error.clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn detect(&mut self, _frame: &VideoFrame) -> Result<Vec<Detection>, DetectionError> {
            self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        fn detach(&mut self) {
            self.detached.store(true, Ordering::SeqCst);
        }
    }

    fn face(id: &str) -> Detection {
        Detection {
            id: id.to_string(),
            bbox: BoundingBox {
                x: 0,
                y: 0,
                width: 120,
                height: 144,
            },
            confidence: 0.9,
            landmarks: vec![],
            timestamp: 0,
        }
    }

    async fn open_handle(camera: Arc<SimulatedCamera>) -> (CaptureSession, CaptureHandle) {
        let session = CaptureSession::new(camera, StreamConstraints::new(FacingMode::User));
        let handle = session
            .open(FacingMode::User, PermissionState::Granted)
            .await
            .unwrap();
        (session, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_seconds_yields_about_one_hundred_ticks() {
        let (_session, handle) = open_handle(Arc::new(SimulatedCamera::new())).await;
        let sampler = DetectionSampler::new(
            Box::new(MockDetectionBackend::seeded(42)),
            Duration::from_millis(100),
        );

        sampler.arm(&handle).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        sampler.disarm().await;

        let ticks = sampler.ticks();
        assert!((95..=105).contains(&ticks), "got {ticks} ticks");
        assert_eq!(sampler.stats().frames_sampled, ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_publishes_empty_frame_and_continues() {
        let (_session, handle) = open_handle(Arc::new(SimulatedCamera::new())).await;
        let backend = ScriptedBackend::new(vec![
            Ok(vec![face("a")]),
            Err(DetectionError::Transient("blurry".into())),
            Ok(vec![face("b"), face("c")]),
        ]);
        let sampler = DetectionSampler::new(Box::new(backend), Duration::from_millis(100));
        let mut events = sampler.subscribe();

        sampler.arm(&handle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        let mut frames = Vec::new();
        let mut transient = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                SamplerEvent::Frame(frame) => frames.push(frame.face_count()),
                SamplerEvent::TransientError { .. } => transient += 1,
                SamplerEvent::Halted(reason) => panic!("unexpected halt: {reason:?}"),
            }
        }

        assert_eq!(frames, vec![1, 0, 2]);
        assert_eq!(transient, 1);
        assert!(sampler.is_running().await);
        assert_eq!(sampler.latest_frame().unwrap().face_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_halts_and_detaches() {
        let (_session, handle) = open_handle(Arc::new(SimulatedCamera::new())).await;
        let backend = ScriptedBackend::new(vec![Err(DetectionError::Fatal("model crashed".into()))]);
        let detached = backend.detached.clone();
        let sampler = DetectionSampler::new(Box::new(backend), Duration::from_millis(100));
        let mut events = sampler.subscribe();

        sampler.arm(&handle).await.unwrap();
        let event = events.recv().await.unwrap();

        assert_eq!(
            event,
            SamplerEvent::Halted(HaltReason::Fatal(
                "Detection backend failed: model crashed".into()
            ))
        );
        assert!(detached.load(Ordering::SeqCst));
        let ticks = sampler.ticks();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sampler.ticks(), ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_failure_is_terminal() {
        let (_session, handle) = open_handle(Arc::new(SimulatedCamera::new())).await;
        let mut backend = ScriptedBackend::new(vec![]);
        backend.attach_error = Some(DetectionError::Fatal("no model".into()));
        let sampler = DetectionSampler::new(Box::new(backend), Duration::from_millis(100));
        let mut events = sampler.subscribe();

        let result = sampler.arm(&handle).await;

        assert!(matches!(result, Err(RecorderError::Detection(_))));
        assert!(matches!(
            events.recv().await.unwrap(),
            SamplerEvent::Halted(HaltReason::Fatal(_))
        ));
        assert!(!sampler.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_close_stops_sampling() {
        let camera = Arc::new(SimulatedCamera::new());
        let (session, handle) = open_handle(camera).await;
        let backend = ScriptedBackend::new(vec![]);
        let detached = backend.detached.clone();
        let sampler = DetectionSampler::new(Box::new(backend), Duration::from_millis(100));
        let mut events = sampler.subscribe();

        sampler.arm(&handle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        session.close().await;

        let halted = loop {
            if let SamplerEvent::Halted(reason) = events.recv().await.unwrap() {
                break reason;
            }
        };
        assert_eq!(halted, HaltReason::StreamClosed);
        assert!(detached.load(Ordering::SeqCst));

        let ticks = sampler.ticks();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sampler.ticks(), ticks);
    }

    #[test]
    fn test_duplicate_ids_rekeyed() {
        let mut detections = vec![face("x"), face("x"), face("y")];
        dedupe_ids(&mut detections);
        assert_eq!(detections[0].id, "x");
        assert_eq!(detections[1].id, "x#1");
        assert_eq!(detections[2].id, "y");
    }

    #[test]
    fn test_rekeyed_ids_avoid_existing_ids() {
        let mut detections = vec![face("x#2"), face("x"), face("x"), face("x#3")];
        dedupe_ids(&mut detections);

        let ids: Vec<_> = detections.iter().map(|d| d.id.as_str()).collect();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len(), "ids not unique: {ids:?}");
        assert_eq!(ids, ["x#2", "x", "x#4", "x#3"]);
    }
}
