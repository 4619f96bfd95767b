//! Simulated capture providers
//!
//! In-process stand-ins for the platform's permission and camera APIs. They
//! drive the headless demo and double as test fakes: every open/stop is
//! counted so callers can check that at most one stream is ever live.

use super::traits::{
    AccessFailure, ChunkSink, DeviceKind, FacingMode, MediaCaptureProvider, MediaStream, PermissionProvider,
    PermissionStatus, PlatformRecorder, RecorderEvent, RecorderOptions, StreamConstraints,
    StreamMetadata, VideoFrame,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// Permission provider with settable answers
pub struct SimulatedPermissions {
    supported: AtomicBool,
    camera: Mutex<PermissionStatus>,
    microphone: Mutex<PermissionStatus>,
    query_error: Mutex<Option<String>>,
}

impl SimulatedPermissions {
    /// Capture supported, both devices undecided
    pub fn new() -> Self {
        Self {
            supported: AtomicBool::new(true),
            camera: Mutex::new(PermissionStatus::Prompt),
            microphone: Mutex::new(PermissionStatus::Prompt),
            query_error: Mutex::new(None),
        }
    }

    /// Both devices already granted
    pub fn granted() -> Self {
        let permissions = Self::new();
        permissions.set(DeviceKind::Camera, PermissionStatus::Granted);
        permissions.set(DeviceKind::Microphone, PermissionStatus::Granted);
        permissions
    }

    /// A platform without any media capture capability
    pub fn unsupported() -> Self {
        let permissions = Self::new();
        permissions.supported.store(false, Ordering::SeqCst);
        permissions
    }

    pub fn set(&self, device: DeviceKind, status: PermissionStatus) {
        match device {
            DeviceKind::Camera => *self.camera.lock() = status,
            DeviceKind::Microphone => *self.microphone.lock() = status,
        }
    }

    /// Make every subsequent query fail with `message`
    pub fn fail_queries(&self, message: impl Into<String>) {
        *self.query_error.lock() = Some(message.into());
    }
}

impl Default for SimulatedPermissions {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionProvider for SimulatedPermissions {
    fn supports_capture(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    async fn query(&self, device: DeviceKind) -> anyhow::Result<PermissionStatus> {
        if let Some(message) = self.query_error.lock().clone() {
            return Err(anyhow::anyhow!(message));
        }
        Ok(match device {
            DeviceKind::Camera => *self.camera.lock(),
            DeviceKind::Microphone => *self.microphone.lock(),
        })
    }
}

/// How a simulated recorder produces chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    /// One chunk of `chunk_size` bytes per timeslice, plus a half-size flush chunk on stop
    Timed { chunk_size: usize },
    /// Chunks only arrive through `SimulatedStream::push_chunk`
    Manual,
}

/// Shared accounting between a camera and the streams it opened
#[derive(Default)]
struct Accounting {
    open_calls: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

/// Camera provider producing synthetic streams
pub struct SimulatedCamera {
    accounting: Arc<Accounting>,
    failures: Mutex<VecDeque<AccessFailure>>,
    streams: Mutex<Vec<Arc<SimulatedStream>>>,
    open_delay: Duration,
    ready_delay: Duration,
    chunk_mode: ChunkMode,
}

impl SimulatedCamera {
    pub fn new() -> Self {
        Self {
            accounting: Arc::new(Accounting::default()),
            failures: Mutex::new(VecDeque::new()),
            streams: Mutex::new(Vec::new()),
            open_delay: Duration::ZERO,
            ready_delay: Duration::from_millis(50),
            chunk_mode: ChunkMode::Timed { chunk_size: 4096 },
        }
    }

    /// Delay before `open_stream` answers, as a pending user prompt would
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Delay before stream metadata becomes available
    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    pub fn with_chunk_mode(mut self, mode: ChunkMode) -> Self {
        self.chunk_mode = mode;
        self
    }

    /// Queue a failure for the next `open_stream` call
    pub fn fail_next_open(&self, failure: AccessFailure) {
        self.failures.lock().push_back(failure);
    }

    /// Number of `open_stream` calls, including failed ones
    pub fn open_calls(&self) -> usize {
        self.accounting.open_calls.load(Ordering::SeqCst)
    }

    /// Streams currently holding the device
    pub fn live_streams(&self) -> usize {
        self.accounting.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live streams ever observed
    pub fn max_live_streams(&self) -> usize {
        self.accounting.max_live.load(Ordering::SeqCst)
    }

    /// Most recently opened stream
    pub fn last_stream(&self) -> Option<Arc<SimulatedStream>> {
        self.streams.lock().last().cloned()
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaCaptureProvider for SimulatedCamera {
    async fn open_stream(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Arc<dyn MediaStream>, AccessFailure> {
        self.accounting.open_calls.fetch_add(1, Ordering::SeqCst);

        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        let queued = self.failures.lock().pop_front();
        if let Some(failure) = queued {
            tracing::debug!("Simulated open failed: {}", failure);
            return Err(failure);
        }

        let live = self.accounting.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.accounting.max_live.fetch_max(live, Ordering::SeqCst);

        let stream = Arc::new(SimulatedStream::new(
            constraints,
            self.accounting.clone(),
            self.ready_delay,
            self.chunk_mode,
        ));
        self.streams.lock().push(stream.clone());

        tracing::debug!(
            "Simulated stream {} opened ({}, {}x{})",
            stream.id,
            constraints.facing_mode,
            constraints.ideal_width,
            constraints.ideal_height
        );
        Ok(stream)
    }
}

/// A synthetic camera stream
pub struct SimulatedStream {
    id: String,
    metadata: StreamMetadata,
    facing_mode: FacingMode,
    accounting: Arc<Accounting>,
    ready_delay: Duration,
    chunk_mode: ChunkMode,
    stopped: AtomicBool,
    ended_tx: watch::Sender<bool>,
    sink: Mutex<Option<ChunkSink>>,
}

impl SimulatedStream {
    fn new(
        constraints: &StreamConstraints,
        accounting: Arc<Accounting>,
        ready_delay: Duration,
        chunk_mode: ChunkMode,
    ) -> Self {
        let (ended_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4().to_string(),
            metadata: StreamMetadata {
                width: constraints.ideal_width,
                height: constraints.ideal_height,
                has_audio: constraints.audio,
            },
            facing_mode: constraints.facing_mode,
            accounting,
            ready_delay,
            chunk_mode,
            stopped: AtomicBool::new(false),
            ended_tx,
            sink: Mutex::new(None),
        }
    }

    pub fn facing_mode(&self) -> FacingMode {
        self.facing_mode
    }

    /// Simulate the device disappearing (unplugged, revoked by the OS)
    pub fn disconnect(&self) {
        tracing::debug!("Simulated stream {} lost its device", self.id);
        self.release();
    }

    /// Deliver a chunk through the running recorder, as the platform would
    pub async fn push_chunk(&self, data: Vec<u8>) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.send(RecorderEvent::Chunk(data)).await.is_ok(),
            None => false,
        }
    }

    fn release(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.accounting.live.fetch_sub(1, Ordering::SeqCst);
            self.ended_tx.send_replace(true);
        }
    }
}

#[async_trait]
impl MediaStream for SimulatedStream {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ready(&self) -> Result<StreamMetadata, AccessFailure> {
        if !self.ready_delay.is_zero() {
            tokio::time::sleep(self.ready_delay).await;
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AccessFailure::Other(
                "stream ended before metadata loaded".to_string(),
            ));
        }
        Ok(self.metadata)
    }

    fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    async fn ended(&self) {
        let mut rx = self.ended_tx.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    fn stop(&self) {
        self.release();
    }

    fn grab_frame(&self) -> Option<VideoFrame> {
        if !self.is_live() {
            return None;
        }
        Some(VideoFrame {
            width: self.metadata.width,
            height: self.metadata.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            data: Vec::new(),
        })
    }

    fn start_recorder(
        &self,
        options: &RecorderOptions,
        sink: ChunkSink,
    ) -> Result<Box<dyn PlatformRecorder>, AccessFailure> {
        if !self.is_live() {
            return Err(AccessFailure::Other("stream is not live".to_string()));
        }

        *self.sink.lock() = Some(sink.clone());

        let (stop_tx, stop_rx) = oneshot::channel();
        let mut ended_rx = self.ended_tx.subscribe();
        let timeslice = options.timeslice;
        let chunk_mode = self.chunk_mode;
        let stream_id = self.id.clone();

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + timeslice, timeslice);
            tokio::pin!(stop_rx);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = async { let _ = ended_rx.wait_for(|ended| *ended).await; } => break,
                    _ = ticker.tick() => {
                        if let ChunkMode::Timed { chunk_size } = chunk_mode {
                            if sink.send(RecorderEvent::Chunk(vec![0u8; chunk_size])).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            if let ChunkMode::Timed { chunk_size } = chunk_mode {
                let _ = sink
                    .send(RecorderEvent::Chunk(vec![0u8; chunk_size / 2]))
                    .await;
            }
            let _ = sink.send(RecorderEvent::Stopped).await;
            tracing::debug!("Simulated recorder on {} stopped", stream_id);
        });

        Ok(Box::new(SimulatedRecorder {
            stop_tx: Some(stop_tx),
        }))
    }
}

struct SimulatedRecorder {
    stop_tx: Option<oneshot::Sender<()>>,
}

impl PlatformRecorder for SimulatedRecorder {
    fn request_stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_open_and_stop_accounting() {
        let camera = SimulatedCamera::new();
        let stream = camera
            .open_stream(&StreamConstraints::new(FacingMode::User))
            .await
            .unwrap();

        assert_eq!(camera.open_calls(), 1);
        assert_eq!(camera.live_streams(), 1);

        stream.stop();
        stream.stop();

        assert_eq!(camera.live_streams(), 0);
        assert_eq!(camera.max_live_streams(), 1);
        assert!(stream.grab_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_failure_is_consumed_once() {
        let camera = SimulatedCamera::new();
        camera.fail_next_open(AccessFailure::DeviceBusy);
        let constraints = StreamConstraints::new(FacingMode::User);

        assert_eq!(
            camera.open_stream(&constraints).await.err(),
            Some(AccessFailure::DeviceBusy)
        );
        assert!(camera.open_stream(&constraints).await.is_ok());
        assert_eq!(camera.open_calls(), 2);
        assert_eq!(camera.live_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_recorder_emits_chunks_then_stops() {
        let camera = SimulatedCamera::new().with_chunk_mode(ChunkMode::Timed { chunk_size: 100 });
        let stream = camera
            .open_stream(&StreamConstraints::new(FacingMode::User))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let options = RecorderOptions {
            mime_type: "video/webm".into(),
            bits_per_second: 8_000_000,
            timeslice: Duration::from_secs(1),
        };

        let mut recorder = stream.start_recorder(&options, tx).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        recorder.request_stop();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = event == RecorderEvent::Stopped;
            events.push(event);
            if done {
                break;
            }
        }

        assert_eq!(
            events,
            vec![
                RecorderEvent::Chunk(vec![0; 100]),
                RecorderEvent::Chunk(vec![0; 100]),
                RecorderEvent::Chunk(vec![0; 50]),
                RecorderEvent::Stopped,
            ]
        );
    }
}
