//! Local webcam capture using nokhwa
//!
//! Frames are pulled on a dedicated capture thread (nokhwa cameras are not
//! `Send` on every backend). While a recording runs, raw frames are piped to
//! an FFmpeg child process that encodes VP9/WebM to stdout; a reader thread
//! batches stdout into one chunk per timeslice.
//!
//! nokhwa captures video only, so streams report `has_audio: false`.

use super::traits::{
    AccessFailure, ChunkSink, DeviceKind, FacingMode, MediaCaptureProvider, MediaStream,
    PermissionProvider, PermissionStatus, PlatformRecorder, RecorderEvent, RecorderOptions,
    StreamConstraints, StreamMetadata, VideoFrame,
};
use async_trait::async_trait;
use chrono::Utc;
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};
use nokhwa::Camera;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// Consecutive frame errors before the device counts as lost
const MAX_FRAME_FAILURES: u32 = 30;

/// Permission provider for desktop webcams. Desktop platforms decide on
/// first open, so status is always `Prompt` and the trial open settles it.
pub struct NativePermissions;

#[async_trait]
impl PermissionProvider for NativePermissions {
    fn supports_capture(&self) -> bool {
        nokhwa::query(ApiBackend::Auto).is_ok()
    }

    async fn query(&self, _device: DeviceKind) -> anyhow::Result<PermissionStatus> {
        Ok(PermissionStatus::Prompt)
    }
}

/// Camera provider over local webcams. `User` maps to the first camera,
/// `Environment` to the second.
pub struct NativeCamera {
    audio_requested: bool,
}

impl NativeCamera {
    pub fn new(audio_requested: bool) -> Self {
        Self { audio_requested }
    }

    fn camera_index(facing_mode: FacingMode) -> u32 {
        match facing_mode {
            FacingMode::User => 0,
            FacingMode::Environment => 1,
        }
    }
}

#[async_trait]
impl MediaCaptureProvider for NativeCamera {
    async fn open_stream(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Arc<dyn MediaStream>, AccessFailure> {
        let index = Self::camera_index(constraints.facing_mode);
        let cameras = nokhwa::query(ApiBackend::Auto)
            .map_err(|e| AccessFailure::Other(e.to_string()))?;
        if index as usize >= cameras.len() {
            return Err(AccessFailure::NoDevice);
        }
        if self.audio_requested && constraints.audio {
            tracing::warn!("Native capture has no microphone support; recording video only");
        }

        let shared = ThreadShared::new();
        let (opened_tx, opened_rx) = oneshot::channel();
        let thread_shared = shared.clone();
        let (width, height) = (constraints.ideal_width, constraints.ideal_height);

        std::thread::spawn(move || capture_thread(index, width, height, thread_shared, opened_tx));

        let (metadata, input) = opened_rx
            .await
            .map_err(|_| AccessFailure::Other("capture thread exited".to_string()))??;

        Ok(Arc::new(NativeStream {
            id: Uuid::new_v4().to_string(),
            metadata,
            input,
            shared,
        }))
    }
}

/// How FFmpeg should read the camera's frames
#[derive(Debug, Clone)]
struct InputFormat {
    /// `None` for MJPEG, which FFmpeg demuxes itself
    pixel_format: Option<&'static str>,
    width: u32,
    height: u32,
    fps: u32,
}

impl InputFormat {
    fn ffmpeg_args(&self) -> Vec<String> {
        let mut args = match self.pixel_format {
            Some(pixel_format) => vec![
                "-f".to_string(),
                "rawvideo".to_string(),
                "-pixel_format".to_string(),
                pixel_format.to_string(),
                "-video_size".to_string(),
                format!("{}x{}", self.width, self.height),
            ],
            None => vec!["-f".to_string(), "mjpeg".to_string()],
        };
        args.extend([
            "-framerate".to_string(),
            self.fps.to_string(),
            "-i".to_string(),
            "-".to_string(),
        ]);
        args
    }
}

#[derive(Clone)]
struct ThreadShared {
    stopped: Arc<AtomicBool>,
    ended_tx: Arc<watch::Sender<bool>>,
    latest: Arc<Mutex<Option<VideoFrame>>>,
    encoder: Arc<Mutex<Option<ChildStdin>>>,
}

impl ThreadShared {
    fn new() -> Self {
        let (ended_tx, _) = watch::channel(false);
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            ended_tx: Arc::new(ended_tx),
            latest: Arc::new(Mutex::new(None)),
            encoder: Arc::new(Mutex::new(None)),
        }
    }

    fn finish(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.encoder.lock().take();
        self.latest.lock().take();
        self.ended_tx.send_replace(true);
    }
}

fn classify(message: &str) -> AccessFailure {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        AccessFailure::UserRejected
    } else if lower.contains("busy") || lower.contains("in use") {
        AccessFailure::DeviceBusy
    } else if lower.contains("not found") || lower.contains("no device") {
        AccessFailure::NoDevice
    } else {
        AccessFailure::Other(message.to_string())
    }
}

type OpenResult = Result<(StreamMetadata, InputFormat), AccessFailure>;

fn capture_thread(
    index: u32,
    width: u32,
    height: u32,
    shared: ThreadShared,
    opened: oneshot::Sender<OpenResult>,
) {
    let requested = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::Closest(
        CameraFormat::new(Resolution::new(width, height), FrameFormat::MJPEG, 30),
    ));

    let mut camera = match Camera::new(CameraIndex::Index(index), requested) {
        Ok(camera) => camera,
        Err(e) => {
            tracing::error!("Failed to open camera {}: {:?}", index, e);
            let _ = opened.send(Err(classify(&e.to_string())));
            shared.finish();
            return;
        }
    };
    if let Err(e) = camera.open_stream() {
        tracing::error!("Failed to open camera stream: {:?}", e);
        let _ = opened.send(Err(classify(&e.to_string())));
        shared.finish();
        return;
    }

    let format = camera.camera_format();
    let actual_width = format.resolution().width();
    let actual_height = format.resolution().height();
    let pixel_format = match format.format() {
        FrameFormat::YUYV => Some("yuyv422"),
        FrameFormat::NV12 => Some("nv12"),
        FrameFormat::RAWRGB => Some("rgb24"),
        FrameFormat::MJPEG => None,
        other => {
            tracing::warn!("Unknown camera format {:?}, falling back to yuyv422", other);
            Some("yuyv422")
        }
    };
    let input = InputFormat {
        pixel_format,
        width: actual_width,
        height: actual_height,
        fps: format.frame_rate(),
    };
    tracing::info!(
        "Webcam opened: {}x{} @ {}fps, format={:?} (requested {}x{})",
        actual_width,
        actual_height,
        input.fps,
        format.format(),
        width,
        height
    );

    let metadata = StreamMetadata {
        width: actual_width,
        height: actual_height,
        has_audio: false,
    };
    if opened.send(Ok((metadata, input))).is_err() {
        let _ = camera.stop_stream();
        shared.finish();
        return;
    }

    let mut failures = 0u32;
    while !shared.stopped.load(Ordering::SeqCst) {
        match camera.frame() {
            Ok(frame) => {
                failures = 0;
                let raw = frame.buffer();

                {
                    let mut encoder = shared.encoder.lock();
                    let write_failed = encoder
                        .as_mut()
                        .map(|stdin| stdin.write_all(raw).is_err())
                        .unwrap_or(false);
                    if write_failed {
                        tracing::warn!("FFmpeg stopped accepting frames");
                        encoder.take();
                    }
                }

                *shared.latest.lock() = Some(VideoFrame {
                    width: actual_width,
                    height: actual_height,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    data: raw.to_vec(),
                });
            }
            Err(e) => {
                failures += 1;
                tracing::debug!("Frame capture failed: {:?}", e);
                if failures >= MAX_FRAME_FAILURES {
                    tracing::error!("Camera stopped delivering frames: {:?}", e);
                    break;
                }
            }
        }
    }

    let _ = camera.stop_stream();
    shared.finish();
    tracing::info!("Webcam capture thread exited");
}

/// A live local webcam stream
pub struct NativeStream {
    id: String,
    metadata: StreamMetadata,
    input: InputFormat,
    shared: ThreadShared,
}

#[async_trait]
impl MediaStream for NativeStream {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ready(&self) -> Result<StreamMetadata, AccessFailure> {
        if self.is_live() {
            Ok(self.metadata)
        } else {
            Err(AccessFailure::Other("camera stream has ended".to_string()))
        }
    }

    fn is_live(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst)
    }

    async fn ended(&self) {
        let mut rx = self.shared.ended_tx.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.encoder.lock().take();
    }

    fn grab_frame(&self) -> Option<VideoFrame> {
        self.shared.latest.lock().clone()
    }

    fn start_recorder(
        &self,
        options: &RecorderOptions,
        sink: ChunkSink,
    ) -> Result<Box<dyn PlatformRecorder>, AccessFailure> {
        if !self.is_live() {
            return Err(AccessFailure::Other("stream is not live".to_string()));
        }

        let mut child = Command::new("ffmpeg")
            .arg("-hide_banner")
            .args(self.input.ffmpeg_args())
            .args([
                "-c:v",
                "libvpx-vp9",
                "-b:v",
                &options.bits_per_second.to_string(),
                "-deadline",
                "realtime",
                "-pix_fmt",
                "yuv420p",
                "-f",
                "webm",
                "-",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AccessFailure::Other(format!("failed to start FFmpeg: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(AccessFailure::Other("FFmpeg pipes unavailable".to_string()));
        };
        *self.shared.encoder.lock() = Some(stdin);

        tracing::info!(
            "Started FFmpeg WebM encoder at {} bps for {}",
            options.bits_per_second,
            options.mime_type
        );

        let timeslice = options.timeslice;
        std::thread::spawn(move || pump_chunks(child, stdout, sink, timeslice));

        Ok(Box::new(NativeRecorder {
            encoder: self.shared.encoder.clone(),
        }))
    }
}

/// Read FFmpeg's stdout and forward it in timeslice-sized batches
fn pump_chunks(mut child: Child, mut stdout: ChildStdout, sink: ChunkSink, timeslice: Duration) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut pending = Vec::new();
    let mut last_flush = Instant::now();

    loop {
        match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                if last_flush.elapsed() >= timeslice {
                    last_flush = Instant::now();
                    if sink
                        .blocking_send(RecorderEvent::Chunk(std::mem::take(&mut pending)))
                        .is_err()
                    {
                        let _ = child.kill();
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = sink.blocking_send(RecorderEvent::Error(format!(
                    "failed to read encoder output: {e}"
                )));
                break;
            }
        }
    }

    if !pending.is_empty() {
        let _ = sink.blocking_send(RecorderEvent::Chunk(pending));
    }
    match child.wait() {
        Ok(status) if !status.success() => {
            tracing::warn!("FFmpeg exited with status {}", status);
            let _ = sink.blocking_send(RecorderEvent::Error(format!(
                "encoder exited with status {status}"
            )));
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to wait for FFmpeg: {}", e),
    }
    let _ = sink.blocking_send(RecorderEvent::Stopped);
}

struct NativeRecorder {
    encoder: Arc<Mutex<Option<ChildStdin>>>,
}

impl PlatformRecorder for NativeRecorder {
    fn request_stop(&mut self) {
        // Closing stdin lets FFmpeg flush and exit
        self.encoder.lock().take();
    }
}
