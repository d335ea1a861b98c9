//! Paced frame capture.
//!
//! `CaptureScheduler::run` drives one `CaptureSession` against one device:
//! configure → allocate → one request bound to one buffer → paced loop →
//! teardown. Exactly one request is ever in flight; the device's completion
//! arrives on the device thread and is handed over through the session's
//! `CompletionBridge`, then mapped and transcoded on the scheduler thread.
//!
//! Cancellation (`SessionStopper::stop`) is observed at the top of each
//! iteration and while waiting for a completion. A stop therefore costs at most
//! one cadence interval plus the grace period.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::{CompletionBridge, Wakeup};
use crate::cancel::CancelToken;
use crate::codec::ImageCodec;
use crate::device::{
    CaptureDevice, CompletedRequest, DeviceError, DeviceManager, RequestId, RequestStatus,
    StreamConfig,
};
use crate::transcode::{FrameError, Transcoder};

/// Session length used when the caller passes zero minutes.
pub const FULL_DAY_MINUTES: u64 = 24 * 60;
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_GRACE: Duration = Duration::from_millis(300);
pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;
const MIN_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no capture device: {0}")]
    Acquire(#[source] DeviceError),
    #[error("device configuration failed: {0}")]
    Configure(#[source] DeviceError),
    #[error("buffer allocation failed: {0}")]
    Allocate(#[source] DeviceError),
    #[error("device start failed: {0}")]
    Start(#[source] DeviceError),
    #[error("request submit failed: {0}")]
    Submit(#[source] DeviceError),
    #[error("device stalled: frame {sequence} not completed after {waited:?}")]
    Stalled { sequence: u64, waited: Duration },
    #[error("frame directory {}: {source}", path.display())]
    FrameDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("capture session already ran")]
    SessionReused,
}

impl CaptureError {
    /// Failures that abort before any frame is captured.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            CaptureError::Acquire(_) | CaptureError::Configure(_) | CaptureError::Allocate(_)
        )
    }
}

/// Frame count and cadence of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapturePlan {
    pub duration: Duration,
    pub interval: Duration,
    pub total_frames: u64,
}

impl CapturePlan {
    /// `duration_minutes == 0` means a full day; `interval_ms == 0` means `default_interval`.
    pub fn new(duration_minutes: u64, interval_ms: u64, default_interval: Duration) -> Self {
        let minutes = if duration_minutes > 0 {
            duration_minutes
        } else {
            FULL_DAY_MINUTES
        };
        let interval = if interval_ms > 0 {
            Duration::from_millis(interval_ms)
        } else {
            default_interval
        };
        Self::with_duration(Duration::from_secs(minutes.saturating_mul(60)), interval)
    }

    pub fn with_duration(duration: Duration, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let total_frames = u64::try_from(duration.as_millis() / interval_ms).unwrap_or(u64::MAX);
        Self {
            duration,
            interval,
            total_frames,
        }
    }

    /// Upper bound on a single completion wait.
    pub fn frame_timeout(&self) -> Duration {
        (self.interval * 4).max(MIN_FRAME_TIMEOUT)
    }
}

#[derive(Debug, Default)]
struct ProgressCounters {
    attempted: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

/// Live counters of a running session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct CaptureProgress {
    pub attempted: u64,
    pub written: u64,
    pub failed: u64,
}

/// One capture run: plan, cancellation token and completion bridge.
pub struct CaptureSession {
    plan: CapturePlan,
    cancel: CancelToken,
    bridge: Arc<CompletionBridge<CompletedRequest>>,
    progress: Arc<ProgressCounters>,
    started: AtomicBool,
}

impl CaptureSession {
    pub fn new(plan: CapturePlan) -> Self {
        Self {
            plan,
            cancel: CancelToken::new(),
            bridge: Arc::new(CompletionBridge::new()),
            progress: Arc::new(ProgressCounters::default()),
            started: AtomicBool::new(false),
        }
    }

    pub fn plan(&self) -> CapturePlan {
        self.plan
    }

    pub fn stopper(&self) -> SessionStopper {
        SessionStopper {
            cancel: self.cancel.clone(),
            bridge: self.bridge.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn progress(&self) -> CaptureProgress {
        CaptureProgress {
            attempted: self.progress.attempted.load(Ordering::SeqCst),
            written: self.progress.written.load(Ordering::SeqCst),
            failed: self.progress.failed.load(Ordering::SeqCst),
        }
    }
}

/// Stops a session from any thread.
#[derive(Clone)]
pub struct SessionStopper {
    cancel: CancelToken,
    bridge: Arc<CompletionBridge<CompletedRequest>>,
}

impl SessionStopper {
    pub fn stop(&self) {
        self.cancel.cancel();
        self.bridge.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct CaptureReport {
    pub frames_planned: u64,
    pub frames_attempted: u64,
    pub frames_written: u64,
    pub frames_failed: u64,
    pub cancelled: bool,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub frame_dir: PathBuf,
    pub jpeg_quality: u8,
    pub grace: Duration,
}

#[derive(Default)]
struct LoopState {
    in_flight: bool,
    exhausted: bool,
}

pub struct CaptureScheduler {
    devices: Arc<dyn DeviceManager>,
    codec: Arc<dyn ImageCodec>,
    settings: CaptureSettings,
}

impl CaptureScheduler {
    pub fn new(
        devices: Arc<dyn DeviceManager>,
        codec: Arc<dyn ImageCodec>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            devices,
            codec,
            settings,
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Run `session` to exhaustion or cancellation. Blocks the calling thread.
    pub fn run(&self, session: &CaptureSession) -> Result<CaptureReport, CaptureError> {
        if session.started.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::SessionReused);
        }
        let started = Instant::now();
        let plan = session.plan();
        std::fs::create_dir_all(&self.settings.frame_dir).map_err(|source| {
            CaptureError::FrameDir {
                path: self.settings.frame_dir.clone(),
                source,
            }
        })?;

        let mut device = self
            .devices
            .acquire(&self.settings.device)
            .map_err(CaptureError::Acquire)?;
        log::info!(
            "capture: acquired {} for {} frames every {:?}",
            device.id(),
            plan.total_frames,
            plan.interval
        );
        let result = self.run_on(device.as_mut(), session);
        device.release();

        result?;
        let progress = session.progress();
        let report = CaptureReport {
            frames_planned: plan.total_frames,
            frames_attempted: progress.attempted,
            frames_written: progress.written,
            frames_failed: progress.failed,
            cancelled: session.is_cancelled(),
            elapsed: started.elapsed(),
        };
        log::info!(
            "capture: finished ({}/{} written, {} failed, cancelled={})",
            report.frames_written,
            report.frames_planned,
            report.frames_failed,
            report.cancelled
        );
        Ok(report)
    }

    fn run_on(
        &self,
        device: &mut dyn CaptureDevice,
        session: &CaptureSession,
    ) -> Result<(), CaptureError> {
        let requested = StreamConfig::yuv420(self.settings.width, self.settings.height);
        log::info!("capture: requested configuration {}", requested);
        let validated = device
            .configure(&requested)
            .map_err(CaptureError::Configure)?;
        log::info!("capture: validated configuration {}", validated);

        let allocated = device
            .allocate_buffers()
            .map_err(CaptureError::Allocate)?;
        log::info!("capture: allocated {} buffers", allocated);

        // One request on one buffer, reused for every frame.
        let request = match device.create_request(0) {
            Ok(request) => request,
            Err(err) => {
                device.free_buffers();
                return Err(CaptureError::Allocate(err));
            }
        };

        let bridge = session.bridge.clone();
        device.on_complete(Arc::new(move |done: CompletedRequest| {
            bridge.signal_complete(done)
        }));
        if let Err(err) = device.start() {
            device.free_buffers();
            return Err(CaptureError::Start(err));
        }

        let transcoder = Transcoder::new(
            self.codec.clone(),
            validated.layout(),
            self.settings.jpeg_quality,
        );
        let mut state = LoopState::default();
        let result = self.capture_loop(device, session, request, &transcoder, &mut state);
        self.teardown(device, session, &transcoder, &mut state);
        result
    }

    fn capture_loop(
        &self,
        device: &mut dyn CaptureDevice,
        session: &CaptureSession,
        request: RequestId,
        transcoder: &Transcoder,
        state: &mut LoopState,
    ) -> Result<(), CaptureError> {
        let plan = session.plan();
        let frame_timeout = plan.frame_timeout();

        for index in 0..plan.total_frames {
            if session.is_cancelled() {
                break;
            }
            let loop_start = Instant::now();

            if index > 0 {
                match session.bridge.wait_for_complete_timeout(frame_timeout) {
                    Wakeup::Completed(done) => {
                        state.in_flight = false;
                        if session.is_cancelled() {
                            log::info!("capture: stop requested, discarding frame {:06}", index - 1);
                            break;
                        }
                        self.write_frame(device, session, transcoder, done, index - 1);
                    }
                    Wakeup::Aborted => break,
                    Wakeup::TimedOut => {
                        return Err(CaptureError::Stalled {
                            sequence: index - 1,
                            waited: frame_timeout,
                        });
                    }
                }
                if session.is_cancelled() {
                    break;
                }
            }

            device.submit(request).map_err(CaptureError::Submit)?;
            state.in_flight = true;
            session.progress.attempted.fetch_add(1, Ordering::SeqCst);

            if let Some(remaining) = plan.interval.checked_sub(loop_start.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
        state.exhausted = !session.is_cancelled();
        Ok(())
    }

    fn teardown(
        &self,
        device: &mut dyn CaptureDevice,
        session: &CaptureSession,
        transcoder: &Transcoder,
        state: &mut LoopState,
    ) {
        if session.is_cancelled() {
            log::info!("capture: stop received, finishing current frame");
        }
        if state.in_flight {
            match session.bridge.settle(self.settings.grace) {
                Some(done) => {
                    state.in_flight = false;
                    let last = session.progress.attempted.load(Ordering::SeqCst);
                    if state.exhausted && !session.is_cancelled() && last > 0 {
                        self.write_frame(device, session, transcoder, done, last - 1);
                    } else {
                        log::debug!("capture: discarding completion received during teardown");
                    }
                }
                None => log::warn!(
                    "capture: request still in flight after {:?}, cancelling",
                    self.settings.grace
                ),
            }
        }

        if let Err(err) = device.stop() {
            log::error!("capture: device stop failed: {}", err);
        }
        device.free_buffers();
    }

    fn write_frame(
        &self,
        device: &dyn CaptureDevice,
        session: &CaptureSession,
        transcoder: &Transcoder,
        done: CompletedRequest,
        sequence: u64,
    ) {
        let result = if done.status == RequestStatus::Cancelled {
            Err(FrameError::Cancelled)
        } else {
            // The mapping is dropped at the end of this arm whatever the outcome.
            match device.map_frame(done.request) {
                Ok(mapped) => {
                    let frame = mapped.raw_frame();
                    transcoder.transcode(&frame, sequence, &self.settings.frame_dir)
                }
                Err(err) => Err(FrameError::Map(err)),
            }
        };

        match result {
            Ok(path) => {
                session.progress.written.fetch_add(1, Ordering::SeqCst);
                log::debug!(
                    "seq: {:06} device_seq: {} bytesused: {} -> {}",
                    sequence,
                    done.sequence,
                    done.bytes_used,
                    path.display()
                );
            }
            Err(err) => {
                session.progress.failed.fetch_add(1, Ordering::SeqCst);
                log::warn!("capture: frame {:06} skipped: {}", sequence, err);
            }
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
