//! Control plane: at most one capture session and one assembly job.
//!
//! Each run gets its own background thread and its own cancellation handle.
//! Requests that would overlap an active run are rejected with
//! `ControlError::Conflict`; finished runs are reaped lazily on the next call.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::capture::{
    CaptureError, CapturePlan, CaptureProgress, CaptureReport, CaptureScheduler, CaptureSession,
    CaptureSettings, SessionStopper,
};
use crate::codec::ImageCodec;
use crate::device::DeviceManager;
use crate::encoder::{
    AssemblyRequest, EncoderError, EncoderSettings, EncoderSupervisor, JobOutcome,
};
use crate::storage;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{0}")]
    Conflict(&'static str),
    #[error("no {0} is running")]
    NotRunning(&'static str),
    #[error("failed to start worker thread: {0}")]
    Thread(#[from] std::io::Error),
    #[error("clear frames: {0}")]
    Storage(String),
}

#[derive(Clone, Debug)]
pub struct ControlSettings {
    pub capture: CaptureSettings,
    pub default_interval: Duration,
    pub encoder: EncoderSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Finished { report: CaptureReport },
    Failed { error: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AssemblyOutcome {
    Finished { outcome: JobOutcome },
    Failed { error: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CaptureStatus {
    pub stopping: bool,
    pub frames_planned: u64,
    pub interval_ms: u64,
    pub progress: CaptureProgress,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssemblyStatus {
    pub stopping: bool,
    pub request: AssemblyRequest,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub devices: Vec<String>,
    /// Image files currently in the frame directory.
    pub frames_on_disk: usize,
    pub capture: Option<CaptureStatus>,
    pub assembly: Option<AssemblyStatus>,
    pub last_capture: Option<CaptureOutcome>,
    pub last_assembly: Option<AssemblyOutcome>,
}

struct ActiveCapture {
    session: Arc<CaptureSession>,
    stopper: SessionStopper,
    join: JoinHandle<Result<CaptureReport, CaptureError>>,
}

struct ActiveAssembly {
    request: AssemblyRequest,
    cancel: CancelToken,
    join: JoinHandle<Result<JobOutcome, EncoderError>>,
}

#[derive(Default)]
struct ControllerState {
    capture: Option<ActiveCapture>,
    assembly: Option<ActiveAssembly>,
    last_capture: Option<CaptureOutcome>,
    last_assembly: Option<AssemblyOutcome>,
}

impl ControllerState {
    fn reap(&mut self) {
        if self.capture.as_ref().is_some_and(|c| c.join.is_finished()) {
            if let Some(active) = self.capture.take() {
                self.last_capture = Some(capture_outcome(active.join));
            }
        }
        if self.assembly.as_ref().is_some_and(|a| a.join.is_finished()) {
            if let Some(active) = self.assembly.take() {
                self.last_assembly = Some(assembly_outcome(active.join));
            }
        }
    }
}

fn capture_outcome(join: JoinHandle<Result<CaptureReport, CaptureError>>) -> CaptureOutcome {
    match join.join() {
        Ok(Ok(report)) => CaptureOutcome::Finished { report },
        Ok(Err(err)) => CaptureOutcome::Failed {
            error: err.to_string(),
        },
        Err(_) => CaptureOutcome::Failed {
            error: "capture thread panicked".to_string(),
        },
    }
}

fn assembly_outcome(join: JoinHandle<Result<JobOutcome, EncoderError>>) -> AssemblyOutcome {
    match join.join() {
        Ok(Ok(outcome)) => AssemblyOutcome::Finished { outcome },
        Ok(Err(err)) => AssemblyOutcome::Failed {
            error: err.to_string(),
        },
        Err(_) => AssemblyOutcome::Failed {
            error: "assembly thread panicked".to_string(),
        },
    }
}

pub struct Controller {
    devices: Arc<dyn DeviceManager>,
    codec: Arc<dyn ImageCodec>,
    settings: ControlSettings,
    encoder: Arc<EncoderSupervisor>,
    state: Mutex<ControllerState>,
}

impl Controller {
    pub fn new(
        devices: Arc<dyn DeviceManager>,
        codec: Arc<dyn ImageCodec>,
        settings: ControlSettings,
    ) -> Self {
        let encoder = Arc::new(EncoderSupervisor::new(settings.encoder.clone()));
        Self {
            devices,
            codec,
            settings,
            encoder,
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    pub fn list_devices(&self) -> Vec<String> {
        self.devices.list_devices()
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.reap();
        state
    }

    /// Zero minutes means a full day; zero interval means the configured default.
    pub fn start_capture(
        &self,
        duration_minutes: u64,
        interval_ms: u64,
    ) -> Result<CapturePlan, ControlError> {
        let plan = CapturePlan::new(duration_minutes, interval_ms, self.settings.default_interval);
        self.start_capture_plan(plan)
    }

    pub fn start_capture_plan(&self, plan: CapturePlan) -> Result<CapturePlan, ControlError> {
        let mut state = self.lock();
        if state.capture.is_some() {
            return Err(ControlError::Conflict("capture already running"));
        }
        if state.assembly.is_some() {
            return Err(ControlError::Conflict("assembly is running"));
        }

        let session = Arc::new(CaptureSession::new(plan));
        let stopper = session.stopper();
        let scheduler = CaptureScheduler::new(
            self.devices.clone(),
            self.codec.clone(),
            self.settings.capture.clone(),
        );
        let worker_session = session.clone();
        let join = std::thread::Builder::new()
            .name("capture-session".into())
            .spawn(move || {
                let result = scheduler.run(&worker_session);
                if let Err(err) = &result {
                    log::error!("capture: session failed: {}", err);
                }
                result
            })?;

        log::info!(
            "control: capture started ({} frames every {:?})",
            plan.total_frames,
            plan.interval
        );
        state.capture = Some(ActiveCapture {
            session,
            stopper,
            join,
        });
        Ok(plan)
    }

    /// Request a stop. Returns immediately; the session winds down on its own thread.
    pub fn stop_capture(&self) -> Result<(), ControlError> {
        let state = self.lock();
        let active = state
            .capture
            .as_ref()
            .ok_or(ControlError::NotRunning("capture"))?;
        active.stopper.stop();
        log::info!("control: capture stop requested");
        Ok(())
    }

    /// Block until the active capture (if any) finishes.
    ///
    /// The session stays registered until its thread has exited, so it keeps
    /// blocking other runs for the whole teardown.
    pub fn join_capture(&self) -> Option<CaptureOutcome> {
        if self.lock().capture.is_none() {
            return None;
        }
        loop {
            {
                let state = self.lock();
                if state.capture.is_none() {
                    return state.last_capture.clone();
                }
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }
    }

    pub fn start_assembly(&self, request: AssemblyRequest) -> Result<AssemblyRequest, ControlError> {
        let mut state = self.lock();
        if state.capture.is_some() {
            return Err(ControlError::Conflict("capture is running"));
        }
        if state.assembly.is_some() {
            return Err(ControlError::Conflict("assembly already running"));
        }

        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let encoder = self.encoder.clone();
        let join = std::thread::Builder::new()
            .name("assembly-job".into())
            .spawn(move || {
                let result = encoder.assemble(request, &worker_cancel);
                if let Err(err) = &result {
                    log::error!("assembly: job failed: {}", err);
                }
                result
            })?;

        log::info!("control: assembly started ({:?})", request);
        state.assembly = Some(ActiveAssembly {
            request,
            cancel,
            join,
        });
        Ok(request)
    }

    pub fn stop_assembly(&self) -> Result<(), ControlError> {
        let state = self.lock();
        let active = state
            .assembly
            .as_ref()
            .ok_or(ControlError::NotRunning("assembly"))?;
        active.cancel.cancel();
        log::info!("control: assembly stop requested");
        Ok(())
    }

    pub fn join_assembly(&self) -> Option<AssemblyOutcome> {
        if self.lock().assembly.is_none() {
            return None;
        }
        loop {
            {
                let state = self.lock();
                if state.assembly.is_none() {
                    return state.last_assembly.clone();
                }
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }
    }

    pub fn clear_frames(&self, all_files: bool) -> Result<usize, ControlError> {
        let state = self.lock();
        if state.capture.is_some() {
            return Err(ControlError::Conflict("capture is running"));
        }
        // Held across the removal so a capture cannot start underneath it.
        let removed = storage::clear_frames(&self.settings.capture.frame_dir, all_files)
            .map_err(|err| ControlError::Storage(format!("{err:#}")))?;
        drop(state);
        Ok(removed)
    }

    pub fn status(&self) -> ControllerStatus {
        let frames_on_disk = storage::count_frames(&self.settings.capture.frame_dir)
            .unwrap_or_else(|err| {
                log::warn!("control: cannot count frames: {:#}", err);
                0
            });
        let devices = self.list_devices();
        let state = self.lock();
        ControllerStatus {
            devices,
            frames_on_disk,
            capture: state.capture.as_ref().map(|active| {
                let plan = active.session.plan();
                CaptureStatus {
                    stopping: active.stopper.is_stopped(),
                    frames_planned: plan.total_frames,
                    interval_ms: plan.interval.as_millis() as u64,
                    progress: active.session.progress(),
                }
            }),
            assembly: state.assembly.as_ref().map(|active| AssemblyStatus {
                stopping: active.cancel.is_cancelled(),
                request: active.request,
            }),
            last_capture: state.last_capture.clone(),
            last_assembly: state.last_assembly.clone(),
        }
    }

    /// Stop everything and wait for both workers.
    pub fn shutdown(&self) {
        {
            let state = self.lock();
            if let Some(active) = &state.capture {
                active.stopper.stop();
            }
            if let Some(active) = &state.assembly {
                active.cancel.cancel();
            }
        }
        self.join_capture();
        self.join_assembly();
        log::info!("control: shut down");
    }
}
