//! External video encoder supervision.
//!
//! An `EncoderJob` owns one child process and walks the state machine
//! `NotStarted → Running → {Succeeded, Failed, KilledBySignal, Cancelled}`.
//! The program is spawned with a fixed argument vector (no shell); liveness is
//! polled without blocking; cancellation sends a graceful stop, waits a bounded
//! grace period, then kills and reaps. A job never leaves an unreaped child,
//! including when it is dropped mid-run.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::cancel::CancelToken;

pub const DEFAULT_FRAMERATE: u32 = 60;
pub const DEFAULT_QUALITY: u8 = 23;
pub const MAX_QUALITY: i64 = 51;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);
const GRACE_POLL_STEP: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderPreset {
    Medium,
    Faster,
    Veryfast,
}

impl EncoderPreset {
    /// 1, 2, 3 → medium, faster, veryfast.
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            1 => Some(EncoderPreset::Medium),
            2 => Some(EncoderPreset::Faster),
            3 => Some(EncoderPreset::Veryfast),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderPreset::Medium => "medium",
            EncoderPreset::Faster => "faster",
            EncoderPreset::Veryfast => "veryfast",
        }
    }
}

/// Normalised assembly parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AssemblyRequest {
    pub framerate: u32,
    pub preset: EncoderPreset,
    pub quality: u8,
}

impl Default for AssemblyRequest {
    fn default() -> Self {
        Self {
            framerate: DEFAULT_FRAMERATE,
            preset: EncoderPreset::Faster,
            quality: DEFAULT_QUALITY,
        }
    }
}

impl AssemblyRequest {
    /// Out-of-range values fall back to defaults: framerate ≤ 0 → 60, preset
    /// outside 1..=3 → faster, quality outside 0..=51 → 23.
    pub fn from_raw(framerate: i64, preset: i64, quality: i64) -> Self {
        let framerate = if framerate > 0 {
            u32::try_from(framerate).unwrap_or(u32::MAX)
        } else {
            DEFAULT_FRAMERATE
        };
        let preset = EncoderPreset::from_index(preset).unwrap_or(EncoderPreset::Faster);
        let quality = if (0..=MAX_QUALITY).contains(&quality) {
            quality as u8
        } else {
            DEFAULT_QUALITY
        };
        Self {
            framerate,
            preset,
            quality,
        }
    }
}

/// Program plus discrete arguments. Never passed through a shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderCommand {
    program: OsString,
    args: Vec<OsString>,
}

impl EncoderCommand {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        command
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    NotStarted,
    Running,
    Succeeded,
    Failed { code: i32 },
    KilledBySignal { signal: i32 },
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::NotStarted | JobState::Running)
    }

    fn from_exit(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => JobState::Succeeded,
            Some(code) => JobState::Failed { code },
            None => signal_state(status),
        }
    }
}

#[cfg(unix)]
fn signal_state(status: ExitStatus) -> JobState {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => JobState::KilledBySignal { signal },
        None => JobState::Failed { code: -1 },
    }
}

#[cfg(not(unix))]
fn signal_state(_status: ExitStatus) -> JobState {
    JobState::Failed { code: -1 }
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to spawn {}: {source}", program.to_string_lossy())]
    Spawn {
        program: OsString,
        source: std::io::Error,
    },
    #[error("failed to query encoder process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("job is {0:?}, expected {1}")]
    InvalidState(JobState, &'static str),
    #[error("video directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One encoder invocation.
pub struct EncoderJob {
    command: EncoderCommand,
    child: Option<Child>,
    state: JobState,
}

impl EncoderJob {
    pub fn new(command: EncoderCommand) -> Self {
        Self {
            command,
            child: None,
            state: JobState::NotStarted,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|child| child.id())
    }

    pub fn start(&mut self) -> Result<(), EncoderError> {
        if self.state != JobState::NotStarted {
            return Err(EncoderError::InvalidState(self.state, "not_started"));
        }
        let child = self
            .command
            .to_command()
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;
        log::info!("encoder: spawned pid {}", child.id());
        self.child = Some(child);
        self.state = JobState::Running;
        Ok(())
    }

    /// Non-blocking liveness check.
    pub fn poll(&mut self) -> Result<JobState, EncoderError> {
        if self.state != JobState::Running {
            return Ok(self.state);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(self.state);
        };
        if let Some(status) = child.try_wait().map_err(EncoderError::Wait)? {
            self.state = JobState::from_exit(status);
            log::info!("encoder: pid {} exited: {:?}", child.id(), self.state);
        }
        Ok(self.state)
    }

    /// Graceful stop, bounded grace period, then forced kill and reap.
    ///
    /// A process that already exited on its own keeps its natural status.
    pub fn cancel(&mut self, grace: Duration) -> Result<JobState, EncoderError> {
        if self.poll()?.is_terminal() {
            return Ok(self.state);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(self.state);
        };
        let pid = child.id();

        log::info!("encoder: stopping pid {} (grace {:?})", pid, grace);
        if let Err(err) = terminate_gracefully(child) {
            log::warn!("encoder: graceful stop of pid {} failed: {}", pid, err);
        }

        let deadline = Instant::now() + grace;
        let mut exited = child.try_wait().map_err(EncoderError::Wait)?;
        while exited.is_none() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(GRACE_POLL_STEP.min(deadline - now));
            exited = child.try_wait().map_err(EncoderError::Wait)?;
        }

        if exited.is_none() {
            log::warn!("encoder: pid {} ignored stop, killing", pid);
            if let Err(err) = child.kill() {
                log::warn!("encoder: kill of pid {} failed: {}", pid, err);
            }
            child.wait().map_err(EncoderError::Wait)?;
        }
        self.state = JobState::Cancelled;
        log::info!("encoder: pid {} cancelled", pid);
        Ok(self.state)
    }

    /// Poll every `poll_interval` until the process exits or `cancel` fires.
    pub fn supervise(
        &mut self,
        cancel: &CancelToken,
        poll_interval: Duration,
        grace: Duration,
    ) -> Result<JobState, EncoderError> {
        if self.state == JobState::NotStarted {
            self.start()?;
        }
        loop {
            let state = self.poll()?;
            if state.is_terminal() {
                return Ok(state);
            }
            if cancel.is_cancelled() {
                return self.cancel(grace);
            }
            std::thread::sleep(poll_interval);
        }
    }
}

impl Drop for EncoderJob {
    fn drop(&mut self) {
        if self.state != JobState::Running {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(unix)]
fn terminate_gracefully(child: &mut Child) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to our
    // unreaped child so it cannot have been recycled.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(not(unix))]
fn terminate_gracefully(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

/// `timelapse_03_05_2024_14_07_09.mp4`
pub fn video_file_name(at: &NaiveDateTime, extension: &str) -> String {
    format!("{}.{}", at.format("timelapse_%m_%d_%Y_%H_%M_%S"), extension)
}

/// `<frame_dir>/frame_%06d.<ext>`
pub fn input_pattern(frame_dir: &Path, extension: &str) -> PathBuf {
    frame_dir.join(format!("frame_%06d.{extension}"))
}

#[derive(Clone, Debug)]
pub struct EncoderSettings {
    pub program: PathBuf,
    pub frame_dir: PathBuf,
    pub video_dir: PathBuf,
    pub frame_extension: String,
    pub video_codec: String,
    pub pixel_format: String,
    pub container: String,
    pub poll_interval: Duration,
    pub grace: Duration,
}

impl EncoderSettings {
    pub fn new(program: PathBuf, frame_dir: PathBuf, video_dir: PathBuf) -> Self {
        Self {
            program,
            frame_dir,
            video_dir,
            frame_extension: "jpg".to_string(),
            video_codec: "libx264".to_string(),
            pixel_format: "yuv420p".to_string(),
            container: "mp4".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace: DEFAULT_GRACE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    #[serde(flatten)]
    pub state: JobState,
    pub output: PathBuf,
    pub elapsed_ms: u64,
}

pub struct EncoderSupervisor {
    settings: EncoderSettings,
}

impl EncoderSupervisor {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn output_path(&self, at: &NaiveDateTime) -> PathBuf {
        self.settings
            .video_dir
            .join(video_file_name(at, &self.settings.container))
    }

    pub fn build_command(&self, request: &AssemblyRequest, output: &Path) -> EncoderCommand {
        let input = input_pattern(&self.settings.frame_dir, &self.settings.frame_extension);
        EncoderCommand::new(&self.settings.program)
            .arg("-framerate")
            .arg(request.framerate.to_string())
            .arg("-i")
            .arg(input)
            .arg("-c:v")
            .arg(&self.settings.video_codec)
            .arg("-preset")
            .arg(request.preset.as_str())
            .arg("-crf")
            .arg(request.quality.to_string())
            .arg("-pix_fmt")
            .arg(&self.settings.pixel_format)
            .arg(output)
    }

    /// Assemble the frame directory into a new timestamped video.
    pub fn assemble(
        &self,
        request: AssemblyRequest,
        cancel: &CancelToken,
    ) -> Result<JobOutcome, EncoderError> {
        std::fs::create_dir_all(&self.settings.video_dir).map_err(|source| {
            EncoderError::OutputDir {
                path: self.settings.video_dir.clone(),
                source,
            }
        })?;
        let output = self.output_path(&chrono::Local::now().naive_local());
        let command = self.build_command(&request, &output);
        log::info!(
            "encoder: assembling {} at {} fps (preset {}, crf {})",
            output.display(),
            request.framerate,
            request.preset.as_str(),
            request.quality
        );
        self.run(command, output, cancel)
    }

    /// Run an arbitrary command under supervision.
    pub fn run(
        &self,
        command: EncoderCommand,
        output: PathBuf,
        cancel: &CancelToken,
    ) -> Result<JobOutcome, EncoderError> {
        let started = Instant::now();
        let mut job = EncoderJob::new(command);
        let state = job.supervise(cancel, self.settings.poll_interval, self.settings.grace)?;
        match state {
            JobState::Succeeded => log::info!("encoder: wrote {}", output.display()),
            JobState::Cancelled => log::info!("encoder: cancelled"),
            other => log::error!("encoder: finished with {:?}", other),
        }
        Ok(JobOutcome {
            state,
            output,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}
