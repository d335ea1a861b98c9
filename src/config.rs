use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{CaptureSettings, DEFAULT_GRACE, DEFAULT_HEIGHT, DEFAULT_INTERVAL, DEFAULT_WIDTH};
use crate::control::ControlSettings;
use crate::device::DeviceManager;
use crate::encoder::{self, EncoderSettings};
use crate::transcode::DEFAULT_JPEG_QUALITY;

const DEFAULT_API_ADDR: &str = crate::api::DEFAULT_API_ADDR;
const DEFAULT_ENCODER: &str = "ffmpeg";
const DEFAULT_EXPOSURE_MS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct TimelapseConfigFile {
    frame_dir: Option<PathBuf>,
    video_dir: Option<PathBuf>,
    api: Option<ApiConfigFile>,
    capture: Option<CaptureConfigFile>,
    encoder: Option<EncoderConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    interval_ms: Option<u64>,
    grace_ms: Option<u64>,
    jpeg_quality: Option<u8>,
    exposure_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct EncoderConfigFile {
    program: Option<PathBuf>,
    poll_ms: Option<u64>,
    grace_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TimelapseConfig {
    pub frame_dir: PathBuf,
    pub video_dir: PathBuf,
    pub api_addr: String,
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// `None` selects the first device the manager lists.
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub interval: Duration,
    pub grace: Duration,
    pub jpeg_quality: u8,
    /// Exposure delay of the synthetic `stub://` device.
    pub exposure: Duration,
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub program: PathBuf,
    pub poll_interval: Duration,
    pub grace: Duration,
}

impl TimelapseConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TIMELAPSE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut builder = PartialConfig::from_file(file_cfg.unwrap_or_default());
        builder.apply_env()?;
        builder.finish()
    }

    /// Capture settings for `device`.
    pub fn capture_settings(&self, device: String) -> CaptureSettings {
        CaptureSettings {
            device,
            width: self.capture.width,
            height: self.capture.height,
            frame_dir: self.frame_dir.clone(),
            jpeg_quality: self.capture.jpeg_quality,
            grace: self.capture.grace,
        }
    }

    pub fn encoder_settings(&self) -> EncoderSettings {
        let mut settings = EncoderSettings::new(
            self.encoder.program.clone(),
            self.frame_dir.clone(),
            self.video_dir.clone(),
        );
        settings.poll_interval = self.encoder.poll_interval;
        settings.grace = self.encoder.grace;
        settings
    }

    pub fn control_settings(&self, device: String) -> ControlSettings {
        ControlSettings {
            capture: self.capture_settings(device),
            default_interval: self.capture.interval,
            encoder: self.encoder_settings(),
        }
    }

    /// Configured device, or the first one `devices` lists.
    pub fn resolve_device(&self, devices: &dyn DeviceManager) -> Result<String> {
        if let Some(device) = &self.capture.device {
            return Ok(device.clone());
        }
        devices
            .list_devices()
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no capture devices found"))
    }
}

struct PartialConfig {
    frame_dir: Option<PathBuf>,
    video_dir: Option<PathBuf>,
    api_addr: String,
    capture: CaptureConfig,
    encoder: EncoderConfig,
}

impl PartialConfig {
    fn from_file(file: TimelapseConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let encoder_file = file.encoder.unwrap_or_default();
        Self {
            frame_dir: file.frame_dir,
            video_dir: file.video_dir,
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            capture: CaptureConfig {
                device: capture.device,
                width: capture.width.unwrap_or(DEFAULT_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_HEIGHT),
                interval: capture
                    .interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_INTERVAL),
                grace: capture
                    .grace_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_GRACE),
                jpeg_quality: capture.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                exposure: Duration::from_millis(capture.exposure_ms.unwrap_or(DEFAULT_EXPOSURE_MS)),
            },
            encoder: EncoderConfig {
                program: encoder_file
                    .program
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_ENCODER)),
                poll_interval: encoder_file
                    .poll_ms
                    .map(Duration::from_millis)
                    .unwrap_or(encoder::DEFAULT_POLL_INTERVAL),
                grace: encoder_file
                    .grace_ms
                    .map(Duration::from_millis)
                    .unwrap_or(encoder::DEFAULT_GRACE),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = non_empty_env("CAM_FRAME_PATH") {
            self.frame_dir = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env("CAM_VIDEO_PATH") {
            self.video_dir = Some(PathBuf::from(path));
        }
        if let Some(addr) = non_empty_env("TIMELAPSE_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(device) = non_empty_env("TIMELAPSE_DEVICE") {
            self.capture.device = Some(device);
        }
        if let Some(program) = non_empty_env("TIMELAPSE_ENCODER") {
            self.encoder.program = PathBuf::from(program);
        }
        if let Some(interval) = non_empty_env("TIMELAPSE_INTERVAL_MS") {
            let ms: u64 = interval.parse().map_err(|_| {
                anyhow!("TIMELAPSE_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.capture.interval = Duration::from_millis(ms);
        }
        if let Some(quality) = non_empty_env("TIMELAPSE_JPEG_QUALITY") {
            self.capture.jpeg_quality = quality
                .parse()
                .map_err(|_| anyhow!("TIMELAPSE_JPEG_QUALITY must be an integer in 1..=100"))?;
        }
        Ok(())
    }

    fn finish(self) -> Result<TimelapseConfig> {
        let frame_dir = self
            .frame_dir
            .ok_or_else(|| anyhow!("frame directory not configured (set CAM_FRAME_PATH)"))?;
        let video_dir = self
            .video_dir
            .ok_or_else(|| anyhow!("video directory not configured (set CAM_VIDEO_PATH)"))?;
        let cfg = TimelapseConfig {
            frame_dir,
            video_dir,
            api_addr: self.api_addr,
            capture: self.capture,
            encoder: self.encoder,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl TimelapseConfig {
    fn validate(&self) -> Result<()> {
        if self.capture.interval.is_zero() {
            return Err(anyhow!("capture interval must be greater than zero"));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(anyhow!(
                "jpeg quality must be in 1..=100, got {}",
                self.capture.jpeg_quality
            ));
        }
        for (name, value) in [("width", self.capture.width), ("height", self.capture.height)] {
            if value == 0 || value % 2 != 0 {
                return Err(anyhow!("capture {name} must be even and non-zero, got {value}"));
            }
        }
        if self.encoder.poll_interval.is_zero() {
            return Err(anyhow!("encoder poll interval must be greater than zero"));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<TimelapseConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let cfg = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file {}", path.display()))?;
    Ok(cfg)
}
