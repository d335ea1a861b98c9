//! Imaging device capability.
//!
//! The scheduler drives a device through `CaptureDevice`:
//! configure → allocate → create request → start → submit/complete … → stop →
//! free → release. Completions arrive on a thread the device owns, through the
//! handler registered with `on_complete`.
//!
//! Backends:
//! - `stub://<name>`: synthetic device (always available)
//! - anything else: V4L2 device node (feature: capture-v4l2)

pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

use std::sync::Arc;
use std::time::Duration;

use crate::frame::{MappedFrame, PlaneLayout};

pub use synthetic::{SyntheticDevice, SyntheticDeviceManager, SyntheticOptions, SyntheticProbe};

pub const STUB_PREFIX: &str = "stub://";
pub const DEFAULT_STUB_DEVICE: &str = "stub://camera0";

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no capture device found: {0}")]
    NotFound(String),
    #[error("device {0} is busy")]
    Busy(String),
    #[error("configure failed: {0}")]
    Configure(String),
    #[error("buffer allocation failed: {0}")]
    Allocation(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("frame map failed: {0}")]
    Map(String),
    #[error("device state: {0}")]
    State(String),
    #[error("device i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Three planes: Y, then U and V at half resolution in both axes.
    Yuv420,
}

impl PixelFormat {
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Yuv420 => *b"YU12",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamRole {
    Viewfinder,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub role: StreamRole,
}

impl StreamConfig {
    pub fn yuv420(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Yuv420,
            role: StreamRole::Viewfinder,
        }
    }

    pub fn layout(&self) -> PlaneLayout {
        PlaneLayout::new(self.width, self.height)
    }
}

impl std::fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}-{}",
            self.width,
            self.height,
            String::from_utf8_lossy(&self.format.fourcc())
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Complete,
    Cancelled,
}

/// Event the device delivers when a request finishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletedRequest {
    pub request: RequestId,
    pub status: RequestStatus,
    /// Device-side frame counter. Informational; file naming uses the session index.
    pub sequence: u64,
    pub bytes_used: usize,
}

pub type CompletionHandler = Arc<dyn Fn(CompletedRequest) + Send + Sync>;

pub trait CaptureDevice: Send {
    fn id(&self) -> &str;

    /// Apply the requested stream configuration. Returns the validated
    /// configuration, which may differ from the request.
    fn configure(&mut self, requested: &StreamConfig) -> Result<StreamConfig, DeviceError>;

    /// Allocate buffers for the configured stream. Returns how many were allocated.
    fn allocate_buffers(&mut self) -> Result<usize, DeviceError>;

    /// Bind a request to buffer `buffer`.
    fn create_request(&mut self, buffer: usize) -> Result<RequestId, DeviceError>;

    /// Register the completion handler. Called from the device's own thread.
    fn on_complete(&mut self, handler: CompletionHandler);

    fn start(&mut self) -> Result<(), DeviceError>;

    /// Queue a request. Reusing a completed request re-queues its buffer.
    fn submit(&mut self, request: RequestId) -> Result<(), DeviceError>;

    /// Map the buffer of a completed request read-only.
    fn map_frame(&self, request: RequestId) -> Result<MappedFrame<'_>, DeviceError>;

    /// Stop streaming. Any in-flight request completes with `RequestStatus::Cancelled`.
    fn stop(&mut self) -> Result<(), DeviceError>;

    fn free_buffers(&mut self);

    /// Give up exclusive ownership of the device.
    fn release(&mut self);
}

pub trait DeviceManager: Send + Sync {
    fn list_devices(&self) -> Vec<String>;

    /// Take exclusive ownership of device `id`.
    fn acquire(&self, id: &str) -> Result<Box<dyn CaptureDevice>, DeviceError>;
}

/// Routes `stub://` ids to the synthetic backend and everything else to V4L2.
#[derive(Clone, Debug)]
pub struct SystemDeviceManager {
    exposure: Duration,
}

impl SystemDeviceManager {
    pub fn new(exposure: Duration) -> Self {
        Self { exposure }
    }
}

impl Default for SystemDeviceManager {
    fn default() -> Self {
        Self::new(SyntheticOptions::default().exposure)
    }
}

impl DeviceManager for SystemDeviceManager {
    fn list_devices(&self) -> Vec<String> {
        #[allow(unused_mut)]
        let mut devices = Vec::new();
        #[cfg(feature = "capture-v4l2")]
        devices.extend(v4l2::list_device_nodes());
        devices.push(DEFAULT_STUB_DEVICE.to_string());
        devices
    }

    fn acquire(&self, id: &str) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        if id.starts_with(STUB_PREFIX) {
            let options = SyntheticOptions {
                exposure: self.exposure,
                ..SyntheticOptions::default()
            };
            return Ok(Box::new(SyntheticDevice::new(id, options)));
        }
        #[cfg(feature = "capture-v4l2")]
        {
            Ok(Box::new(v4l2::V4l2Device::open(id)?))
        }
        #[cfg(not(feature = "capture-v4l2"))]
        {
            Err(DeviceError::NotFound(format!(
                "{id} (built without the capture-v4l2 feature)"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_manager_lists_stub_device() {
        let manager = SystemDeviceManager::default();
        assert!(manager
            .list_devices()
            .contains(&DEFAULT_STUB_DEVICE.to_string()));
    }

    #[test]
    fn system_manager_acquires_stub() -> anyhow::Result<()> {
        let manager = SystemDeviceManager::default();
        let device = manager.acquire("stub://test")?;
        assert_eq!(device.id(), "stub://test");
        Ok(())
    }

    #[cfg(not(feature = "capture-v4l2"))]
    #[test]
    fn non_stub_device_is_not_found_without_v4l2() {
        let manager = SystemDeviceManager::default();
        assert!(matches!(
            manager.acquire("/dev/video0"),
            Err(DeviceError::NotFound(_))
        ));
    }

    #[test]
    fn stream_config_display_names_fourcc() {
        assert_eq!(StreamConfig::yuv420(1920, 1080).to_string(), "1920x1080-YU12");
    }
}
