//! Timelapse capture kernel
//!
//! Captures still frames from a camera at a fixed cadence, writes them as
//! numbered JPEG files, and assembles a frame directory into a video with an
//! external encoder.
//!
//! # Module Structure
//!
//! - `device`: capture device seam (`CaptureDevice`, `DeviceManager`), the
//!   synthetic `stub://` backend and the optional V4L2 backend
//! - `frame`: plane layout, buffer pool and scoped frame mappings
//! - `bridge`: hand-off of device completions to the scheduler thread
//! - `capture`: the paced capture loop (`CaptureScheduler`, `CaptureSession`)
//! - `transcode` / `codec`: YUV420 planes to encoded image files
//! - `encoder`: external encoder process supervision
//! - `control` / `api`: single-capture, single-assembly control plane and its HTTP surface
//! - `config`: file + environment configuration

pub mod api;
pub mod bridge;
pub mod cancel;
pub mod capture;
pub mod codec;
pub mod config;
pub mod control;
pub mod device;
pub mod encoder;
pub mod frame;
pub mod storage;
pub mod transcode;

pub use bridge::{CompletionBridge, Wakeup};
pub use cancel::CancelToken;
pub use capture::{
    CaptureError, CapturePlan, CaptureProgress, CaptureReport, CaptureScheduler, CaptureSession,
    CaptureSettings, SessionStopper,
};
pub use codec::{ColorSpace, ImageCodec, JpegCodec};
pub use control::{ControlError, ControlSettings, Controller, ControllerStatus};
pub use device::{
    CaptureDevice, CompletedRequest, DeviceError, DeviceManager, StreamConfig,
    SystemDeviceManager,
};
pub use encoder::{
    AssemblyRequest, EncoderError, EncoderJob, EncoderSettings, EncoderSupervisor, JobOutcome,
    JobState,
};
pub use frame::{PlaneLayout, RawFrame};
pub use transcode::{FrameError, Transcoder};
