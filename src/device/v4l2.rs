//! V4L2 capture device.
//!
//! Maps the request/complete model onto a libv4l mmap stream. A worker thread
//! owns the stream; each submitted request pulls one frame, copies it into the
//! request's buffer and reports completion from the worker thread.
//!
//! The device is asked for `YU12` (planar YUV420). Drivers that cannot deliver it,
//! or that settle on an odd frame size, fail at `configure` before any capture
//! starts. Padded rows are packed while copying into the request buffer.

use anyhow::Context;
use ouroboros::self_referencing;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{
    CaptureDevice, CompletedRequest, CompletionHandler, DeviceError, RequestId, RequestStatus,
    StreamConfig,
};
use crate::frame::{FrameBufferPool, MappedFrame, PlaneLayout, SharedBuffer};

const STREAM_BUFFERS: u32 = 4;
const POOL_BUFFERS: usize = 1;
/// Upper bound on one dequeue, so a silent sensor cannot pin the worker past a stop.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// Device nodes visible to libv4l.
pub fn list_device_nodes() -> Vec<String> {
    v4l::context::enum_devices()
        .into_iter()
        .map(|node| node.path().display().to_string())
        .collect()
}

#[self_referencing]
struct StreamState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this>,
}

enum WorkerCommand {
    Capture {
        request: RequestId,
        buffer: SharedBuffer,
    },
    Stop,
}

struct Worker {
    tx: mpsc::Sender<WorkerCommand>,
    join: JoinHandle<()>,
}

pub struct V4l2Device {
    path: String,
    config: Option<StreamConfig>,
    stride: u32,
    pool: Option<FrameBufferPool>,
    requests: Vec<usize>,
    handler: Option<CompletionHandler>,
    worker: Option<Worker>,
    in_flight: Arc<AtomicBool>,
}

impl V4l2Device {
    pub fn open(path: &str) -> Result<Self, DeviceError> {
        // Probe once so a missing node is reported at acquire time.
        v4l::Device::with_path(path)
            .map_err(|err| DeviceError::NotFound(format!("{path}: {err}")))?;
        Ok(Self {
            path: path.to_string(),
            config: None,
            stride: 0,
            pool: None,
            requests: Vec::new(),
            handler: None,
            worker: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    fn buffer_for(&self, request: RequestId) -> Result<usize, DeviceError> {
        self.requests
            .get(request.0)
            .copied()
            .ok_or_else(|| DeviceError::InvalidRequest(format!("unknown request {}", request.0)))
    }

    fn shutdown_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.tx.send(WorkerCommand::Stop);
            if worker.join.join().is_err() {
                log::error!("V4l2Device {}: worker thread panicked", self.path);
            }
        }
    }
}

/// Check the format a driver settled on. Returns the luma row stride in bytes.
fn check_applied(
    path: &str,
    requested: &StreamConfig,
    width: u32,
    height: u32,
    stride: u32,
    fourcc: [u8; 4],
) -> Result<u32, DeviceError> {
    if fourcc != requested.format.fourcc() {
        return Err(DeviceError::Configure(format!(
            "{path} does not support {}",
            String::from_utf8_lossy(&requested.format.fourcc())
        )));
    }
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        return Err(DeviceError::Configure(format!(
            "{path} applied {width}x{height}, YUV420 needs an even frame size"
        )));
    }
    match stride {
        0 => Ok(width),
        stride if stride >= width && stride % 2 == 0 => Ok(stride),
        stride => Err(DeviceError::Configure(format!(
            "{path} reported row stride {stride} for width {width}"
        ))),
    }
}

fn open_stream(path: &str, config: &StreamConfig) -> anyhow::Result<(StreamState, u32)> {
    use v4l::buffer::Type;
    use v4l::video::Capture;

    let mut device =
        v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {path}"))?;
    let mut format = device.format().context("read v4l2 format")?;
    format.width = config.width;
    format.height = config.height;
    format.fourcc = v4l::FourCC::new(&config.format.fourcc());
    let applied = device.set_format(&format).context("set v4l2 format")?;
    if applied.width != config.width || applied.height != config.height {
        anyhow::bail!(
            "{path} changed format to {}x{} after configure",
            applied.width,
            applied.height
        );
    }
    let stride = check_applied(
        path,
        config,
        applied.width,
        applied.height,
        applied.stride,
        applied.fourcc.repr,
    )?;

    let state = StreamStateBuilder {
        device,
        stream_builder: |device| {
            let mut stream =
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))?;
            stream.set_timeout(DEQUEUE_TIMEOUT);
            Ok::<_, anyhow::Error>(stream)
        },
    }
    .try_build()?;
    Ok((state, stride))
}

impl CaptureDevice for V4l2Device {
    fn id(&self) -> &str {
        &self.path
    }

    fn configure(&mut self, requested: &StreamConfig) -> Result<StreamConfig, DeviceError> {
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.path)?;
        let mut format = device.format()?;
        format.width = requested.width;
        format.height = requested.height;
        format.fourcc = v4l::FourCC::new(&requested.format.fourcc());
        let applied = device.set_format(&format)?;
        let stride = check_applied(
            &self.path,
            requested,
            applied.width,
            applied.height,
            applied.stride,
            applied.fourcc.repr,
        )?;
        let validated = StreamConfig {
            width: applied.width,
            height: applied.height,
            ..*requested
        };
        log::info!(
            "V4l2Device {}: configured {} (stride {})",
            self.path,
            validated,
            stride
        );
        self.config = Some(validated);
        self.stride = stride;
        Ok(validated)
    }

    fn allocate_buffers(&mut self) -> Result<usize, DeviceError> {
        let config = self
            .config
            .ok_or_else(|| DeviceError::State("allocate before configure".into()))?;
        let pool = FrameBufferPool::allocate(config.layout(), POOL_BUFFERS)?;
        let count = pool.len();
        self.pool = Some(pool);
        Ok(count)
    }

    fn create_request(&mut self, buffer: usize) -> Result<RequestId, DeviceError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| DeviceError::State("no buffers allocated".into()))?;
        if buffer >= pool.len() {
            return Err(DeviceError::InvalidRequest(format!(
                "buffer {buffer} out of range"
            )));
        }
        self.requests.push(buffer);
        Ok(RequestId(self.requests.len() - 1))
    }

    fn on_complete(&mut self, handler: CompletionHandler) {
        self.handler = Some(handler);
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        if self.worker.is_some() {
            return Err(DeviceError::State("already started".into()));
        }
        let config = self
            .config
            .ok_or_else(|| DeviceError::State("start before configure".into()))?;
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| DeviceError::State("no completion handler registered".into()))?;

        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let path = self.path.clone();
        let in_flight = self.in_flight.clone();
        let join = std::thread::Builder::new()
            .name("v4l2-capture".into())
            .spawn(move || {
                let (state, stride) = match open_stream(&path, &config) {
                    Ok(opened) => {
                        let _ = ready_tx.send(Ok(()));
                        opened
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(format!("{err:#}")));
                        return;
                    }
                };
                run_worker(state, rx, handler, config.layout(), stride, in_flight);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = join.join();
                return Err(DeviceError::Configure(err));
            }
            Err(_) => {
                let _ = join.join();
                return Err(DeviceError::State("capture worker exited".into()));
            }
        }
        self.worker = Some(Worker { tx, join });
        log::info!("V4l2Device {}: streaming", self.path);
        Ok(())
    }

    fn submit(&mut self, request: RequestId) -> Result<(), DeviceError> {
        let buffer_index = self.buffer_for(request)?;
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| DeviceError::State("device not started".into()))?;
        let buffer = self
            .pool
            .as_ref()
            .and_then(|pool| pool.buffer(buffer_index))
            .ok_or_else(|| DeviceError::State("buffers freed".into()))?;
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DeviceError::InvalidRequest(format!(
                "request {} already queued",
                request.0
            )));
        }
        worker
            .tx
            .send(WorkerCommand::Capture { request, buffer })
            .map_err(|_| {
                self.in_flight.store(false, Ordering::SeqCst);
                DeviceError::State("capture worker exited".into())
            })
    }

    fn map_frame(&self, request: RequestId) -> Result<MappedFrame<'_>, DeviceError> {
        let buffer_index = self.buffer_for(request)?;
        if self.in_flight.load(Ordering::SeqCst) {
            return Err(DeviceError::Map(format!("request {} still in flight", request.0)));
        }
        self.pool
            .as_ref()
            .ok_or_else(|| DeviceError::State("buffers freed".into()))?
            .map(buffer_index)
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.shutdown_worker();
        log::info!("V4l2Device {}: stopped", self.path);
        Ok(())
    }

    fn free_buffers(&mut self) {
        self.requests.clear();
        self.pool = None;
    }

    fn release(&mut self) {
        self.config = None;
        self.handler = None;
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

fn stop_requested(rx: &mpsc::Receiver<WorkerCommand>) -> bool {
    // Submits are refused while a request is in flight, so only Stop can be queued here.
    matches!(
        rx.try_recv(),
        Ok(WorkerCommand::Stop) | Err(TryRecvError::Disconnected)
    )
}

fn cancelled(request: RequestId) -> CompletedRequest {
    CompletedRequest {
        request,
        status: RequestStatus::Cancelled,
        sequence: 0,
        bytes_used: 0,
    }
}

fn run_worker(
    mut state: StreamState,
    rx: mpsc::Receiver<WorkerCommand>,
    handler: CompletionHandler,
    layout: PlaneLayout,
    stride: u32,
    in_flight: Arc<AtomicBool>,
) {
    use v4l::io::traits::CaptureStream;

    while let Ok(WorkerCommand::Capture { request, buffer }) = rx.recv() {
        let captured = loop {
            if stop_requested(&rx) {
                in_flight.store(false, Ordering::SeqCst);
                handler(cancelled(request));
                return;
            }
            let attempt = state.with_mut(|fields| match fields.stream.next() {
                Ok((bytes, meta)) => {
                    let used = (meta.bytesused as usize).min(bytes.len());
                    Some(
                        copy_frame(&bytes[..used], &buffer, layout, stride)
                            .map(|_| (meta.sequence as u64, layout.frame_len())),
                    )
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => None,
                Err(err) => Some(Err(err.to_string())),
            });
            if let Some(result) = attempt {
                break result;
            }
        };

        // A stop that raced the capture turns the result into a cancellation.
        let stop_pending = stop_requested(&rx);
        in_flight.store(false, Ordering::SeqCst);
        let done = match captured {
            Ok((sequence, used)) if !stop_pending => CompletedRequest {
                request,
                status: RequestStatus::Complete,
                sequence,
                bytes_used: used,
            },
            Ok(_) => cancelled(request),
            Err(err) => {
                log::warn!("V4l2Device: capture failed: {}", err);
                cancelled(request)
            }
        };
        handler(done);
        if stop_pending {
            return;
        }
    }
}

/// Pack a driver frame whose rows may be padded to `stride` bytes.
///
/// `YU12` chroma rows use half the luma stride.
fn copy_frame(
    src: &[u8],
    buffer: &SharedBuffer,
    layout: PlaneLayout,
    stride: u32,
) -> Result<(), String> {
    let mut dst = buffer.lock().map_err(|_| "buffer poisoned".to_string())?;
    pack_planes(src, &mut dst[..], layout, stride as usize)
}

fn pack_planes(src: &[u8], dst: &mut [u8], layout: PlaneLayout, stride: usize) -> Result<(), String> {
    let chroma_stride = stride / 2;
    let luma_rows = layout.height as usize;
    let chroma_rows = layout.chroma_height();
    let needed = stride * luma_rows + 2 * chroma_stride * chroma_rows;
    if src.len() < needed {
        return Err(format!("short frame: {} bytes, expected {}", src.len(), needed));
    }
    if dst.len() < layout.frame_len() {
        return Err(format!(
            "buffer holds {} bytes, frame needs {}",
            dst.len(),
            layout.frame_len()
        ));
    }

    let planes = [
        (0, stride, layout.width as usize, luma_rows),
        (
            stride * luma_rows,
            chroma_stride,
            layout.chroma_width(),
            chroma_rows,
        ),
        (
            stride * luma_rows + chroma_stride * chroma_rows,
            chroma_stride,
            layout.chroma_width(),
            chroma_rows,
        ),
    ];
    let mut out = 0;
    for (start, row_stride, row_len, rows) in planes {
        for row in 0..rows {
            let from = start + row * row_stride;
            dst[out..out + row_len].copy_from_slice(&src[from..from + row_len]);
            out += row_len;
        }
    }
    Ok(())
}
