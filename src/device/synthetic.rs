//! Synthetic capture device (`stub://`) for tests and demos.
//!
//! Behaves like a request-based camera: a worker thread "exposes" for a fixed
//! delay, fills the request's buffer with a deterministic YUV420 pattern and
//! invokes the completion handler from its own thread. Knobs in
//! `SyntheticOptions` inject stalls and map failures; `SyntheticProbe` exposes
//! counters so tests can check the request discipline from outside.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{
    CaptureDevice, CompletedRequest, CompletionHandler, DeviceError, DeviceManager, RequestId,
    RequestStatus, StreamConfig, STUB_PREFIX,
};
use crate::frame::{FrameBufferPool, MappedFrame, PlaneLayout, SharedBuffer};

const MAX_WIDTH: u32 = 4056;
const MAX_HEIGHT: u32 = 3040;

#[derive(Clone, Debug)]
pub struct SyntheticOptions {
    /// Time between submit and completion.
    pub exposure: Duration,
    pub buffer_count: usize,
    /// Stop completing requests after this many frames (simulates a hung sensor).
    pub stall_after: Option<u64>,
    /// Device sequence numbers whose buffers fail to map.
    pub map_failures: Vec<u64>,
    pub fail_allocation: bool,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            exposure: Duration::from_millis(5),
            buffer_count: 4,
            stall_after: None,
            map_failures: Vec::new(),
            fail_allocation: false,
        }
    }
}

#[derive(Debug, Default)]
struct ProbeCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    rejected_submits: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
    buffers_freed: AtomicBool,
    released: AtomicBool,
    live_mappings: Mutex<Option<Arc<AtomicUsize>>>,
}

/// Read-only view of a synthetic device's counters.
#[derive(Clone, Debug, Default)]
pub struct SyntheticProbe {
    counters: Arc<ProbeCounters>,
}

impl SyntheticProbe {
    pub fn submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> u64 {
        self.counters.cancelled.load(Ordering::SeqCst)
    }

    /// Submits refused because the request was still in flight.
    pub fn rejected_submits(&self) -> u64 {
        self.counters.rejected_submits.load(Ordering::SeqCst)
    }

    pub fn was_started(&self) -> bool {
        self.counters.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.counters.stopped.load(Ordering::SeqCst)
    }

    pub fn buffers_freed(&self) -> bool {
        self.counters.buffers_freed.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// Unresolved requests: submitted but neither completed nor cancelled.
    pub fn unresolved(&self) -> u64 {
        self.submitted()
            .saturating_sub(self.completed() + self.cancelled())
    }

    pub fn live_mappings(&self) -> usize {
        self.counters
            .live_mappings
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|live| live.load(Ordering::SeqCst)))
            .unwrap_or(0)
    }
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

pub struct SyntheticDevice {
    id: String,
    options: SyntheticOptions,
    probe: SyntheticProbe,
    config: Option<StreamConfig>,
    pool: Option<FrameBufferPool>,
    /// Request index -> buffer index.
    requests: Vec<usize>,
    handler: Option<CompletionHandler>,
    worker: Option<Worker>,
    in_flight: Arc<AtomicBool>,
    last_sequence: Arc<AtomicU64>,
}

impl SyntheticDevice {
    pub fn new(id: &str, options: SyntheticOptions) -> Self {
        Self {
            id: id.to_string(),
            options,
            probe: SyntheticProbe::default(),
            config: None,
            pool: None,
            requests: Vec::new(),
            handler: None,
            worker: None,
            in_flight: Arc::new(AtomicBool::new(false)),
            last_sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn probe(&self) -> SyntheticProbe {
        self.probe.clone()
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
                log::error!("SyntheticDevice {}: worker thread panicked", self.id);
            }
        }
    }
}

impl CaptureDevice for SyntheticDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn configure(&mut self, requested: &StreamConfig) -> Result<StreamConfig, DeviceError> {
        if self.worker.is_some() {
            return Err(DeviceError::State("cannot configure while streaming".into()));
        }
        // Round to the nearest size the "sensor" supports.
        let width = requested.width.min(MAX_WIDTH) & !1;
        let height = requested.height.min(MAX_HEIGHT) & !1;
        if width == 0 || height == 0 {
            return Err(DeviceError::Configure(format!(
                "unsupported size {}x{}",
                requested.width, requested.height
            )));
        }
        let validated = StreamConfig {
            width,
            height,
            ..*requested
        };
        if validated != *requested {
            log::info!(
                "SyntheticDevice {}: adjusted {} to {}",
                self.id,
                requested,
                validated
            );
        }
        self.config = Some(validated);
        Ok(validated)
    }

    fn allocate_buffers(&mut self) -> Result<usize, DeviceError> {
        let config = self
            .config
            .ok_or_else(|| DeviceError::State("allocate before configure".into()))?;
        if self.options.fail_allocation {
            return Err(DeviceError::Allocation("synthetic allocation failure".into()));
        }
        let pool = FrameBufferPool::allocate(config.layout(), self.options.buffer_count)?;
        if let Ok(mut slot) = self.probe.counters.live_mappings.lock() {
            *slot = Some(pool.live_mappings());
        }
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
        let layout = self
            .pool
            .as_ref()
            .map(|pool| pool.layout())
            .ok_or_else(|| DeviceError::State("start before allocate".into()))?;
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| DeviceError::State("no completion handler registered".into()))?;

        let (tx, rx) = mpsc::channel();
        let ctx = WorkerContext {
            rx,
            handler,
            layout,
            exposure: self.options.exposure,
            stall_after: self.options.stall_after,
            probe: self.probe.clone(),
            in_flight: self.in_flight.clone(),
            last_sequence: self.last_sequence.clone(),
        };
        let join = std::thread::Builder::new()
            .name(format!("synthetic-{}", self.id.trim_start_matches(STUB_PREFIX)))
            .spawn(move || ctx.run())?;
        self.worker = Some(Worker { tx, join });
        self.probe.counters.started.store(true, Ordering::SeqCst);
        log::info!("SyntheticDevice {}: started", self.id);
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
            self.probe
                .counters
                .rejected_submits
                .fetch_add(1, Ordering::SeqCst);
            return Err(DeviceError::InvalidRequest(format!(
                "request {} already queued",
                request.0
            )));
        }
        self.probe.counters.submitted.fetch_add(1, Ordering::SeqCst);
        worker
            .tx
            .send(WorkerCommand::Capture { request, buffer })
            .map_err(|_| {
                self.in_flight.store(false, Ordering::SeqCst);
                DeviceError::State("worker exited".into())
            })
    }

    fn map_frame(&self, request: RequestId) -> Result<MappedFrame<'_>, DeviceError> {
        let buffer_index = self.buffer_for(request)?;
        if self.in_flight.load(Ordering::SeqCst) {
            return Err(DeviceError::Map(format!("request {} still in flight", request.0)));
        }
        let sequence = self.last_sequence.load(Ordering::SeqCst);
        if self.options.map_failures.contains(&sequence) {
            return Err(DeviceError::Map(format!(
                "synthetic map failure at sequence {sequence}"
            )));
        }
        self.pool
            .as_ref()
            .ok_or_else(|| DeviceError::State("buffers freed".into()))?
            .map(buffer_index)
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.shutdown_worker();
        self.probe.counters.stopped.store(true, Ordering::SeqCst);
        log::info!("SyntheticDevice {}: stopped", self.id);
        Ok(())
    }

    fn free_buffers(&mut self) {
        self.requests.clear();
        self.pool = None;
        self.probe
            .counters
            .buffers_freed
            .store(true, Ordering::SeqCst);
    }

    fn release(&mut self) {
        self.probe.counters.released.store(true, Ordering::SeqCst);
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

struct WorkerContext {
    rx: mpsc::Receiver<WorkerCommand>,
    handler: CompletionHandler,
    layout: PlaneLayout,
    exposure: Duration,
    stall_after: Option<u64>,
    probe: SyntheticProbe,
    in_flight: Arc<AtomicBool>,
    last_sequence: Arc<AtomicU64>,
}

impl WorkerContext {
    fn run(self) {
        let mut sequence = 0u64;
        while let Ok(WorkerCommand::Capture { request, buffer }) = self.rx.recv() {
            let stalled = self.stall_after.is_some_and(|limit| sequence >= limit);
            let stop_requested = if stalled {
                // A hung sensor never completes on its own; only stop resolves it.
                loop {
                    match self.rx.recv() {
                        Ok(WorkerCommand::Stop) | Err(_) => break true,
                        Ok(WorkerCommand::Capture { .. }) => continue,
                    }
                }
            } else {
                match self.rx.recv_timeout(self.exposure) {
                    Ok(WorkerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => true,
                    Ok(WorkerCommand::Capture { .. }) | Err(RecvTimeoutError::Timeout) => false,
                }
            };

            if stop_requested {
                self.in_flight.store(false, Ordering::SeqCst);
                self.probe.counters.cancelled.fetch_add(1, Ordering::SeqCst);
                (self.handler)(CompletedRequest {
                    request,
                    status: RequestStatus::Cancelled,
                    sequence,
                    bytes_used: 0,
                });
                return;
            }

            if let Ok(mut bytes) = buffer.lock() {
                fill_pattern(&mut bytes, self.layout, sequence);
            }
            self.last_sequence.store(sequence, Ordering::SeqCst);
            self.in_flight.store(false, Ordering::SeqCst);
            self.probe.counters.completed.fetch_add(1, Ordering::SeqCst);
            (self.handler)(CompletedRequest {
                request,
                status: RequestStatus::Complete,
                sequence,
                bytes_used: self.layout.frame_len(),
            });
            sequence += 1;
        }
    }
}

/// Deterministic test card: a luma ramp that drifts with the sequence number and
/// flat chroma planes.
fn fill_pattern(bytes: &mut [u8], layout: PlaneLayout, sequence: u64) {
    let width = layout.width as usize;
    let luma_len = layout.luma_len();
    let chroma_len = layout.chroma_len();
    if bytes.len() < layout.frame_len() {
        return;
    }
    let shift = sequence as usize;
    for (i, px) in bytes[..luma_len].iter_mut().enumerate() {
        let (row, col) = (i / width, i % width);
        *px = (row + col + shift) as u8;
    }
    bytes[luma_len..luma_len + chroma_len].fill(96u8.wrapping_add(sequence as u8));
    bytes[luma_len + chroma_len..luma_len + 2 * chroma_len].fill(160u8.wrapping_sub(sequence as u8));
}

/// Hands out synthetic devices built from fixed options; keeps the probe of the
/// most recently acquired device.
#[derive(Debug, Default)]
pub struct SyntheticDeviceManager {
    options: SyntheticOptions,
    last_probe: Mutex<Option<SyntheticProbe>>,
}

impl SyntheticDeviceManager {
    pub fn new(options: SyntheticOptions) -> Self {
        Self {
            options,
            last_probe: Mutex::new(None),
        }
    }

    pub fn last_probe(&self) -> Option<SyntheticProbe> {
        self.last_probe.lock().ok().and_then(|probe| probe.clone())
    }
}

impl DeviceManager for SyntheticDeviceManager {
    fn list_devices(&self) -> Vec<String> {
        vec![super::DEFAULT_STUB_DEVICE.to_string()]
    }

    fn acquire(&self, id: &str) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        if !id.starts_with(STUB_PREFIX) {
            return Err(DeviceError::NotFound(id.to_string()));
        }
        let device = SyntheticDevice::new(id, self.options.clone());
        if let Ok(mut slot) = self.last_probe.lock() {
            *slot = Some(device.probe());
        }
        Ok(Box::new(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{CompletionBridge, Wakeup};

    fn started_device(
        options: SyntheticOptions,
    ) -> anyhow::Result<(SyntheticDevice, Arc<CompletionBridge<CompletedRequest>>, RequestId)> {
        let mut device = SyntheticDevice::new("stub://unit", options);
        device.configure(&StreamConfig::yuv420(8, 4))?;
        device.allocate_buffers()?;
        let request = device.create_request(0)?;
        let bridge = Arc::new(CompletionBridge::new());
        let sink = bridge.clone();
        device.on_complete(Arc::new(move |done: CompletedRequest| {
            sink.signal_complete(done)
        }));
        device.start()?;
        Ok((device, bridge, request))
    }

    #[test]
    fn completes_submitted_request_from_worker_thread() -> anyhow::Result<()> {
        let (mut device, bridge, request) = started_device(SyntheticOptions::default())?;
        device.submit(request)?;
        match bridge.wait_for_complete_timeout(Duration::from_secs(2)) {
            Wakeup::Completed(done) => {
                assert_eq!(done.request, request);
                assert_eq!(done.status, RequestStatus::Complete);
                assert_eq!(done.sequence, 0);
            }
            other => panic!("unexpected wakeup {other:?}"),
        }
        let mapped = device.map_frame(request)?;
        let frame = mapped.raw_frame();
        assert_eq!(frame.y[1], 1);
        assert_eq!(frame.u[0], 96);
        assert_eq!(frame.v[0], 160);
        drop(mapped);
        device.stop()?;
        Ok(())
    }

    #[test]
    fn second_submit_while_in_flight_is_rejected() -> anyhow::Result<()> {
        let options = SyntheticOptions {
            exposure: Duration::from_millis(200),
            ..SyntheticOptions::default()
        };
        let (mut device, _bridge, request) = started_device(options)?;
        device.submit(request)?;
        assert!(matches!(
            device.submit(request),
            Err(DeviceError::InvalidRequest(_))
        ));
        assert_eq!(device.probe().rejected_submits(), 1);
        device.stop()?;
        Ok(())
    }

    #[test]
    fn stop_cancels_stalled_request() -> anyhow::Result<()> {
        let options = SyntheticOptions {
            stall_after: Some(0),
            ..SyntheticOptions::default()
        };
        let (mut device, bridge, request) = started_device(options)?;
        let probe = device.probe();
        device.submit(request)?;
        assert_eq!(
            bridge.wait_for_complete_timeout(Duration::from_millis(50)),
            Wakeup::TimedOut
        );
        device.stop()?;
        match bridge.wait_for_complete_timeout(Duration::from_secs(1)) {
            Wakeup::Completed(done) => assert_eq!(done.status, RequestStatus::Cancelled),
            other => panic!("unexpected wakeup {other:?}"),
        }
        assert_eq!(probe.unresolved(), 0);
        Ok(())
    }

    #[test]
    fn configure_rounds_odd_sizes_and_rejects_zero() {
        let mut device = SyntheticDevice::new("stub://unit", SyntheticOptions::default());
        let validated = device
            .configure(&StreamConfig::yuv420(641, 481))
            .expect("configure");
        assert_eq!((validated.width, validated.height), (640, 480));
        assert!(matches!(
            device.configure(&StreamConfig::yuv420(0, 480)),
            Err(DeviceError::Configure(_))
        ));
    }
}
