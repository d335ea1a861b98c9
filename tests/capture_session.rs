use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use timelapse_kernel::capture::CaptureError;
use timelapse_kernel::device::{SyntheticDeviceManager, SyntheticOptions, DEFAULT_STUB_DEVICE};
use timelapse_kernel::{
    CapturePlan, CaptureScheduler, CaptureSession, CaptureSettings, JpegCodec,
    SystemDeviceManager,
};

fn settings(frame_dir: &Path) -> CaptureSettings {
    CaptureSettings {
        device: DEFAULT_STUB_DEVICE.to_string(),
        width: 64,
        height: 48,
        frame_dir: frame_dir.to_path_buf(),
        jpeg_quality: 85,
        grace: Duration::from_millis(300),
    }
}

fn fast_options() -> SyntheticOptions {
    SyntheticOptions {
        exposure: Duration::from_millis(2),
        ..SyntheticOptions::default()
    }
}

fn scheduler(manager: &Arc<SyntheticDeviceManager>, frame_dir: &Path) -> CaptureScheduler {
    CaptureScheduler::new(manager.clone(), Arc::new(JpegCodec), settings(frame_dir))
}

fn frame_names(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

#[test]
fn full_run_writes_every_planned_frame() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let frames = dir.path().join("frames");
    let manager = Arc::new(SyntheticDeviceManager::new(fast_options()));
    let plan = CapturePlan::with_duration(Duration::from_millis(1200), Duration::from_millis(10));
    assert_eq!(plan.total_frames, 120);

    let session = CaptureSession::new(plan);
    let report = scheduler(&manager, &frames).run(&session)?;

    assert!(!report.cancelled);
    assert_eq!(report.frames_planned, 120);
    assert_eq!(report.frames_attempted, 120);
    assert_eq!(report.frames_written, 120);
    assert_eq!(report.frames_failed, 0);

    let expected: Vec<String> = (0..120).map(|i| format!("frame_{i:06}.jpg")).collect();
    assert_eq!(frame_names(&frames)?, expected);

    let probe = manager.last_probe().expect("device acquired");
    assert_eq!(probe.submitted(), 120);
    assert_eq!(probe.rejected_submits(), 0);
    assert_eq!(probe.unresolved(), 0);
    assert!(probe.is_stopped());
    assert!(probe.buffers_freed());
    assert!(probe.is_released());
    assert_eq!(probe.live_mappings(), 0);
    Ok(())
}

#[test]
fn cadence_does_not_drift() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = Arc::new(SyntheticDeviceManager::new(fast_options()));
    let plan = CapturePlan::with_duration(Duration::from_millis(1000), Duration::from_millis(50));
    let session = CaptureSession::new(plan);
    let report = scheduler(&manager, dir.path()).run(&session)?;

    assert_eq!(report.frames_written, 20);
    // Processing time is absorbed by the interval sleep, not added to it.
    assert!(report.elapsed >= Duration::from_millis(950), "{:?}", report.elapsed);
    assert!(report.elapsed < Duration::from_millis(2500), "{:?}", report.elapsed);
    Ok(())
}

#[test]
fn stop_is_bounded_and_resolves_every_request() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let frames = dir.path().to_path_buf();
    let options = SyntheticOptions {
        exposure: Duration::from_millis(20),
        ..SyntheticOptions::default()
    };
    let manager = Arc::new(SyntheticDeviceManager::new(options));
    let plan = CapturePlan::with_duration(Duration::from_secs(60), Duration::from_millis(50));
    let session = Arc::new(CaptureSession::new(plan));
    let stopper = session.stopper();

    let worker = {
        let scheduler = scheduler(&manager, &frames);
        let session = session.clone();
        std::thread::spawn(move || scheduler.run(&session))
    };

    std::thread::sleep(Duration::from_millis(400));
    let stop_requested = Instant::now();
    stopper.stop();
    let report = worker.join().expect("capture thread")?;
    let stop_cost = stop_requested.elapsed();

    // One interval plus one grace period, with slack for slow machines.
    assert!(stop_cost < Duration::from_millis(50 + 300 + 700), "{stop_cost:?}");
    assert!(report.cancelled);
    assert!(report.frames_written > 0);
    assert!(report.frames_written < report.frames_planned);

    let written = report.frames_written as usize;
    let expected: Vec<String> = (0..written).map(|i| format!("frame_{i:06}.jpg")).collect();
    assert_eq!(frame_names(&frames)?, expected);

    let probe = manager.last_probe().expect("device acquired");
    assert_eq!(probe.unresolved(), 0);
    assert!(probe.is_stopped());
    assert!(probe.buffers_freed());
    assert!(probe.is_released());
    Ok(())
}

#[test]
fn stop_before_run_captures_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = Arc::new(SyntheticDeviceManager::new(fast_options()));
    let session = CaptureSession::new(CapturePlan::new(1, 500, Duration::from_millis(300)));
    session.stopper().stop();

    let report = scheduler(&manager, dir.path()).run(&session)?;
    assert!(report.cancelled);
    assert_eq!(report.frames_attempted, 0);
    assert_eq!(report.frames_written, 0);
    assert!(frame_names(dir.path())?.is_empty());
    Ok(())
}

#[test]
fn stalled_device_fails_the_session() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = SyntheticOptions {
        stall_after: Some(3),
        ..fast_options()
    };
    let manager = Arc::new(SyntheticDeviceManager::new(options));
    let plan = CapturePlan::with_duration(Duration::from_secs(10), Duration::from_millis(20));
    let session = CaptureSession::new(plan);

    let result = scheduler(&manager, dir.path()).run(&session);
    assert!(
        matches!(result, Err(CaptureError::Stalled { sequence: 3, .. })),
        "{result:?}"
    );
    assert_eq!(
        frame_names(dir.path())?,
        vec!["frame_000000.jpg", "frame_000001.jpg", "frame_000002.jpg"]
    );

    let probe = manager.last_probe().expect("device acquired");
    assert_eq!(probe.unresolved(), 0);
    assert!(probe.is_stopped());
    assert!(probe.is_released());
    Ok(())
}

#[test]
fn unmappable_frame_is_skipped() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = SyntheticOptions {
        map_failures: vec![5],
        ..fast_options()
    };
    let manager = Arc::new(SyntheticDeviceManager::new(options));
    let plan = CapturePlan::with_duration(Duration::from_millis(200), Duration::from_millis(10));
    let session = CaptureSession::new(plan);

    let report = scheduler(&manager, dir.path()).run(&session)?;
    assert_eq!(report.frames_attempted, 20);
    assert_eq!(report.frames_written, 19);
    assert_eq!(report.frames_failed, 1);
    assert!(!dir.path().join("frame_000005.jpg").exists());
    assert!(dir.path().join("frame_000004.jpg").exists());
    assert!(dir.path().join("frame_000006.jpg").exists());

    let probe = manager.last_probe().expect("device acquired");
    assert_eq!(probe.live_mappings(), 0);
    Ok(())
}

#[test]
fn allocation_failure_aborts_before_capture() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = SyntheticOptions {
        fail_allocation: true,
        ..fast_options()
    };
    let manager = Arc::new(SyntheticDeviceManager::new(options));
    let session = CaptureSession::new(CapturePlan::new(1, 500, Duration::from_millis(300)));

    let err = scheduler(&manager, dir.path())
        .run(&session)
        .expect_err("allocation must fail");
    assert!(matches!(err, CaptureError::Allocate(_)));
    assert!(err.is_resource_exhaustion());

    let probe = manager.last_probe().expect("device acquired");
    assert_eq!(probe.submitted(), 0);
    assert!(!probe.was_started());
    assert!(probe.is_released());
    Ok(())
}

#[test]
fn unknown_device_is_resource_exhaustion() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut settings = settings(dir.path());
    settings.device = "/nonexistent/video99".to_string();
    let scheduler = CaptureScheduler::new(
        Arc::new(SystemDeviceManager::default()),
        Arc::new(JpegCodec),
        settings,
    );
    let session = CaptureSession::new(CapturePlan::new(1, 500, Duration::from_millis(300)));
    let err = scheduler.run(&session).expect_err("device must be missing");
    assert!(matches!(err, CaptureError::Acquire(_)));
    assert!(err.is_resource_exhaustion());
    Ok(())
}

#[test]
fn session_runs_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = Arc::new(SyntheticDeviceManager::new(fast_options()));
    let plan = CapturePlan::with_duration(Duration::from_millis(30), Duration::from_millis(10));
    let session = CaptureSession::new(plan);
    let scheduler = scheduler(&manager, dir.path());
    scheduler.run(&session)?;
    assert!(matches!(
        scheduler.run(&session),
        Err(CaptureError::SessionReused)
    ));
    Ok(())
}
