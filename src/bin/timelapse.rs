//! timelapse - one capture session from the command line
//!
//! `timelapse [MINUTES]` captures for MINUTES (a full day when omitted or 0)
//! and stops early on Ctrl-C.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use timelapse_kernel::{
    api::parse_digits,
    capture::{DEFAULT_GRACE, DEFAULT_HEIGHT, DEFAULT_INTERVAL, DEFAULT_WIDTH},
    transcode::{is_even_size, DEFAULT_JPEG_QUALITY},
    CapturePlan, CaptureScheduler, CaptureSession, CaptureSettings, DeviceManager, JpegCodec,
    SystemDeviceManager,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture a timelapse frame sequence")]
struct Args {
    /// Session length in minutes (digits only; 0 or omitted = 24 hours).
    #[arg(value_parser = parse_minutes)]
    length: Option<u64>,
    /// Frame output directory.
    #[arg(long, env = "CAM_FRAME_PATH")]
    frames_dir: PathBuf,
    /// Capture device id (`stub://...` or a V4L2 node). Defaults to the first listed.
    #[arg(long, env = "TIMELAPSE_DEVICE")]
    device: Option<String>,
    /// Milliseconds between frames.
    #[arg(long, env = "TIMELAPSE_INTERVAL_MS", default_value_t = DEFAULT_INTERVAL.as_millis() as u64)]
    interval_ms: u64,
    /// Frame width in pixels (even).
    #[arg(long, default_value_t = DEFAULT_WIDTH, value_parser = parse_even)]
    width: u32,
    /// Frame height in pixels (even).
    #[arg(long, default_value_t = DEFAULT_HEIGHT, value_parser = parse_even)]
    height: u32,
    /// JPEG quality, 1-100.
    #[arg(long, env = "TIMELAPSE_JPEG_QUALITY", default_value_t = DEFAULT_JPEG_QUALITY)]
    quality: u8,
    /// List capture devices and exit.
    #[arg(long)]
    list_devices: bool,
}

fn parse_minutes(value: &str) -> Result<u64, String> {
    parse_digits(value).ok_or_else(|| format!("'{value}' is not a whole number of minutes"))
}

fn parse_even(value: &str) -> Result<u32, String> {
    let size: u32 = value
        .parse()
        .map_err(|_| format!("'{value}' is not a pixel count"))?;
    if !is_even_size(size, size) {
        return Err(format!("{size} must be even and non-zero"));
    }
    Ok(size)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let devices = Arc::new(SystemDeviceManager::default());
    if args.list_devices {
        for device in devices.list_devices() {
            println!("{device}");
        }
        return Ok(());
    }
    let device = match args.device {
        Some(device) => device,
        None => devices
            .list_devices()
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no capture devices found"))?,
    };

    let plan = CapturePlan::new(args.length.unwrap_or(0), args.interval_ms, DEFAULT_INTERVAL);
    let session = CaptureSession::new(plan);
    let stopper = session.stopper();
    ctrlc::set_handler(move || {
        log::info!("Ctrl-C received, stopping capture");
        stopper.stop();
    })
    .context("set Ctrl-C handler")?;

    let scheduler = CaptureScheduler::new(
        devices,
        Arc::new(JpegCodec),
        CaptureSettings {
            device,
            width: args.width,
            height: args.height,
            frame_dir: args.frames_dir,
            jpeg_quality: args.quality,
            grace: DEFAULT_GRACE,
        },
    );
    let report = scheduler.run(&session)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
