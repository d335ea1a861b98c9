//! timelapsed - timelapse control daemon
//!
//! Loads configuration, serves the control API and runs capture sessions and
//! assembly jobs on request until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::mpsc;
use std::sync::Arc;

use timelapse_kernel::{
    api::{ApiConfig, ApiServer},
    config::TimelapseConfig,
    Controller, DeviceManager, JpegCodec, SystemDeviceManager,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = TimelapseConfig::load()?;
    let devices = Arc::new(SystemDeviceManager::new(config.capture.exposure));
    log::info!("capture devices: {:?}", devices.list_devices());
    let device = config.resolve_device(&*devices)?;
    log::info!(
        "timelapsed: device {} frames -> {} videos -> {}",
        device,
        config.frame_dir.display(),
        config.video_dir.display()
    );

    let controller = Arc::new(Controller::new(
        devices,
        Arc::new(JpegCodec),
        config.control_settings(device),
    ));
    let api_handle = ApiServer::new(
        ApiConfig {
            addr: config.api_addr.clone(),
        },
        controller.clone(),
    )
    .spawn()?;
    log::info!("control api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("set Ctrl-C handler")?;

    log::info!("timelapsed waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    controller.shutdown();
    Ok(())
}
