use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use timelapse_kernel::api::{ApiConfig, ApiServer};
use timelapse_kernel::device::{SyntheticDeviceManager, SyntheticOptions, DEFAULT_STUB_DEVICE};
use timelapse_kernel::{CaptureSettings, ControlSettings, Controller, EncoderSettings, JpegCodec};

fn controller(frame_dir: &Path, video_dir: &Path, encoder: PathBuf) -> Arc<Controller> {
    let options = SyntheticOptions {
        exposure: Duration::from_millis(2),
        ..SyntheticOptions::default()
    };
    let mut encoder = EncoderSettings::new(encoder, frame_dir.to_path_buf(), video_dir.to_path_buf());
    encoder.poll_interval = Duration::from_millis(20);
    encoder.grace = Duration::from_millis(300);
    Arc::new(Controller::new(
        Arc::new(SyntheticDeviceManager::new(options)),
        Arc::new(JpegCodec),
        ControlSettings {
            capture: CaptureSettings {
                device: DEFAULT_STUB_DEVICE.to_string(),
                width: 32,
                height: 24,
                frame_dir: frame_dir.to_path_buf(),
                jpeg_quality: 80,
                grace: Duration::from_millis(100),
            },
            default_interval: Duration::from_millis(20),
            encoder,
        },
    ))
}

fn request(addr: SocketAddr, method: &str, path: &str) -> anyhow::Result<(u16, serde_json::Value)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    write!(stream, "{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let (head, body) = response
        .split_once("\r\n\r\n")
        .ok_or_else(|| anyhow!("malformed response: {response}"))?;
    let status = head
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status"))?
        .parse()?;
    Ok((status, serde_json::from_str(body)?))
}

fn get(addr: SocketAddr, path: &str) -> anyhow::Result<(u16, serde_json::Value)> {
    request(addr, "GET", path)
}

fn wait_for_idle_capture(addr: SocketAddr) -> anyhow::Result<serde_json::Value> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (status, body) = get(addr, "/status")?;
        assert_eq!(status, 200);
        if body["capture"].is_null() {
            return Ok(body);
        }
        if Instant::now() > deadline {
            return Err(anyhow!("capture did not finish: {body}"));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn routing_and_parameter_validation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let controller = controller(dir.path(), dir.path(), "/nonexistent/encoder".into());
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        controller.clone(),
    )
    .spawn()?;
    let addr = handle.addr;

    assert_eq!(get(addr, "/health")?, (200, serde_json::json!({"status": "ok"})));
    assert_eq!(get(addr, "/nope")?.0, 404);
    assert_eq!(request(addr, "POST", "/start-capture")?.0, 405);

    for bad in [
        "/start-capture?length=abc",
        "/start-capture?length=-1",
        "/start-capture?length=5&interval=1.5",
        "/start-assembly?framerate=x",
        "/clear-frames?all=maybe",
    ] {
        let (status, body) = get(addr, bad)?;
        assert_eq!(status, 400, "{bad}: {body}");
    }
    assert_eq!(get(addr, "/stop-capture")?.0, 409);
    assert_eq!(get(addr, "/stop-assembly")?.0, 409);
    assert!(controller.status().capture.is_none());

    handle.stop()?;
    Ok(())
}

#[cfg(unix)]
#[test]
fn assembly_is_rejected_while_capturing() -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir()?;
    let frames = dir.path().join("frames");
    let videos = dir.path().join("videos");
    let marker = dir.path().join("encoder-ran");
    let script = dir.path().join("fake-encoder.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\n", marker.display()),
    )?;
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;

    let controller = controller(&frames, &videos, script);
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        controller.clone(),
    )
    .spawn()?;
    let addr = handle.addr;

    let (status, body) = get(addr, "/start-capture?length=1&interval=20")?;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["frames_planned"], 3000);
    assert_eq!(get(addr, "/start-capture")?.0, 409);

    let (status, _) = get(addr, "/start-assembly?framerate=30&preset=1&quality=20")?;
    assert_eq!(status, 409);
    assert_eq!(get(addr, "/clear-frames?all=true")?.0, 409);
    assert!(controller.status().assembly.is_none());
    assert!(!marker.exists(), "encoder must not be spawned");

    let (status, status_body) = get(addr, "/status")?;
    assert_eq!(status, 200);
    assert_eq!(status_body["capture"]["frames_planned"], 3000);

    assert_eq!(get(addr, "/stop-capture")?.0, 200);
    let idle = wait_for_idle_capture(addr)?;
    assert_eq!(idle["last_capture"]["result"], "finished");
    assert_eq!(idle["last_capture"]["report"]["cancelled"], true);

    let (status, body) = get(addr, "/start-assembly?framerate=30&preset=1&quality=20")?;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["request"]["preset"], "medium");
    let outcome = controller.join_assembly().expect("assembly was running");
    let outcome = serde_json::to_value(outcome)?;
    assert_eq!(outcome["result"], "finished");
    assert_eq!(outcome["outcome"]["state"], "succeeded");

    let args = std::fs::read_to_string(&marker)?;
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(&args[..2], &["-framerate", "30"]);
    assert!(args.windows(2).any(|pair| pair == ["-preset", "medium"]));
    assert!(args.windows(2).any(|pair| pair == ["-crf", "20"]));

    handle.stop()?;
    Ok(())
}

#[test]
fn clear_frames_keeps_non_image_files_by_default() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("frame_000000.jpg"), b"jpeg")?;
    std::fs::write(dir.path().join("frame_000001.jpg"), b"jpeg")?;
    std::fs::write(dir.path().join("capture.log"), b"log")?;

    let controller = controller(dir.path(), dir.path(), "/nonexistent/encoder".into());
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        controller,
    )
    .spawn()?;

    let (status, body) = get(handle.addr, "/status")?;
    assert_eq!(status, 200);
    assert_eq!(body["frames_on_disk"], 2);
    assert_eq!(body["devices"][0], DEFAULT_STUB_DEVICE);

    let (status, body) = get(handle.addr, "/clear-frames?all=false")?;
    assert_eq!(status, 200);
    assert_eq!(body["removed"], 2);
    assert!(dir.path().join("capture.log").exists());
    assert!(!dir.path().join("frame_000000.jpg").exists());

    let (status, body) = get(handle.addr, "/clear-frames?all=true")?;
    assert_eq!(status, 200);
    assert_eq!(body["removed"], 1);
    assert!(!dir.path().join("capture.log").exists());

    handle.stop()?;
    Ok(())
}
