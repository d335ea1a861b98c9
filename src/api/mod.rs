//! HTTP control surface.
//!
//! A minimal GET-only HTTP/1.1 server on a std `TcpListener`. Each request is
//! mapped onto one `Controller` operation and answered with a JSON body.

use crate::control::{ControlError, Controller};
use crate::encoder::AssemblyRequest;
use anyhow::{anyhow, Result};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8000";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    controller: Arc<Controller>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, controller: Arc<Controller>) -> Self {
        Self { cfg, controller }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let controller = self.controller;
        let join = std::thread::Builder::new()
            .name("control-api".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, &controller, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;
        log::info!("control api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, controller: &Controller, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, controller) {
                    log::warn!("control api request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, controller: &Controller) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        return Ok(());
    }
    log::debug!("control api: {}", request.raw_path);
    let (status, body) = route(&request, controller);
    write_json_response(&mut stream, status, &body)
}

fn route(request: &HttpRequest, controller: &Controller) -> (u16, serde_json::Value) {
    let result = match request.path.as_str() {
        "/health" => return (200, json!({"status": "ok"})),
        "/status" => {
            return match serde_json::to_value(controller.status()) {
                Ok(status) => (200, status),
                Err(err) => (500, json!({"error": err.to_string()})),
            }
        }
        "/start-capture" => start_capture(request, controller),
        "/stop-capture" => controller
            .stop_capture()
            .map(|()| json!({"status": "stopping"}))
            .map_err(RouteError::Control),
        "/start-assembly" => start_assembly(request, controller),
        "/stop-assembly" => controller
            .stop_assembly()
            .map(|()| json!({"status": "stopping"}))
            .map_err(RouteError::Control),
        "/clear-frames" => clear_frames(request, controller),
        _ => return (404, json!({"error": "not_found"})),
    };
    match result {
        Ok(body) => (200, body),
        Err(RouteError::BadParam(name)) => {
            (400, json!({"error": "invalid_parameter", "parameter": name}))
        }
        Err(RouteError::Control(err)) => {
            let status = match err {
                ControlError::Conflict(_) => 409,
                ControlError::NotRunning(_) => 409,
                ControlError::Thread(_) | ControlError::Storage(_) => 500,
            };
            (status, json!({"error": err.to_string()}))
        }
    }
}

enum RouteError {
    BadParam(&'static str),
    Control(ControlError),
}

fn start_capture(
    request: &HttpRequest,
    controller: &Controller,
) -> Result<serde_json::Value, RouteError> {
    let minutes = request.digits("length")?.unwrap_or(0);
    let interval_ms = request.digits("interval")?.unwrap_or(0);
    let plan = controller
        .start_capture(minutes, interval_ms)
        .map_err(RouteError::Control)?;
    Ok(json!({
        "status": "capturing",
        "frames_planned": plan.total_frames,
        "interval_ms": plan.interval.as_millis() as u64,
    }))
}

fn start_assembly(
    request: &HttpRequest,
    controller: &Controller,
) -> Result<serde_json::Value, RouteError> {
    let defaults = AssemblyRequest::default();
    let framerate = request
        .digits("framerate")?
        .unwrap_or(u64::from(defaults.framerate));
    let preset = request.digits("preset")?.unwrap_or(0);
    let quality = request
        .digits("quality")?
        .unwrap_or(u64::from(defaults.quality));
    let assembly = AssemblyRequest::from_raw(
        clamp_i64(framerate),
        clamp_i64(preset),
        clamp_i64(quality),
    );
    let assembly = controller
        .start_assembly(assembly)
        .map_err(RouteError::Control)?;
    Ok(json!({"status": "assembling", "request": assembly}))
}

fn clear_frames(
    request: &HttpRequest,
    controller: &Controller,
) -> Result<serde_json::Value, RouteError> {
    let all_files = match request.query.get("all").map(String::as_str) {
        None | Some("false") | Some("0") => false,
        Some("true") | Some("1") => true,
        Some(_) => return Err(RouteError::BadParam("all")),
    };
    let removed = controller
        .clear_frames(all_files)
        .map_err(RouteError::Control)?;
    Ok(json!({"status": "cleared", "removed": removed}))
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// ASCII digits only; no sign, no whitespace, not empty.
pub fn parse_digits(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        raw_path: raw_path.to_string(),
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    raw_path: String,
}

impl HttpRequest {
    /// Missing → `None`; present but not digits-only → 400.
    fn digits(&self, key: &'static str) -> Result<Option<u64>, RouteError> {
        match self.query.get(key) {
            None => Ok(None),
            Some(value) => parse_digits(value)
                .map(Some)
                .ok_or(RouteError::BadParam(key)),
        }
    }
}
