//! Local HTTP surface for the dashboard.
//!
//! Routes:
//! - `GET /health`
//! - `GET /frame.jpg` latest annotated frame
//! - `GET /stream` MJPEG (`multipart/x-mixed-replace`) of the annotated frames,
//!   served on its own thread until the client leaves or the server stops
//! - `GET /images/<file>` a stored snapshot; names must resolve inside the images directory
//! - `GET /events?limit=&offset=` stored history, newest first
//! - `GET /config/detection`, `POST /config/detection` (partial JSON update)

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{DetectionUpdate, SpeedcamConfig};
use crate::pipeline::ServiceControl;
use crate::storage::SharedEventStore;

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 500;
const FRAME_JPEG_QUALITY: u8 = 80;
const STREAM_FRAME_INTERVAL: Duration = Duration::from_millis(66);
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const STREAM_BOUNDARY: &str = "frame";

/// Everything request handlers can reach.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Mutex<SpeedcamConfig>>,
    pub service: ServiceControl,
    pub store: Option<SharedEventStore>,
    /// Directory holding event snapshots, served under `/images/`.
    pub images_dir: Option<PathBuf>,
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
    addr: String,
    state: ApiState,
}

impl ApiServer {
    pub fn new(addr: &str, state: ApiState) -> Self {
        Self {
            addr: addr.to_string(),
            state,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .addr
            .parse()
            .with_context(|| format!("parse api address '{}'", self.addr))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let state = self.state;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, &state, shutdown_thread) {
                log::error!("api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: &ApiState, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, state, &shutdown) {
                    log::warn!("api request failed: {}", err);
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

fn handle_connection(
    mut stream: TcpStream,
    state: &ApiState,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        return Response::error(403, "forbidden").write_to(&mut stream);
    }
    let request = read_request(&mut stream)?;
    if request.method == "GET" && request.path == "/stream" {
        let service = state.service.clone();
        let shutdown = Arc::clone(shutdown);
        std::thread::Builder::new()
            .name("speedcam-stream".to_string())
            .spawn(move || {
                if let Err(err) = stream_mjpeg(stream, &service, &shutdown) {
                    log::debug!("stream to {} ended: {:#}", peer, err);
                }
            })?;
        return Ok(());
    }
    let response = route(&request, state).unwrap_or_else(|err| {
        log::warn!("{} {} failed: {:#}", request.method, request.path, err);
        Response::error(500, "internal_error")
    });
    response.write_to(&mut stream)
}

/// Push the latest annotated frame as one multipart part per tick.
fn stream_mjpeg(
    mut stream: TcpStream,
    service: &ServiceControl,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        STREAM_BOUNDARY
    );
    stream.write_all(header.as_bytes())?;
    while !shutdown.load(Ordering::SeqCst) && service.is_running() {
        if let Some(frame) = service.latest_frame() {
            let jpeg = frame.to_jpeg(FRAME_JPEG_QUALITY)?;
            let part = format!(
                "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                STREAM_BOUNDARY,
                jpeg.len()
            );
            stream.write_all(part.as_bytes())?;
            stream.write_all(&jpeg)?;
            stream.write_all(b"\r\n")?;
            stream.flush()?;
        }
        std::thread::sleep(STREAM_FRAME_INTERVAL);
    }
    Ok(())
}

fn route(request: &HttpRequest, state: &ApiState) -> Result<Response> {
    let response = match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => Response::json(
            200,
            &serde_json::json!({
                "status": "ok",
                "running": state.service.is_running(),
                "frames_processed": state.service.frames_processed(),
                "events": state.service.events_emitted(),
            }),
        )?,
        ("GET", "/frame.jpg") => match state.service.latest_frame() {
            Some(frame) => Response {
                status: 200,
                content_type: "image/jpeg",
                body: frame.to_jpeg(FRAME_JPEG_QUALITY)?,
            },
            None => Response::error(503, "no_frame"),
        },
        ("GET", "/events") => {
            let Some(store) = &state.store else {
                return Ok(Response::error(503, "no_store"));
            };
            let limit = request
                .query_usize("limit")
                .unwrap_or(DEFAULT_EVENT_LIMIT)
                .min(MAX_EVENT_LIMIT);
            let offset = request.query_usize("offset").unwrap_or(0);
            let events = store
                .lock()
                .map_err(|_| anyhow!("event store lock poisoned"))?
                .events(limit, offset)?;
            Response::json(200, &events)?
        }
        ("GET", path) if path.starts_with("/images/") => {
            let Some(images_dir) = &state.images_dir else {
                return Ok(Response::error(503, "no_store"));
            };
            let Some(snapshot) = resolve_snapshot(images_dir, &path["/images/".len()..]) else {
                return Ok(Response::error(404, "not_found"));
            };
            match std::fs::read(&snapshot) {
                Ok(body) => Response {
                    status: 200,
                    content_type: "image/jpeg",
                    body,
                },
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Response::error(404, "not_found")
                }
                Err(err) => {
                    return Err(anyhow!("read snapshot {}: {}", snapshot.display(), err))
                }
            }
        }
        ("GET", "/config/detection") => Response::json(200, &lock_config(state)?.detection)?,
        ("POST", "/config/detection") => {
            let update: DetectionUpdate = match serde_json::from_slice(&request.body) {
                Ok(update) => update,
                Err(err) => return Ok(Response::error(400, &format!("invalid body: {}", err))),
            };
            match apply_detection_update(state, &update) {
                Ok(detection) => Response::json(200, &detection)?,
                Err(err) => Response::error(400, &err.to_string()),
            }
        }
        (_, "/health" | "/frame.jpg" | "/stream" | "/events" | "/config/detection") => {
            Response::error(405, "method_not_allowed")
        }
        (_, path) if path.starts_with("/images/") => Response::error(405, "method_not_allowed"),
        _ => Response::error(404, "not_found"),
    };
    Ok(response)
}

/// Path of snapshot `name` when it is a regular file directly inside `images_dir`.
///
/// Separators and leading dots are refused outright; symlinks are resolved
/// before the containment check.
fn resolve_snapshot(images_dir: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return None;
    }
    let root = images_dir.canonicalize().ok()?;
    let path = root.join(name).canonicalize().ok()?;
    (path.parent() == Some(root.as_path()) && path.is_file()).then_some(path)
}

fn lock_config(state: &ApiState) -> Result<std::sync::MutexGuard<'_, SpeedcamConfig>> {
    state
        .config
        .lock()
        .map_err(|_| anyhow!("config lock poisoned"))
}

/// Merge, validate, hand to the worker, then persist.
fn apply_detection_update(
    state: &ApiState,
    update: &DetectionUpdate,
) -> Result<crate::config::DetectionSettings> {
    let mut config = lock_config(state)?;
    let detection = config.detection.merged(update);
    detection.validate()?;
    state.service.reload(detection.clone())?;
    config.detection = detection.clone();
    match config.save() {
        Ok(true) => log::info!("detection settings updated and saved"),
        Ok(false) => log::info!("detection settings updated (no config file to persist)"),
        Err(err) => log::error!("failed to persist detection settings: {:#}", err),
    }
    Ok(detection)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data.get(header_end..).unwrap_or_default().to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (raw_path.to_string(), HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        query,
        body,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json<T: serde::Serialize + ?Sized>(status: u16, value: &T) -> Result<Self> {
        Ok(Self {
            status,
            content_type: "application/json",
            body: serde_json::to_vec(value)?,
        })
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: serde_json::json!({ "error": message }).to_string().into_bytes(),
        }
    }

    fn write_to(&self, stream: &mut TcpStream) -> Result<()> {
        let reason = match self.status {
            200 => "OK",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            503 => "Service Unavailable",
            _ => "Internal Server Error",
        };
        let header = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            self.status,
            reason,
            self.content_type,
            self.body.len()
        );
        stream.write_all(header.as_bytes())?;
        stream.write_all(&self.body)?;
        Ok(())
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query_usize(&self, key: &str) -> Option<usize> {
        self.query.get(key).and_then(|v| v.parse().ok())
    }
}
