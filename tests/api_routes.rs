use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

use speedcam::api::{ApiHandle, ApiServer, ApiState};
use speedcam::frame::Frame;
use speedcam::storage::SharedEventStore;
use speedcam::{
    acquire, EventHandler, EventStore, Pipeline, Service, ServiceHandle,
    SpeedEvent, SpeedcamConfig, SqliteEventStore, SystemBackends,
};

fn read_response(stream: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    Ok((headers, response[split..].to_vec()))
}

struct TestApi {
    dir: TempDir,
    config: Arc<Mutex<SpeedcamConfig>>,
    service: Option<ServiceHandle>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let config_path = dir.path().join("speedcam.toml");
        std::fs::write(
            &config_path,
            r#"
            [camera]
            source = "stub://road"
            width = 160
            height = 120
            fps = 50

            [detection]
            line1 = [0, 30, 160, 30]
            line2 = [0, 90, 160, 90]
            real_distance_meters = 8.0
            "#,
        )?;
        let config = SpeedcamConfig::load_from(Some(&config_path))?;

        let mut store = SqliteEventStore::open(&dir.path().join("data"), 100.0)?;
        for (i, speed) in [31.5, 48.25].into_iter().enumerate() {
            store.save(&SpeedEvent {
                speed_kmh: speed,
                timestamp: 1_000.0 + i as f64,
                object_id: i as u64,
                frame: Frame::blank(8, 8, 0.0),
            })?;
        }
        let images_dir = store.images_dir().to_path_buf();
        let store: SharedEventStore = Arc::new(Mutex::new(store));

        let acquired = acquire(&config.camera, &SystemBackends)?;
        let service = Service::new(
            acquired,
            Pipeline::new(&config.detection),
            EventHandler::log_only(),
        )
        .spawn()?;

        let config = Arc::new(Mutex::new(config));
        let api_handle = ApiServer::new(
            "127.0.0.1:0",
            ApiState {
                config: config.clone(),
                service: service.control(),
                store: Some(store),
                images_dir: Some(images_dir),
            },
        )
        .spawn()?;

        Ok(Self {
            dir,
            config,
            service: Some(service),
            api_handle: Some(api_handle),
        })
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = self
            .api_handle
            .as_ref()
            .expect("test API handle should be initialized")
            .addr;
        Ok(TcpStream::connect(addr)?)
    }

    fn request(&self, raw: &str) -> Result<(String, Vec<u8>)> {
        let mut stream = self.connect()?;
        stream.write_all(raw.as_bytes())?;
        read_response(&mut stream)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
        if let Some(service) = self.service.take() {
            service.stop().expect("failed to stop worker");
        }
    }
}

#[test]
fn health_reports_ok() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.request("GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["status"], "ok");
    Ok(())
}

#[test]
fn frame_endpoint_serves_jpeg() -> Result<()> {
    let api = TestApi::new()?;
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let (headers, body) =
            api.request("GET /frame.jpg HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
        if headers.contains("200 OK") {
            assert!(headers.contains("image/jpeg"));
            assert_eq!(&body[..2], &[0xFF, 0xD8]);
            return Ok(());
        }
        assert!(headers.contains("503"));
        assert!(Instant::now() < deadline, "no frame published in time");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn events_are_paged_newest_first() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) =
        api.request("GET /events?limit=1&offset=0 HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_slice(&body)?;
    let events = value.as_array().expect("array body");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["speed"], 48.25);
    assert_eq!(events[0]["object_id"], 1);
    Ok(())
}

#[test]
fn partial_detection_update_is_applied_and_persisted() -> Result<()> {
    let api = TestApi::new()?;
    let body = r#"{"real_distance_meters": 12.5}"#;
    let request = format!(
        "POST /config/detection HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let (headers, response) = api.request(&request)?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_slice(&response)?;
    assert_eq!(value["real_distance_meters"], 12.5);
    assert_eq!(value["line1"], serde_json::json!([0, 30, 160, 30]));

    let active = api.config.lock().unwrap().detection.clone();
    assert_eq!(active.real_distance_meters, 12.5);

    let reloaded = SpeedcamConfig::load_from(Some(&api.dir.path().join("speedcam.toml")))?;
    assert_eq!(reloaded.detection.real_distance_meters, 12.5);
    assert_eq!(reloaded.detection.line2, active.line2);

    let (headers, response) =
        api.request("GET /config/detection HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_slice(&response)?;
    assert_eq!(value["real_distance_meters"], 12.5);
    Ok(())
}

#[test]
fn invalid_detection_update_is_rejected() -> Result<()> {
    let api = TestApi::new()?;
    let body = r#"{"real_distance_meters": 0}"#;
    let request = format!(
        "POST /config/detection HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let (headers, _) = api.request(&request)?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(api.config.lock().unwrap().detection.real_distance_meters, 8.0);
    Ok(())
}

#[test]
fn unknown_route_is_not_found() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.request("GET /nope HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.request("DELETE /events HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

/// Read from `stream` until `needle` has been seen `count` times.
fn read_until_count(stream: &mut TcpStream, needle: &[u8], count: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    while data.windows(needle.len()).filter(|w| *w == needle).count() < count {
        let n = stream.read(&mut buf)?;
        anyhow::ensure!(n > 0, "stream closed after {} bytes", data.len());
        data.extend_from_slice(&buf[..n]);
    }
    Ok(data)
}

#[test]
fn stream_pushes_multipart_jpeg_frames() -> Result<()> {
    let api = TestApi::new()?;
    let mut stream = api.connect()?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let data = read_until_count(&mut stream, b"--frame\r\n", 3)?;
    let text = String::from_utf8_lossy(&data);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));

    let part = data
        .windows(10)
        .position(|w| w == b"--frame\r\n")
        .expect("first part");
    let body_start = data[part..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| part + pos + 4)
        .expect("part headers");
    let part_headers = String::from_utf8_lossy(&data[part..body_start]);
    assert!(part_headers.contains("Content-Type: image/jpeg"));
    assert_eq!(&data[body_start..body_start + 2], &[0xFF, 0xD8]);

    // Other requests are still served while the stream is open.
    let (headers, _) = api.request("GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    assert!(headers.contains("200 OK"));
    Ok(())
}

#[test]
fn snapshot_route_serves_stored_images_only() -> Result<()> {
    let api = TestApi::new()?;
    let (_, body) = api.request("GET /events HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let events: Value = serde_json::from_slice(&body)?;
    let name = events[0]["image_path"].as_str().expect("image name").to_string();

    let (headers, body) = api.request(&format!(
        "GET /images/{} HTTP/1.1\r\nHost: localhost\r\n\r\n",
        name
    ))?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("image/jpeg"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    for path in [
        "/images/../speed_cam.db",
        "/images/..%2Fspeed_cam.db",
        "/images/missing.jpg",
        "/images/",
    ] {
        let (headers, _) =
            api.request(&format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path))?;
        assert!(headers.contains("404 Not Found"), "{} -> {}", path, headers);
    }
    let (headers, _) = api.request(&format!(
        "DELETE /images/{} HTTP/1.1\r\nHost: localhost\r\n\r\n",
        name
    ))?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}
