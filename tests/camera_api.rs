mod common;

use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use timelapse_kernel::api::{ApiConfig, ApiHandle, ApiServer};
use timelapse_kernel::{
    open_sensor, ManualMemoryProbe, Pipeline, PipelineLimits, SensorSettings, WorkerHandle,
};

use common::{open_pipeline, test_limits, wait_for, TestCard};

struct TestApi {
    _dir: tempfile::TempDir,
    pipeline: Arc<Pipeline>,
    probe: Arc<ManualMemoryProbe>,
    api_handle: Option<ApiHandle>,
    worker: Option<WorkerHandle>,
}

impl TestApi {
    fn new(limits: PipelineLimits) -> Result<Self> {
        let dir = tempdir()?;
        let (pipeline, probe) = open_pipeline(limits, TestCard::new(dir.path()));
        let sensor = open_sensor(
            &SensorSettings {
                source: "stub://api-test".to_string(),
                width: 64,
                height: 48,
                jpeg_quality: 60,
            },
            pipeline.buffer_pool(),
        )?;
        let worker = pipeline.spawn_worker(sensor, Arc::new(AtomicBool::new(false)))?;

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            capture_timer: false,
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(api_config, pipeline.clone()).spawn()?;
        assert!(wait_for(Duration::from_secs(2), || pipeline.status().sensor_ready));

        Ok(Self {
            _dir: dir,
            pipeline,
            probe,
            api_handle: Some(api_handle),
            worker: Some(worker),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn request(&self, method: &str, path: &str) -> Result<(String, Vec<u8>)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn json(&self, method: &str, path: &str) -> Result<(String, Value)> {
        let (headers, body) = self.request(method, path)?;
        Ok((headers, serde_json::from_slice(&body)?))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
        if let Some(worker) = self.worker.take() {
            worker.stop().expect("failed to stop capture worker");
        }
    }
}

fn read_response(stream: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    let body = response.get(split + 4..).unwrap_or_default().to_vec();
    Ok((headers, body))
}

#[test]
fn health_and_status_report_the_pipeline() -> Result<()> {
    let api = TestApi::new(test_limits())?;

    let (headers, body) = api.json("GET", "/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["status"], "ok");

    let (headers, status) = api.json("GET", "/status")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(status["phase"], "idle");
    assert_eq!(status["photo_count"], 0);
    assert_eq!(status["queue_capacity"], 5);
    assert!(status["lanes"].as_array().is_some());
    Ok(())
}

#[test]
fn capture_then_browse_and_fetch() -> Result<()> {
    let api = TestApi::new(test_limits())?;

    let (headers, body) = api.json("POST", "/capture")?;
    assert!(headers.contains("202 Accepted"));
    assert_eq!(body["status"], "accepted");
    assert!(wait_for(Duration::from_secs(5), || {
        api.pipeline.status().photo_count == 1
    }));

    let (headers, listing) = api.json("GET", "/photos?page=0&per_page=10")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(listing["total"], 1);
    assert_eq!(listing["photos"][0], "photo_000001.jpg");

    let (headers, jpeg) = api.request("GET", "/photos/latest")?;
    assert!(headers.contains("image/jpeg"));
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    let (headers, named) = api.request("GET", "/photos/photo_000001.jpg")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(named, jpeg);
    Ok(())
}

#[test]
fn photo_lookups_validate_names() -> Result<()> {
    let api = TestApi::new(test_limits())?;

    let (headers, body) = api.json("GET", "/photos/passwd")?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "invalid_photo_name");

    let (headers, _) = api.json("GET", "/photos/photo_000042.jpg")?;
    assert!(headers.contains("404 Not Found"));

    let (headers, _) = api.json("GET", "/photos/latest")?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn interactive_captures_are_rate_limited() -> Result<()> {
    let limits = PipelineLimits {
        capture_interval: Duration::from_secs(60),
        ..test_limits()
    };
    let api = TestApi::new(limits)?;

    let (headers, _) = api.json("POST", "/capture")?;
    assert!(headers.contains("202 Accepted"));
    let (headers, body) = api.json("POST", "/capture")?;
    assert!(headers.contains("429 Too Many Requests"));
    assert_eq!(body["reason"], "rate_limited");
    assert!(body["message"].as_str().is_some());
    Ok(())
}

#[test]
fn low_memory_rejections_carry_a_resource_error() -> Result<()> {
    let api = TestApi::new(test_limits())?;
    api.probe.set(500_000);

    let (headers, body) = api.json("POST", "/capture")?;
    assert!(headers.contains("503 Service Unavailable"));
    assert_eq!(body["reason"], "low_memory");
    assert_eq!(body["error"], "resource_exhausted");
    assert_eq!(api.pipeline.status().counters.admitted, 0);
    Ok(())
}

#[test]
fn admin_routes_delete_remount_and_reformat() -> Result<()> {
    let api = TestApi::new(test_limits())?;
    for expected in 1..=2u64 {
        let (headers, _) = api.json("POST", "/capture")?;
        assert!(headers.contains("202 Accepted"));
        assert!(wait_for(Duration::from_secs(5), || {
            api.pipeline.status().photo_count == expected
        }));
    }

    let (headers, _) = api.json("POST", "/photos/delete?batch=lots")?;
    assert!(headers.contains("400 Bad Request"));

    let (headers, report) = api.json("POST", "/photos/delete?batch=1")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(report["deleted"], 1);
    assert_eq!(report["remaining"], 1);
    assert_eq!(report["success"], true);

    let (headers, report) = api.json("POST", "/storage/remount")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(report["success"], true);
    assert_eq!(report["photos_found"], 1);

    let (headers, report) = api.json("POST", "/storage/reformat")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(report["success"], true);
    assert_eq!(report["deleted"], 1);
    assert_eq!(api.pipeline.status().photo_count, 0);
    Ok(())
}

#[test]
fn unknown_routes_and_wrong_methods() -> Result<()> {
    let api = TestApi::new(test_limits())?;

    let (headers, _) = api.json("GET", "/capture")?;
    assert!(headers.contains("405 Method Not Allowed"));
    let (headers, _) = api.json("GET", "/photos/delete")?;
    assert!(headers.contains("405 Method Not Allowed"));
    let (headers, _) = api.json("GET", "/nowhere")?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}
