//! Local management API and the capture timer (the interactive lane).
//!
//! One thread accepts connections non-blockingly. Between accepts it fires
//! the capture timer and the periodic status report, so a slow client can
//! delay a tick but never the worker lane.

use crate::error::{PipelineError, RejectReason};
use crate::pipeline::{Admission, Pipeline};
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Fire `Pipeline::tick` every capture interval.
    pub capture_timer: bool,
    pub report_interval: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            capture_timer: true,
            report_interval: Duration::from_secs(10),
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
    pipeline: Arc<Pipeline>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, pipeline: Arc<Pipeline>) -> Self {
        Self { cfg, pipeline }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let pipeline = self.pipeline;
        let join = std::thread::Builder::new()
            .name("interactive".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, cfg, pipeline, shutdown_thread) {
                    log::error!("camera api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    pipeline: Arc<Pipeline>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let heartbeat = pipeline.interactive_heartbeat();
    let capture_interval = pipeline.limits().capture_interval;
    let mut last_tick = Instant::now();
    let mut last_report = Instant::now();
    log::info!("camera api listening on {}", listener.local_addr()?);
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        heartbeat.beat();
        if cfg.capture_timer && last_tick.elapsed() >= capture_interval {
            last_tick = Instant::now();
            if let Admission::Rejected(reason) = pipeline.tick() {
                log::debug!("timer capture skipped: {}", reason);
            }
        }
        if last_report.elapsed() >= cfg.report_interval {
            last_report = Instant::now();
            log::info!("status: {}", pipeline.status_report().summary_line());
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &pipeline) {
                    log::warn!("camera api request failed: {}", err);
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

fn handle_connection(mut stream: TcpStream, pipeline: &Pipeline) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    let method = request.method.as_str();
    let path = request.path.as_str();

    match (method, path) {
        ("GET", "/health") => write_json_response(&mut stream, 200, &json!({"status": "ok"})),
        ("GET", "/status") => write_json_response(&mut stream, 200, &pipeline.status_report()),
        ("POST", "/capture") => {
            let admission = pipeline.request_capture();
            write_admission(&mut stream, admission)
        }
        ("POST", "/photos/delete") => {
            let batch = match request.query_usize("batch") {
                Ok(batch) => batch.unwrap_or(0),
                Err(err) => return write_bad_request(&mut stream, &err.to_string()),
            };
            match pipeline.request_bulk_delete(batch) {
                Ok(report) => {
                    let note = report.budget_error().map(|err| err.to_string());
                    write_json_response(
                        &mut stream,
                        200,
                        &json!({
                            "deleted": report.deleted,
                            "remaining": report.remaining,
                            "success": report.success,
                            "budget_exhausted": report.budget_exhausted,
                            "note": note,
                        }),
                    )
                }
                Err(err) => write_pipeline_error(&mut stream, &err),
            }
        }
        ("POST", "/storage/reformat") => match pipeline.request_reformat() {
            Ok(report) => write_json_response(&mut stream, 200, &report),
            Err(err) => write_pipeline_error(&mut stream, &err),
        },
        ("POST", "/storage/remount") => match pipeline.request_remount() {
            Ok(report) => write_json_response(&mut stream, 200, &report),
            Err(err) => write_pipeline_error(&mut stream, &err),
        },
        ("GET", "/photos") => {
            let page = request.query_usize("page");
            let per_page = request.query_usize("per_page");
            let (page, per_page) = match (page, per_page) {
                (Ok(page), Ok(per_page)) => {
                    (page.unwrap_or(0), per_page.unwrap_or(DEFAULT_PAGE_SIZE))
                }
                (Err(err), _) | (_, Err(err)) => {
                    return write_bad_request(&mut stream, &err.to_string())
                }
            };
            match pipeline.list_photos(page, per_page) {
                Ok(listing) => write_json_response(&mut stream, 200, &listing),
                Err(err) => write_pipeline_error(&mut stream, &err),
            }
        }
        ("GET", "/photos/latest") => match pipeline.latest_photo() {
            Ok((_, bytes)) => write_response(&mut stream, 200, "image/jpeg", &bytes),
            Err(err) => write_pipeline_error(&mut stream, &err),
        },
        ("GET", p) if p.starts_with("/photos/") && p != "/photos/delete" => {
            match pipeline.read_photo(&p["/photos/".len()..]) {
                Ok(bytes) => write_response(&mut stream, 200, "image/jpeg", &bytes),
                Err(err) => write_pipeline_error(&mut stream, &err),
            }
        }
        (_, "/health" | "/status" | "/capture" | "/photos" | "/photos/delete")
        | (_, "/storage/reformat" | "/storage/remount") => write_json_response(
            &mut stream,
            405,
            &json!({"error": "method_not_allowed"}),
        ),
        _ => write_json_response(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

fn write_admission(stream: &mut TcpStream, admission: Admission) -> Result<()> {
    match admission {
        Admission::Accepted { ticket } => write_json_response(
            stream,
            202,
            &json!({"status": "accepted", "ticket": ticket}),
        ),
        Admission::Rejected(reason) => {
            let error = reason.as_error();
            write_json_response(
                stream,
                reject_status(reason),
                &json!({
                    "status": "rejected",
                    "reason": reason,
                    "error": error.as_ref().map(PipelineError::code),
                    "message": reason.describe(),
                }),
            )
        }
    }
}

fn reject_status(reason: RejectReason) -> u16 {
    if let Some(err) = reason.as_error() {
        return error_status(&err);
    }
    match reason {
        RejectReason::RateLimited => 429,
        _ => 409,
    }
}

fn error_status(err: &PipelineError) -> u16 {
    match err {
        PipelineError::InvalidPhotoName(_) => 400,
        PipelineError::PhotoNotFound(_) => 404,
        PipelineError::StorageBusy
        | PipelineError::StorageUnavailable(_)
        | PipelineError::ResourceExhausted(_) => 503,
        _ => 500,
    }
}

fn write_pipeline_error(stream: &mut TcpStream, err: &PipelineError) -> Result<()> {
    write_json_response(
        stream,
        error_status(err),
        &json!({"error": err.code(), "reason": err.to_string()}),
    )
}

fn write_bad_request(stream: &mut TcpStream, message: &str) -> Result<()> {
    write_json_response(
        stream,
        400,
        &json!({"error": "bad_request", "reason": message}),
    )
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
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
    })
}

fn write_json_response<T: Serialize + ?Sized>(
    stream: &mut TcpStream,
    status: u16,
    body: &T,
) -> Result<()> {
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
        202 => "HTTP/1.1 202 Accepted",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        429 => "HTTP/1.1 429 Too Many Requests",
        503 => "HTTP/1.1 503 Service Unavailable",
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
}

impl HttpRequest {
    fn query_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.query.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| anyhow!("query parameter '{}' must be a non-negative integer", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reasons_map_to_distinct_statuses() {
        assert_eq!(reject_status(RejectReason::Busy), 409);
        assert_eq!(reject_status(RejectReason::Degraded), 409);
        assert_eq!(reject_status(RejectReason::RateLimited), 429);
        assert_eq!(reject_status(RejectReason::QueueSaturated), 503);
        assert_eq!(reject_status(RejectReason::LowMemory), 503);
        assert_eq!(reject_status(RejectReason::EnqueueTimeout), 503);
    }

    #[test]
    fn pipeline_errors_map_to_statuses() {
        assert_eq!(error_status(&PipelineError::StorageBusy), 503);
        assert_eq!(
            error_status(&PipelineError::InvalidPhotoName("x".to_string())),
            400
        );
        assert_eq!(
            error_status(&PipelineError::PhotoNotFound("x".to_string())),
            404
        );
    }
}
