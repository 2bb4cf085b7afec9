//! HTTP/1.1 front end for the detection service.
//!
//! One thread accepts connections; each request is handled on its own worker
//! thread against the shared `HazardService`, up to `max_concurrent_requests`
//! at once. Connections past the cap are answered 503 from the accept thread.
//! Stopping the server waits for in-flight workers. Bodies are read by
//! `Content-Length` only (no chunked uploads) and every response closes the
//! connection.

pub mod multipart;

use crate::config::ServiceConfig;
use crate::error::DetectError;
use crate::service::HazardService;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const BUSY_READ_TIMEOUT: Duration = Duration::from_secs(2);
const TOTAL_DETECTIONS_HEADER: &str = "X-Total-Detections";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_body_bytes: usize,
    pub max_concurrent_requests: usize,
    pub allowed_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            max_body_bytes: 100_000_000,
            max_concurrent_requests: 4,
            allowed_origins: Vec::new(),
        }
    }
}

impl ApiConfig {
    pub fn from_service(cfg: &ServiceConfig) -> Self {
        Self {
            addr: cfg.bind_addr(),
            max_body_bytes: cfg.max_upload_size,
            max_concurrent_requests: cfg.max_concurrent_requests,
            allowed_origins: cfg.allowed_origins.clone(),
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
    service: Arc<HazardService>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: Arc<HazardService>) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = Arc::new(self.cfg);
        let service = self.service;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, service, shutdown_thread) {
                log::error!("detection api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    service: Arc<HazardService>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let active = Arc::new(AtomicUsize::new(0));
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let outcome = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match listener.accept() {
            Ok((stream, _)) => {
                workers.retain(|worker| !worker.is_finished());
                // Only this thread takes slots, so the check cannot race.
                let in_flight = active.load(Ordering::SeqCst);
                if in_flight >= cfg.max_concurrent_requests {
                    if let Err(err) = reject_busy(stream, &cfg, in_flight) {
                        log::warn!("detection api busy rejection failed: {}", err);
                    }
                    continue;
                }
                let slot = WorkerSlot::acquire(&active);
                let cfg = cfg.clone();
                let service = service.clone();
                workers.push(std::thread::spawn(move || {
                    let _slot = slot;
                    if let Err(err) = handle_connection(stream, &cfg, &service) {
                        log::warn!("detection api request rejected: {}", err);
                    }
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => break Err(err.into()),
        }
    };

    if !workers.is_empty() {
        log::info!("waiting for {} in-flight request(s)", active.load(Ordering::SeqCst));
    }
    for worker in workers {
        if worker.join().is_err() {
            log::error!("detection api worker panicked");
        }
    }
    outcome
}

/// Counts one in-flight request until dropped.
struct WorkerSlot(Arc<AtomicUsize>);

impl WorkerSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(active))
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn reject_busy(mut stream: TcpStream, cfg: &ApiConfig, in_flight: usize) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(BUSY_READ_TIMEOUT))?;
    let head = read_head(&mut stream)?;
    let cors = cors_origin(&head, cfg);
    let response = Response::detail(
        503,
        format!("server busy: {in_flight} request(s) in flight, retry later"),
    );
    log::warn!("{} {} -> 503 (busy)", head.method, head.path);
    reject(&mut stream, &head, &response, cors.as_deref())
}

/// Answer without reading the request body into memory.
fn reject(
    stream: &mut TcpStream,
    head: &RequestHead,
    response: &Response,
    cors: Option<&str>,
) -> Result<()> {
    // A client waiting on `100 Continue` never sends the body.
    if !head.expects_continue() {
        discard(stream, head.content_length)?;
    }
    write_response(stream, response, cors)
}

fn cors_origin(head: &RequestHead, cfg: &ApiConfig) -> Option<String> {
    head.header("origin")
        .filter(|origin| cfg.allowed_origins.iter().any(|o| o == origin))
        .map(str::to_string)
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    service: &HazardService,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let head = read_head(&mut stream)?;
    let cors = cors_origin(&head, cfg);

    if head.content_length > cfg.max_body_bytes {
        let response = Response::detail(
            413,
            format!(
                "upload of {} bytes exceeds the {} byte limit",
                head.content_length, cfg.max_body_bytes
            ),
        );
        reject(&mut stream, &head, &response, cors.as_deref())?;
        return Err(anyhow!("payload too large ({} bytes)", head.content_length));
    }
    if head.expects_continue() && head.body_prefix.len() < head.content_length {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
        stream.flush()?;
    }

    let request = read_body(&mut stream, head)?;
    log::debug!("{} {}", request.method, request.path);
    let response = route(&request, service);
    if response.status >= 400 {
        log::warn!(
            "{} {} -> {}",
            request.method,
            request.path,
            response.status
        );
    }
    write_response(&mut stream, &response, cors.as_deref())
}

fn route(request: &HttpRequest, service: &HazardService) -> Response {
    let result = match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => Ok(Response::preflight(request.header("access-control-request-headers"))),
        ("GET", "/") => Ok(Response::json(200, &service.status())),
        ("GET", "/health") => Ok(Response::json(200, &service.health())),
        ("POST", "/api/detect/image") => detect_image(request, service),
        ("POST", "/api/detect/video") => detect_video(request, service),
        ("POST", "/api/detect/frame") => detect_frame(request, service),
        ("DELETE", "/api/cleanup") => service.cleanup().map(|r| Response::json(200, &r)),
        (_, "/" | "/health" | "/api/detect/image" | "/api/detect/video" | "/api/detect/frame" | "/api/cleanup") => {
            Ok(Response::detail(405, "Method Not Allowed"))
        }
        _ => Ok(Response::detail(404, "Not Found")),
    };
    result.unwrap_or_else(|err| error_response(&err))
}

fn detect_image(request: &HttpRequest, service: &HazardService) -> crate::Result<Response> {
    service.ensure_ready()?;
    let upload = request.upload("image")?;
    let filename = upload.filename.unwrap_or_default();
    let resp = service.detect_image_upload(&filename, upload.data)?;
    Ok(Response::json(200, &resp))
}

fn detect_video(request: &HttpRequest, service: &HazardService) -> crate::Result<Response> {
    service.ensure_ready()?;
    let upload = request.upload("video")?;
    let filename = upload.filename.unwrap_or_default();
    let observer = |percent: f64| log::debug!("{filename}: {percent:.1}%");
    let resp = service.detect_video_upload(&filename, upload.data, Some(&observer))?;
    let total = resp.total_detections();
    Ok(Response {
        status: 200,
        content_type: "video/mp4",
        headers: vec![
            (TOTAL_DETECTIONS_HEADER.to_string(), total.to_string()),
            (
                "Content-Disposition".to_string(),
                format!("attachment; filename=\"{}\"", header_safe(&resp.filename)),
            ),
        ],
        body: resp.bytes,
    })
}

fn detect_frame(request: &HttpRequest, service: &HazardService) -> crate::Result<Response> {
    service.ensure_ready()?;
    let upload = request.upload("frame")?;
    let resp = service.detect_frame_upload(upload.data)?;
    Ok(Response::json(200, &resp))
}

fn error_response(err: &DetectError) -> Response {
    let status = match err {
        DetectError::ModelUnavailable(_) => 503,
        DetectError::UnsupportedFormat { .. } | DetectError::BadInput(_) => 400,
        _ => 500,
    };
    if status == 500 {
        log::error!("request failed ({}): {}", err.kind(), err);
    }
    Response::detail(status, err.to_string())
}

fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect()
}

struct Response {
    status: u16,
    content_type: &'static str,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

#[derive(Serialize)]
struct Detail<'a> {
    detail: &'a str,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                headers: Vec::new(),
                body,
            },
            Err(err) => Self::detail(500, format!("failed to encode response: {err}")),
        }
    }

    fn detail(status: u16, detail: impl AsRef<str>) -> Self {
        let body = serde_json::to_vec(&Detail {
            detail: detail.as_ref(),
        })
        .unwrap_or_else(|_| br#"{"detail":"internal error"}"#.to_vec());
        Self {
            status,
            content_type: "application/json",
            headers: Vec::new(),
            body,
        }
    }

    fn preflight(requested_headers: Option<&str>) -> Self {
        Self {
            status: 204,
            content_type: "text/plain",
            headers: vec![
                (
                    "Access-Control-Allow-Methods".to_string(),
                    "GET, POST, DELETE, OPTIONS".to_string(),
                ),
                (
                    "Access-Control-Allow-Headers".to_string(),
                    requested_headers.unwrap_or("*").to_string(),
                ),
                ("Access-Control-Max-Age".to_string(), "600".to_string()),
            ],
            body: Vec::new(),
        }
    }
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn write_response(stream: &mut TcpStream, response: &Response, cors_origin: Option<&str>) -> Result<()> {
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line(response.status),
        content_type = response.content_type,
        len = response.body.len()
    );
    if let Some(origin) = cors_origin {
        header.push_str(&format!(
            "Access-Control-Allow-Origin: {origin}\r\nAccess-Control-Allow-Credentials: true\r\nAccess-Control-Expose-Headers: {TOTAL_DETECTIONS_HEADER}\r\nVary: Origin\r\n"
        ));
    }
    for (name, value) in &response.headers {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}

struct RequestHead {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    content_length: usize,
    /// Body bytes that arrived with the headers.
    body_prefix: Vec<u8>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn expects_continue(&self) -> bool {
        self.header("expect")
            .is_some_and(|value| value.eq_ignore_ascii_case("100-continue"))
    }
}

fn read_head(stream: &mut TcpStream) -> Result<RequestHead> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers completed"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| anyhow!("invalid content-length '{value}'"))?,
        None => 0,
    };
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(RequestHead {
        method: method.to_uppercase(),
        path,
        headers,
        content_length,
        body_prefix: data[header_end + 4..].to_vec(),
    })
}

fn read_body(stream: &mut TcpStream, head: RequestHead) -> Result<HttpRequest> {
    let mut body = head.body_prefix;
    body.truncate(head.content_length);
    if body.len() < head.content_length {
        let remaining = head.content_length - body.len();
        body.reserve(remaining);
        stream
            .take(remaining as u64)
            .read_to_end(&mut body)?;
        if body.len() < head.content_length {
            return Err(anyhow!(
                "body truncated: expected {} bytes, received {}",
                head.content_length,
                body.len()
            ));
        }
    }
    Ok(HttpRequest {
        method: head.method,
        path: head.path,
        headers: head.headers,
        body,
    })
}

/// Drain an oversized body so the client sees the response, not a reset.
fn discard(stream: &mut TcpStream, content_length: usize) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let _ = std::io::copy(&mut stream.take(content_length as u64), &mut std::io::sink());
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

struct Upload<'a> {
    filename: Option<String>,
    data: &'a [u8],
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// File field `name` from a multipart body.
    fn upload(&self, name: &str) -> crate::Result<Upload<'_>> {
        let content_type = self
            .header("content-type")
            .ok_or_else(|| DetectError::BadInput("missing content-type".into()))?;
        let boundary = multipart::boundary(content_type)
            .map_err(|e| DetectError::BadInput(e.to_string()))?;
        let parts = multipart::parse(&self.body, &boundary)
            .map_err(|e| DetectError::BadInput(e.to_string()))?;
        let part = multipart::field(&parts, name)
            .ok_or_else(|| DetectError::BadInput(format!("missing form field '{name}'")))?;
        Ok(Upload {
            filename: part.filename.clone(),
            data: part.data,
        })
    }
}
