// Carretón Relay — HTTP Listener
//
// Raw TCP HTTP/1.1 listener serving the Evolution API webhook and the
// read-only monitoring endpoints:
//
//   POST /webhook/whatsapp — Evolution events, acknowledged before processing
//   GET  /health           — 200 when connected, 503 otherwise
//   GET  /status           — bot, routing and server details
//   GET  /qr               — pending QR payload, if any
//   POST /restart          — operator restart after a terminal condition
//
// Monitoring only reads the published `StatusSnapshot`; everything that
// changes engine state goes through the session queue.

use carreton_core::atoms::types::{SessionEvent, StatusSnapshot};
use carreton_core::EngineResult;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::whatsapp::webhook::translate_webhook;

/// Webhook bodies may carry inline media; anything larger is rejected.
const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

// ── Config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Idle clients are answered with 408 and dropped after this long.
    pub read_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig { bind_address: "0.0.0.0".into(), port: 8080, read_timeout_secs: 10 }
    }
}

impl ListenerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Clone)]
pub struct ListenerState {
    pub events: mpsc::Sender<SessionEvent>,
    pub status: Arc<Mutex<StatusSnapshot>>,
    /// Deadline for reading one complete request.
    pub read_timeout: Duration,
}

// ── Server Core ────────────────────────────────────────────────────────

pub async fn bind_listener(config: &ListenerConfig) -> EngineResult<TcpListener> {
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Bind {} failed: {}", addr, e))?;
    info!("[monitor] Listening on http://{}", addr);
    Ok(listener)
}

/// Accept loop. Runs until the task is aborted.
pub async fn run_listener(listener: TcpListener, state: ListenerState) -> EngineResult<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, state).await {
                        warn!("[monitor] Connection error from {}: {}", peer, e);
                    }
                });
            }
            Err(e) => warn!("[monitor] Accept error: {}", e),
        }
    }
}

// ── Connection Handler ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    fn json(status: u16, body: Value) -> Self {
        HttpResponse { status, body }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let body = self.body.to_string();
        format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            self.status,
            reason_phrase(self.status),
            body.len(),
            body
        )
        .into_bytes()
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: ListenerState,
) -> EngineResult<()> {
    let read = match tokio::time::timeout(state.read_timeout, read_request(&mut stream)).await {
        Ok(read) => read?,
        Err(_) => {
            debug!("[monitor] No complete request from {} within {:?}", peer, state.read_timeout);
            let resp = HttpResponse::json(408, json!({ "error": "request timeout" }));
            stream.write_all(&resp.to_bytes()).await?;
            return Ok(());
        }
    };
    let request = match read {
        Some(req) => req,
        None => {
            let resp = HttpResponse::json(400, json!({ "error": "malformed request" }));
            stream.write_all(&resp.to_bytes()).await?;
            return Ok(());
        }
    };
    debug!("[monitor] {} {} from {}", request.method, request.path, peer);

    if request.method == "POST" && request.path == "/webhook/whatsapp" {
        // Evolution expects a quick response; translate after acknowledging.
        let resp = HttpResponse::json(200, json!({ "received": true }));
        stream.write_all(&resp.to_bytes()).await?;
        drop(stream);
        return forward_webhook(&request.body, &state.events).await;
    }

    let response = route(&request, &state).await;
    stream.write_all(&response.to_bytes()).await?;
    Ok(())
}

async fn route(request: &HttpRequest, state: &ListenerState) -> HttpResponse {
    let now = Utc::now();
    let snapshot = state.status.lock().clone();
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            let (status, body) = health_body(&snapshot, now);
            HttpResponse::json(status, body)
        }
        ("GET", "/status") => HttpResponse::json(200, status_body(&snapshot, now)),
        ("GET", "/qr") => HttpResponse::json(200, json!({ "qr": snapshot.qr_code })),
        ("POST", "/restart") => {
            info!("[monitor] Restart requested by operator");
            match state.events.send(SessionEvent::RestartRequested).await {
                Ok(()) => HttpResponse::json(202, json!({ "restart": "requested" })),
                Err(_) => HttpResponse::json(503, json!({ "error": "session has stopped" })),
            }
        }
        _ => HttpResponse::json(404, json!({ "error": "not found" })),
    }
}

async fn forward_webhook(body: &[u8], events: &mpsc::Sender<SessionEvent>) -> EngineResult<()> {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            warn!("[whatsapp] Unparseable webhook body ({} bytes): {}", body.len(), e);
            return Ok(());
        }
    };
    for event in translate_webhook(&payload) {
        events
            .send(event)
            .await
            .map_err(|_| "Session queue closed".to_string())?;
    }
    Ok(())
}

/// Read one request: headers, then `Content-Length` bytes of body.
/// Returns `None` for anything that is not a parseable HTTP request.
async fn read_request(stream: &mut TcpStream) -> EngineResult<Option<HttpRequest>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    let header_end = loop {
        if let Some(idx) = find_header_end(&buf) {
            break idx;
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Ok(None);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let Some((method, path, content_length)) = parse_head(&buf[..header_end]) else {
        return Ok(None);
    };
    if content_length > MAX_REQUEST_BYTES {
        return Ok(None);
    }

    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = buf.len().min(body_start + content_length);

    Ok(Some(HttpRequest { method, path, body: buf[body_start..body_end].to_vec() }))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Request line and `Content-Length`. Query strings are dropped from the path.
pub(crate) fn parse_head(head: &[u8]) -> Option<(String, String, usize)> {
    let head = std::str::from_utf8(head).ok()?;
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_uppercase();
    let target = request_line.next()?;
    let path = target.split('?').next().unwrap_or(target).to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);

    Some((method, path, content_length))
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        503 => "Service Unavailable",
        _ => "",
    }
}

// ── Monitoring bodies ──────────────────────────────────────────────────

fn uptime_secs(snapshot: &StatusSnapshot, now: DateTime<Utc>) -> u64 {
    u64::try_from((now - snapshot.started_at).num_seconds()).unwrap_or(0)
}

/// `(http status, body)` for `GET /health`.
pub fn health_body(snapshot: &StatusSnapshot, now: DateTime<Utc>) -> (u16, Value) {
    let status = if snapshot.connected { 200 } else { 503 };
    let body = json!({
        "status": if snapshot.connected { "healthy" } else { "unhealthy" },
        "timestamp": now.to_rfc3339_opts(SecondsFormat::Millis, true),
        "uptime": uptime_secs(snapshot, now),
        "connected": snapshot.connected,
        "hasQR": snapshot.qr_code.is_some(),
        "reconnectAttempts": snapshot.reconnect_attempts,
    });
    (status, body)
}

pub fn status_body(snapshot: &StatusSnapshot, now: DateTime<Utc>) -> Value {
    let uptime = uptime_secs(snapshot, now);
    json!({
        "bot": {
            "connected": snapshot.connected,
            "phase": snapshot.phase,
            "phoneNumber": snapshot.self_id,
            "hasQRCode": snapshot.qr_code.is_some(),
            "reconnectAttempts": snapshot.reconnect_attempts,
            "terminal": snapshot.terminal,
            "lastCloseReason": snapshot.last_close_reason.map(|r| r.description()),
            "sendFailures": snapshot.send_failures,
        },
        "routing": {
            "source": snapshot.source_conversation_id,
            "destination": snapshot.destination_conversation_id,
            "ready": snapshot.ready,
            "registeredRequests": snapshot.registry_count,
        },
        "server": {
            "uptime": uptime,
            "uptimeFormatted": format_uptime(uptime),
            "timestamp": now.to_rfc3339_opts(SecondsFormat::Millis, true),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// `1d 2h 3m 4s`, skipping zero units; always at least seconds.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{}s", secs));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use carreton_core::atoms::types::{ConnectionPhase, TerminalCondition};
    use chrono::Duration;

    fn snapshot(connected: bool) -> StatusSnapshot {
        StatusSnapshot {
            phase: if connected { ConnectionPhase::Open } else { ConnectionPhase::Closed },
            connected,
            started_at: Utc::now() - Duration::seconds(3_725),
            ..Default::default()
        }
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(59), "59s");
        assert_eq!(format_uptime(60), "1m");
        assert_eq!(format_uptime(3_725), "1h 2m 5s");
        assert_eq!(format_uptime(86_400 + 300), "1d 5m");
        assert_eq!(format_uptime(2 * 86_400 + 3 * 3_600 + 4 * 60 + 5), "2d 3h 4m 5s");
    }

    #[test]
    fn health_reflects_connection() {
        let now = Utc::now();
        let (status, body) = health_body(&snapshot(true), now);
        assert_eq!(status, 200);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["hasQR"], false);

        let mut down = snapshot(false);
        down.qr_code = Some("2@abc".into());
        down.reconnect_attempts = 3;
        let (status, body) = health_body(&down, now);
        assert_eq!(status, 503);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["hasQR"], true);
        assert_eq!(body["reconnectAttempts"], 3);
    }

    #[test]
    fn status_includes_routing_and_uptime() {
        let mut snap = snapshot(false);
        snap.source_conversation_id = Some("A@g.us".into());
        snap.terminal = Some(TerminalCondition::ReauthRequired);
        snap.registry_count = 4;
        let body = status_body(&snap, snap.started_at + Duration::seconds(3_725));
        assert_eq!(body["routing"]["source"], "A@g.us");
        assert_eq!(body["routing"]["destination"], Value::Null);
        assert_eq!(body["routing"]["ready"], false);
        assert_eq!(body["routing"]["registeredRequests"], 4);
        assert_eq!(body["bot"]["terminal"], "reauth_required");
        assert_eq!(body["server"]["uptime"], 3_725);
        assert_eq!(body["server"]["uptimeFormatted"], "1h 2m 5s");
    }

    #[test]
    fn parses_request_head() {
        let head = b"POST /webhook/whatsapp?x=1 HTTP/1.1\r\nHost: relay\r\ncontent-length: 42";
        assert_eq!(parse_head(head), Some(("POST".into(), "/webhook/whatsapp".into(), 42)));

        let head = b"get /health HTTP/1.1\r\nHost: relay";
        assert_eq!(parse_head(head), Some(("GET".into(), "/health".into(), 0)));

        assert_eq!(parse_head(b""), None);
    }

    #[test]
    fn response_serialization() {
        let bytes = HttpResponse::json(503, json!({ "ok": false })).to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("Content-Length: 12\r\n"));
        assert!(text.ends_with("{\"ok\":false}"));
    }
}
