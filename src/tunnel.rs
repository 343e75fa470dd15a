//! Direct HTTP-over-QUIC tunnel for streaming model calls.
//!
//! The initiator opens a bi-stream to the hosting peer and writes one raw
//! HTTP/1.1 request; `project`, `model`, and an optional content id ride in
//! the query string. The responder resolves the model locally, relays the
//! call to the model's own HTTP endpoint over TCP, and streams the raw
//! response back on the same bi-stream. No framing beyond the stream's own
//! open and close. Any failure before a complete response resets the stream
//! rather than writing a partial one.

use crate::error::OverlayError;
use crate::gate::{ConnectionGate, Decision, Direction};
use crate::registry::{LocalRegistry, ModelKind};
use iroh::endpoint::Connection;
use iroh::NodeId;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const ALPN: &[u8] = b"modelmesh/tunnel/0";

pub const CHAT_DEADLINE: Duration = Duration::from_secs(120);
/// Image generation is slow; give it room.
pub const IMAGE_DEADLINE: Duration = Duration::from_secs(300);

const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

pub fn deadline_for(kind: ModelKind) -> Duration {
    match kind {
        ModelKind::Chat => CHAT_DEADLINE,
        ModelKind::Image => IMAGE_DEADLINE,
    }
}

/// A parsed tunnel request as read off the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelRequest {
    pub project: String,
    pub model: String,
    /// Optional content-addressed identifier, forwarded untouched.
    pub id: Option<String>,
    /// Original client headers, minus hop-by-hop ones we rewrite.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn decode_component(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(h), Some(l)) = (
                bytes.get(i + 1).and_then(|c| (*c as char).to_digit(16)),
                bytes.get(i + 2).and_then(|c| (*c as char).to_digit(16)),
            ) {
                out.push((h * 16 + l) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Serialize one tunnel request as raw HTTP/1.1 bytes.
pub fn encode_request(
    project: &str,
    model: &str,
    id: Option<&str>,
    headers: &[(String, String)],
    body: &[u8],
) -> Vec<u8> {
    let mut query = format!(
        "project={}&model={}",
        encode_component(project),
        encode_component(model)
    );
    if let Some(id) = id {
        query.push_str("&id=");
        query.push_str(&encode_component(id));
    }
    let mut out = format!("POST /api/v0/invoke?{query} HTTP/1.1\r\nHost: tunnel\r\n").into_bytes();
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || lower == "content-length" || lower == "connection" {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(
        format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()).as_bytes(),
    );
    out.extend_from_slice(body);
    out
}

/// Parse a raw tunnel request. Rejects anything that is not a well-formed
/// POST with `project` and `model` query parameters.
pub fn parse_request(bytes: &[u8]) -> Result<TunnelRequest, OverlayError> {
    let head_end = find_head_end(bytes)
        .ok_or_else(|| OverlayError::Parse("incomplete http head".to_string()))?;
    let head = std::str::from_utf8(&bytes[..head_end])
        .map_err(|_| OverlayError::Parse("http head is not utf-8".to_string()))?;
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| OverlayError::Parse("empty request".to_string()))?;

    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("");
    let target = parts
        .next()
        .ok_or_else(|| OverlayError::Parse("bad request line".to_string()))?;
    if method != "POST" {
        return Err(OverlayError::Parse(format!("unsupported method {method}")));
    }

    let query = target.split_once('?').map(|(_, q)| q).unwrap_or("");
    let mut project = None;
    let mut model = None;
    let mut id = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "project" => project = Some(decode_component(value)),
            "model" => model = Some(decode_component(value)),
            "id" => id = Some(decode_component(value)),
            _ => {}
        }
    }
    let project =
        project.ok_or_else(|| OverlayError::Parameter("missing project".to_string()))?;
    let model = model.ok_or_else(|| OverlayError::Parameter("missing model".to_string()))?;
    if project.is_empty() || model.is_empty() {
        return Err(OverlayError::Parameter("empty project or model".to_string()));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| OverlayError::Parse(format!("bad header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let body = bytes[head_end + 4..].to_vec();
    Ok(TunnelRequest {
        project,
        model,
        id,
        headers,
        body,
    })
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Split `http://host:port/path` into (authority, path).
fn split_endpoint(url: &str) -> Result<(String, String), OverlayError> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| OverlayError::Parameter(format!("unsupported endpoint url: {url}")))?;
    match rest.split_once('/') {
        Some((authority, path)) => Ok((authority.to_string(), format!("/{path}"))),
        None => Ok((rest.to_string(), "/".to_string())),
    }
}

/// Streaming tunnel: write the request on an established session, then copy
/// response bytes to the client's TCP socket as they arrive. `written`
/// tracks bytes already copied to the client so callers know whether the
/// socket is still clean enough to carry an error response. The whole
/// exchange shares one deadline; on timeout the client connection is simply
/// dropped.
pub async fn relay_to_client(
    conn: &Connection,
    kind: ModelKind,
    request: &[u8],
    client: &mut TcpStream,
    written: &mut u64,
) -> Result<(), OverlayError> {
    let deadline = deadline_for(kind);
    let fut = async {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| OverlayError::Overlay(format!("tunnel open failed: {e}")))?;
        send.write_all(request)
            .await
            .map_err(|e| OverlayError::Overlay(format!("tunnel write failed: {e}")))?;
        send.finish()
            .map_err(|e| OverlayError::Overlay(format!("tunnel finish failed: {e}")))?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            match recv.read(&mut buf).await {
                Ok(Some(n)) => {
                    client
                        .write_all(&buf[..n])
                        .await
                        .map_err(|e| OverlayError::Overlay(format!("client write failed: {e}")))?;
                    total += n as u64;
                    *written += n as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(OverlayError::Overlay(format!("tunnel read failed: {e}")));
                }
            }
        }
        if total == 0 {
            return Err(OverlayError::Overlay("tunnel stream reset by peer".to_string()));
        }
        Ok(())
    };
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| OverlayError::Timeout)?
}

/// Responder side: accepts tunnel connections, resolves the model locally,
/// and relays the HTTP exchange to the model's own endpoint.
#[derive(Debug, Clone)]
pub struct TunnelHandler {
    registry: LocalRegistry,
    gate: ConnectionGate,
}

impl TunnelHandler {
    pub fn new(registry: LocalRegistry, gate: ConnectionGate) -> Self {
        TunnelHandler { registry, gate }
    }

    async fn serve_connection(&self, conn: Connection) {
        let remote = match conn.remote_node_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("tunnel connection without node id: {e}");
                conn.close(1u32.into(), b"unidentified");
                return;
            }
        };
        if self.gate.decide(Direction::Inbound, &remote.to_string()).await == Decision::Deny {
            conn.close(1u32.into(), b"denied");
            return;
        }
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::debug!("tunnel connection from {} closed: {e}", remote.fmt_short());
                    break;
                }
            };
            let handler = self.clone();
            tokio::spawn(async move {
                handler.serve_stream(send, recv, remote).await;
            });
        }
    }

    async fn serve_stream(
        &self,
        mut send: iroh::endpoint::SendStream,
        mut recv: iroh::endpoint::RecvStream,
        remote: NodeId,
    ) {
        match self.run_exchange(&mut send, &mut recv, remote).await {
            Ok(bytes) => {
                tracing::debug!("tunnel exchange with {} done, {bytes} response bytes", remote.fmt_short());
            }
            Err(e) => {
                tracing::warn!("tunnel exchange with {} failed: {e}", remote.fmt_short());
                // Abnormal close; never leave a partial response on the stream.
                let _ = send.reset(1u32.into());
            }
        }
    }

    async fn run_exchange(
        &self,
        send: &mut iroh::endpoint::SendStream,
        recv: &mut iroh::endpoint::RecvStream,
        remote: NodeId,
    ) -> Result<u64, OverlayError> {
        let raw = recv
            .read_to_end(MAX_REQUEST_BYTES)
            .await
            .map_err(|e| OverlayError::Parse(format!("tunnel request read failed: {e}")))?;
        let request = parse_request(&raw)?;

        let (record, _idle) = self
            .registry
            .begin_invocation(&request.project, &request.model)
            .ok_or_else(|| {
                OverlayError::NotFound(format!("{}/{}", request.project, request.model))
            })?;

        tracing::info!(
            "tunnel: {} → {}/{} ({})",
            remote.fmt_short(),
            request.project,
            request.model,
            record.api_endpoint
        );

        let deadline = deadline_for(record.kind);
        let fut = relay_upstream(&record.api_endpoint, &request, send);
        tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| OverlayError::Timeout)?
    }
}

/// Issue the real HTTP call against the local model endpoint and stream the
/// raw response back onto the tunnel. Returns response bytes written.
async fn relay_upstream(
    api_endpoint: &str,
    request: &TunnelRequest,
    send: &mut iroh::endpoint::SendStream,
) -> Result<u64, OverlayError> {
    let (authority, path) = split_endpoint(api_endpoint)?;
    let mut upstream = TcpStream::connect(&authority)
        .await
        .map_err(|e| OverlayError::Upstream(format!("connect {authority} failed: {e}")))?;
    upstream
        .set_nodelay(true)
        .map_err(|e| OverlayError::Upstream(e.to_string()))?;

    let mut head = format!("POST {path} HTTP/1.1\r\nHost: {authority}\r\n");
    for (name, value) in &request.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || lower == "content-length" || lower == "connection" {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        request.body.len()
    ));

    upstream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| OverlayError::Upstream(format!("upstream write failed: {e}")))?;
    upstream
        .write_all(&request.body)
        .await
        .map_err(|e| OverlayError::Upstream(format!("upstream write failed: {e}")))?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = upstream
            .read(&mut buf)
            .await
            .map_err(|e| OverlayError::Upstream(format!("upstream read failed: {e}")))?;
        if n == 0 {
            break;
        }
        send.write_all(&buf[..n])
            .await
            .map_err(|e| OverlayError::Overlay(format!("tunnel write-back failed: {e}")))?;
        total += n as u64;
    }
    if total == 0 {
        return Err(OverlayError::Upstream("empty upstream response".to_string()));
    }
    send.finish()
        .map_err(|e| OverlayError::Overlay(format!("tunnel finish failed: {e}")))?;
    Ok(total)
}

impl iroh::protocol::ProtocolHandler for TunnelHandler {
    async fn accept(
        &self,
        connection: Connection,
    ) -> Result<(), iroh::protocol::AcceptError> {
        self.serve_connection(connection).await;
        Ok(())
    }
}
