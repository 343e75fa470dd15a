//! HTTP façade — thin local API over the overlay core.
//!
//! Endpoints (all under /api/v0):
//!   GET  /id                    — local identity descriptor
//!   GET  /peers                 — remote registry contents
//!   POST /peer                  — resolve a peer's identity by node id
//!   POST /chat/completion       — chat call, direct (node_id required)
//!   POST /chat/completion/proxy — chat call, ranked peer selection
//!   POST /image/gen             — image call, direct
//!   POST /image/gen/proxy       — image call, ranked selection, tunneled
//!
//! Every response body is `{code, message, data}`; the HTTP status is
//! derived from the code, never from the underlying overlay detail.

use crate::envelope::MessageType;
use crate::error::{code, OverlayError};
use crate::node::{ModelCall, OverlayNode};
use crate::registry::ModelKind;
use crate::store::PeerEntry;
use iroh::NodeId;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Deserialize)]
struct PeerBody {
    node_id: String,
}

#[derive(Deserialize)]
struct CallBody {
    #[serde(default)]
    node_id: String,
    project: String,
    model: String,
    #[serde(default)]
    payload: serde_json::Value,
    /// Streaming routes over the direct tunnel instead of gossip.
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct PeerRow {
    node_id: String,
    timestamp: i64,
    flags: u32,
    projects: std::collections::HashMap<String, Vec<String>>,
}

impl PeerRow {
    fn from_entry(node_id: String, entry: PeerEntry) -> Self {
        PeerRow {
            node_id,
            timestamp: entry.timestamp,
            flags: entry.flags.0,
            projects: entry.projects,
        }
    }
}

/// Start the façade listener. Runs until the process exits.
pub async fn start(port: u16, node: OverlayNode, listen_all: bool) {
    let addr = if listen_all { "0.0.0.0" } else { "127.0.0.1" };
    let listener = match TcpListener::bind(format!("{addr}:{port}")).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("façade: failed to bind :{port}: {e}");
            return;
        }
    };
    tracing::info!("façade on http://localhost:{port}/api/v0");

    loop {
        let Ok((stream, _)) = listener.accept().await else { continue };
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_request(stream, node).await {
                tracing::debug!("façade connection error: {e}");
            }
        });
    }
}

// ── Request dispatch ──

async fn handle_request(mut stream: TcpStream, node: OverlayNode) -> anyhow::Result<()> {
    let raw = match read_request(&mut stream).await {
        Ok(r) => r,
        Err(e) => {
            respond_err(&mut stream, &OverlayError::Parse(e.to_string())).await?;
            return Ok(());
        }
    };
    let head = String::from_utf8_lossy(&raw.head).into_owned();
    let mut parts = head.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("/");

    match (method, path) {
        ("GET", "/api/v0/id") => {
            let identity = node.local_identity().await;
            respond_ok(&mut stream, serde_json::to_value(identity)?).await?;
        }

        ("GET", "/api/v0/peers") => match node.store().all_peers().await {
            Ok(peers) => {
                let rows: Vec<PeerRow> = peers
                    .into_iter()
                    .map(|(id, entry)| PeerRow::from_entry(id, entry))
                    .collect();
                respond_ok(&mut stream, serde_json::to_value(rows)?).await?;
            }
            Err(e) => {
                respond_err(&mut stream, &OverlayError::Internal(e.to_string())).await?;
            }
        },

        ("POST", "/api/v0/peer") => {
            let body: PeerBody = match serde_json::from_slice(&raw.body) {
                Ok(b) => b,
                Err(e) => {
                    respond_err(&mut stream, &OverlayError::Parameter(e.to_string())).await?;
                    return Ok(());
                }
            };
            let peer = match body.node_id.parse::<NodeId>() {
                Ok(p) => p,
                Err(_) => {
                    respond_err(
                        &mut stream,
                        &OverlayError::Parameter(format!("bad node id: {}", body.node_id)),
                    )
                    .await?;
                    return Ok(());
                }
            };
            match node.identity_of(peer).await {
                Ok(identity) => respond_ok(&mut stream, serde_json::to_value(identity)?).await?,
                Err(e) => respond_err(&mut stream, &e).await?,
            }
        }

        ("POST", "/api/v0/chat/completion") => {
            serve_direct_call(&mut stream, &node, &raw, ModelKind::Chat).await?;
        }
        ("POST", "/api/v0/image/gen") => {
            serve_direct_call(&mut stream, &node, &raw, ModelKind::Image).await?;
        }

        ("POST", "/api/v0/chat/completion/proxy") => {
            serve_proxy_call(&mut stream, &node, &raw.body, MessageType::ChatCompletionRequest)
                .await?;
        }
        ("POST", "/api/v0/image/gen/proxy") => {
            serve_proxy_stream(&mut stream, &node, &raw.body, ModelKind::Image).await?;
        }

        _ => {
            respond_err(&mut stream, &OverlayError::NotFound(path.to_string())).await?;
        }
    }
    Ok(())
}

async fn serve_direct_call(
    stream: &mut TcpStream,
    node: &OverlayNode,
    raw: &RawRequest,
    kind: ModelKind,
) -> anyhow::Result<()> {
    let body: CallBody = match serde_json::from_slice(&raw.body) {
        Ok(b) => b,
        Err(e) => {
            respond_err(stream, &OverlayError::Parameter(e.to_string())).await?;
            return Ok(());
        }
    };
    if body.node_id.is_empty() {
        respond_err(stream, &OverlayError::Parameter("node_id is required".to_string())).await?;
        return Ok(());
    }
    let peer = match body.node_id.parse::<NodeId>() {
        Ok(p) => p,
        Err(_) => {
            respond_err(
                stream,
                &OverlayError::Parameter(format!("bad node id: {}", body.node_id)),
            )
            .await?;
            return Ok(());
        }
    };
    let call = ModelCall {
        project: body.project,
        model: body.model,
        payload: body.payload,
    };

    // Image generation always takes the tunnel; its responses are too large
    // for the broadcast path.
    let streaming =
        (kind == ModelKind::Image || body.stream.unwrap_or(false)) && peer != node.id();
    if streaming {
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let mut written = 0u64;
        let result = node
            .stream_model(peer, kind, &call, &headers, stream, &mut written)
            .await;
        finish_stream(stream, result, written).await?;
        return Ok(());
    }

    let message_type = match kind {
        ModelKind::Chat => MessageType::ChatCompletionRequest,
        ModelKind::Image => MessageType::ImageGenerationRequest,
    };
    match node.call_model(peer, message_type, &call).await {
        Ok(value) => respond_ok(stream, value).await?,
        Err(e) => respond_err(stream, &e).await?,
    }
    Ok(())
}

async fn serve_proxy_call(
    stream: &mut TcpStream,
    node: &OverlayNode,
    body: &[u8],
    message_type: MessageType,
) -> anyhow::Result<()> {
    let body: CallBody = match serde_json::from_slice(body) {
        Ok(b) => b,
        Err(e) => {
            respond_err(stream, &OverlayError::Parameter(e.to_string())).await?;
            return Ok(());
        }
    };
    if !body.node_id.is_empty() {
        respond_err(
            stream,
            &OverlayError::Parameter("proxy calls must not carry node_id".to_string()),
        )
        .await?;
        return Ok(());
    }
    let call = ModelCall {
        project: body.project,
        model: body.model,
        payload: body.payload,
    };
    match node.proxy_model_call(message_type, &call).await {
        Ok(value) => respond_ok(stream, value).await?,
        Err(e) => respond_err(stream, &e).await?,
    }
    Ok(())
}

/// Proxy variant for streaming kinds: candidate selection stays with the
/// ranking, but the response rides the direct tunnel instead of gossip.
async fn serve_proxy_stream(
    stream: &mut TcpStream,
    node: &OverlayNode,
    body: &[u8],
    kind: ModelKind,
) -> anyhow::Result<()> {
    let body: CallBody = match serde_json::from_slice(body) {
        Ok(b) => b,
        Err(e) => {
            respond_err(stream, &OverlayError::Parameter(e.to_string())).await?;
            return Ok(());
        }
    };
    if !body.node_id.is_empty() {
        respond_err(
            stream,
            &OverlayError::Parameter("proxy calls must not carry node_id".to_string()),
        )
        .await?;
        return Ok(());
    }
    let call = ModelCall {
        project: body.project,
        model: body.model,
        payload: body.payload,
    };
    let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    let mut written = 0u64;
    let result = node
        .proxy_model_stream(kind, &call, &headers, stream, &mut written)
        .await;
    finish_stream(stream, result, written).await?;
    Ok(())
}

/// Close out a streaming call. An error body only makes sense on a clean
/// socket; once response bytes have gone out the connection is dropped
/// as-is rather than having an error appended to a partial response.
async fn finish_stream(
    stream: &mut TcpStream,
    result: Result<(), OverlayError>,
    written: u64,
) -> anyhow::Result<()> {
    if let Err(e) = result {
        if written == 0 {
            respond_err(stream, &e).await?;
        } else {
            tracing::warn!("stream failed after {written} bytes: {e}");
        }
    }
    Ok(())
}

// ── HTTP plumbing ──

struct RawRequest {
    head: Vec<u8>,
    body: Vec<u8>,
}

/// Read one HTTP request: head up to the blank line, then Content-Length
/// bytes of body.
async fn read_request(stream: &mut TcpStream) -> anyhow::Result<RawRequest> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_BODY_BYTES {
            anyhow::bail!("request head too large");
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed mid-request");
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = buf[..head_end].to_vec();
    let mut body = buf[head_end + 4..].to_vec();

    let content_length = String::from_utf8_lossy(&head)
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        anyhow::bail!("request body too large");
    }
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed mid-body");
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(RawRequest { head, body })
}

async fn respond_ok(stream: &mut TcpStream, data: serde_json::Value) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "code": code::OK,
        "message": "ok",
        "data": data,
    })
    .to_string();
    respond(stream, 200, "OK", &body).await
}

async fn respond_err(stream: &mut TcpStream, err: &OverlayError) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "code": err.code(),
        "message": err.to_string(),
    })
    .to_string();
    let status = err.http_status();
    respond(stream, status, status_text(status), &body).await
}

async fn respond(
    stream: &mut TcpStream,
    status: u16,
    status_text: &str,
    body: &str,
) -> anyhow::Result<()> {
    let resp = format!(
        "HTTP/1.1 {status} {status_text}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(resp.as_bytes()).await?;
    Ok(())
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Internal Server Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_body_defaults() {
        let body: CallBody =
            serde_json::from_str(r#"{"project":"p","model":"m"}"#).unwrap();
        assert!(body.node_id.is_empty());
        assert!(body.payload.is_null());
        assert!(body.stream.is_none());
    }

    #[test]
    fn status_text_covers_facade_codes() {
        for status in [200u16, 400, 404, 500, 502, 504] {
            assert!(!status_text(status).is_empty());
        }
        assert_eq!(status_text(418), "Internal Server Error");
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        (server, client.await.unwrap())
    }

    #[tokio::test]
    async fn stream_failure_on_clean_socket_gets_an_error_body() {
        let (mut server, mut client) = socket_pair().await;
        finish_stream(&mut server, Err(OverlayError::Timeout), 0)
            .await
            .unwrap();
        drop(server);
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 504"));
        assert!(text.contains("timed out"));
    }

    #[tokio::test]
    async fn stream_failure_after_partial_output_writes_nothing_more() {
        let (mut server, mut client) = socket_pair().await;
        finish_stream(&mut server, Err(OverlayError::Timeout), 512)
            .await
            .unwrap();
        drop(server);
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn read_request_assembles_split_body() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"POST /api/v0/peer HTTP/1.1\r\nContent-Length: 11\r\n\r\n")
                .await
                .unwrap();
            // Body arrives in a second write.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stream.write_all(b"{\"a\":\"bc\"}X").await.unwrap();
            stream
        });
        let (mut accepted, _) = listener.accept().await.unwrap();
        let raw = read_request(&mut accepted).await.unwrap();
        assert!(raw.head.starts_with(b"POST /api/v0/peer"));
        assert_eq!(raw.body, b"{\"a\":\"bc\"}X");
        let _ = writer.await;
    }
}
