//! Overlay node — owns the transport endpoint, the gossip service, the
//! correlation queue, and the serving of inbound model requests.
//!
//! Outbound calls come in two shapes. Non-streaming model calls are sealed,
//! wrapped in an envelope, broadcast on the shared topic, and the caller
//! parks on a correlation slot until the response envelope comes back.
//! Streaming calls bypass gossip entirely and go over the direct tunnel.

use crate::correlate::CorrelationQueue;
use crate::envelope::{Envelope, MessageType};
use crate::error::{code, OverlayError};
use crate::gate::{ConnectionGate, Decision, Direction};
use crate::gossip::{GossipContext, HeartbeatService, PeerLoadCache};
use crate::ranking::{self, Candidate};
use crate::registry::LocalRegistry;
use crate::store::RegistryStore;
use crate::{seal, tunnel};
use anyhow::Result;
use base64::Engine as _;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use iroh::{Endpoint, NodeAddr, NodeId, SecretKey};
use iroh_gossip::api::GossipSender;
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub const PROTOCOL_VERSION: u32 = 1;
pub const AGENT: &str = concat!("modelmesh/", env!("CARGO_PKG_VERSION"));

const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);
const MAX_CANDIDATES: usize = 16;
const REQUEST_QUEUE_DEPTH: usize = 64;

pub struct NodeConfig {
    pub secret: SecretKey,
    pub bind_port: Option<u16>,
    pub relay_urls: Vec<String>,
    /// Invite tokens of peers to dial at startup; their ids seed the gossip
    /// swarm.
    pub join_tokens: Vec<String>,
    pub collect_metadata: bool,
    pub public_node: bool,
    pub client_project: String,
    pub heartbeat: Duration,
    pub db_path: PathBuf,
}

/// A model invocation as carried (sealed) inside request envelopes and
/// accepted by the HTTP façade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCall {
    pub project: String,
    pub model: String,
    /// Opaque upstream payload, forwarded to the model endpoint untouched.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Identity descriptor returned by `/api/v0/id` and identity exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub node_id: String,
    pub agent: String,
    pub protocol_version: u32,
    pub protocols: Vec<String>,
    pub addrs: Vec<String>,
}

#[derive(Clone)]
pub struct OverlayNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    endpoint: Endpoint,
    router: iroh::protocol::Router,
    secret: SecretKey,
    registry: LocalRegistry,
    store: RegistryStore,
    loads: PeerLoadCache,
    correlate: CorrelationQueue,
    sender: GossipSender,
    heartbeat: Mutex<Option<HeartbeatService>>,
    sessions: Mutex<HashMap<NodeId, Connection>>,
    /// Last measured round-trip per peer; survives session loss so ranking
    /// can still consider recently seen peers.
    last_rtt: std::sync::Mutex<HashMap<NodeId, u32>>,
    http: reqwest::Client,
    cancel: CancellationToken,
}

impl OverlayNode {
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let store = RegistryStore::open(config.db_path.clone())?;
        let registry = LocalRegistry::new();
        let loads = PeerLoadCache::default();
        let correlate = CorrelationQueue::new();

        let mut transport_config = iroh::endpoint::TransportConfig::default();
        transport_config.max_concurrent_bidi_streams(256u32.into());
        transport_config.max_idle_timeout(Some(Duration::from_secs(30).try_into()?));
        transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
        let mut builder = Endpoint::builder()
            .secret_key(config.secret.clone())
            .alpns(vec![GOSSIP_ALPN.to_vec(), tunnel::ALPN.to_vec()])
            .transport_config(transport_config);

        if !config.relay_urls.is_empty() {
            use iroh::{RelayMap, RelayNode};
            let nodes: Vec<RelayNode> = config
                .relay_urls
                .iter()
                .map(|url| -> Result<RelayNode> {
                    Ok(RelayNode { url: url.parse()?, quic: None })
                })
                .collect::<Result<_>>()?;
            builder = builder.relay_mode(iroh::RelayMode::Custom(RelayMap::from_iter(nodes)));
        }
        if let Some(port) = config.bind_port {
            builder = builder
                .bind_addr_v4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port));
        }
        let endpoint = builder.bind().await?;
        tracing::info!("overlay node id: {}", endpoint.node_id());

        let gossip = Gossip::builder().spawn(endpoint.clone());
        let gate = ConnectionGate::new(config.collect_metadata, &config.client_project, store.clone());
        let tunnel_handler = tunnel::TunnelHandler::new(registry.clone(), gate.clone());
        // Both ALPNs pass the gate; gossip sessions are admission-checked the
        // same way tunnel sessions are.
        let gated_gossip = GatedGossip { gate, inner: gossip.clone() };
        let router = iroh::protocol::Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gated_gossip)
            .accept(tunnel::ALPN, tunnel_handler)
            .spawn();

        // Dial invite tokens; connected ids bootstrap the gossip swarm.
        let mut bootstrap = Vec::new();
        for token in &config.join_tokens {
            match decode_invite(token) {
                Ok(addr) => {
                    let id = addr.node_id;
                    match endpoint.connect(addr, GOSSIP_ALPN).await {
                        Ok(_) => {
                            tracing::info!("joined via {}", id.fmt_short());
                            bootstrap.push(id);
                        }
                        Err(e) => tracing::warn!("join dial to {} failed: {e}", id.fmt_short()),
                    }
                }
                Err(e) => tracing::warn!("bad invite token: {e}"),
            }
        }

        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let ctx = GossipContext {
            secret: config.secret.clone(),
            collect_metadata: config.collect_metadata,
            public_node: config.public_node,
            registry: registry.clone(),
            store: store.clone(),
            loads: loads.clone(),
            correlate: correlate.clone(),
            requests: requests_tx,
        };
        let heartbeat = HeartbeatService::spawn(&gossip, bootstrap, config.heartbeat, ctx).await?;
        let sender = heartbeat.sender();

        let node = OverlayNode {
            inner: Arc::new(NodeInner {
                endpoint,
                router,
                secret: config.secret,
                registry,
                store,
                loads,
                correlate,
                sender,
                heartbeat: Mutex::new(Some(heartbeat)),
                sessions: Mutex::new(HashMap::new()),
                last_rtt: std::sync::Mutex::new(HashMap::new()),
                http: reqwest::Client::new(),
                cancel: CancellationToken::new(),
            }),
        };

        let server = node.clone();
        tokio::spawn(async move {
            server.serve_requests(requests_rx).await;
        });
        let pinger = node.clone();
        tokio::spawn(async move {
            pinger.liveness_loop().await;
        });

        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.inner.endpoint.node_id()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn registry(&self) -> &LocalRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &RegistryStore {
        &self.inner.store
    }

    /// Shareable dial token for this node.
    pub fn invite_token(&self) -> String {
        let addr = self.inner.endpoint.node_addr();
        let json = serde_json::to_vec(&addr).expect("serializable");
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&json)
    }

    pub async fn local_identity(&self) -> IdentityInfo {
        let addr = self.inner.endpoint.node_addr();
        let addrs = addr.direct_addresses.iter().map(|a| a.to_string()).collect();
        IdentityInfo {
            node_id: self.id().to_string(),
            agent: AGENT.to_string(),
            protocol_version: PROTOCOL_VERSION,
            protocols: vec![
                String::from_utf8_lossy(GOSSIP_ALPN).into_owned(),
                String::from_utf8_lossy(tunnel::ALPN).into_owned(),
            ],
            addrs,
        }
    }

    /// Resolve a peer's identity descriptor; direct return for self, else
    /// a broadcast round-trip. Identity exchanges are plaintext.
    pub async fn identity_of(&self, peer: NodeId) -> Result<IdentityInfo, OverlayError> {
        if peer == self.id() {
            return Ok(self.local_identity().await);
        }
        let reply = self
            .broadcast_request(MessageType::PeerIdentityRequest, peer, b"{}".to_vec())
            .await?;
        if reply.result_code != code::OK {
            return Err(OverlayError::Upstream(format!(
                "peer error {}: {}",
                reply.result_code, reply.result_message
            )));
        }
        serde_json::from_slice(reply.body.payload())
            .map_err(|e| OverlayError::Parse(format!("bad identity payload: {e}")))
    }

    /// Non-streaming model call. Local dispatch for self; otherwise sealed
    /// and routed over the broadcast topic.
    pub async fn call_model(
        &self,
        peer: NodeId,
        message_type: MessageType,
        call: &ModelCall,
    ) -> Result<serde_json::Value, OverlayError> {
        if peer == self.id() {
            return self.invoke_local(call).await;
        }
        let plaintext = serde_json::to_vec(call)
            .map_err(|e| OverlayError::Parse(format!("bad call payload: {e}")))?;
        let sealed = seal::seal(&self.inner.secret, &peer, &plaintext)?;
        let reply = self.broadcast_request(message_type, peer, sealed).await?;
        if reply.result_code != code::OK {
            return Err(OverlayError::Upstream(format!(
                "peer error {}: {}",
                reply.result_code, reply.result_message
            )));
        }
        let plain = seal::unseal(&self.inner.secret, &peer, reply.body.payload())?;
        serde_json::from_slice(&plain)
            .map_err(|e| OverlayError::Parse(format!("bad model response: {e}")))
    }

    /// Streaming model call over the direct tunnel; the raw HTTP response is
    /// copied to `client` as it arrives, with `written` counting the bytes
    /// already handed to the client.
    pub async fn stream_model(
        &self,
        peer: NodeId,
        kind: crate::registry::ModelKind,
        call: &ModelCall,
        headers: &[(String, String)],
        client: &mut tokio::net::TcpStream,
        written: &mut u64,
    ) -> Result<(), OverlayError> {
        if peer == self.id() {
            return Err(OverlayError::Parameter(
                "streaming to self goes through the local endpoint".to_string(),
            ));
        }
        let body = serde_json::to_vec(&call.payload)
            .map_err(|e| OverlayError::Parse(format!("bad call payload: {e}")))?;
        let request = tunnel::encode_request(&call.project, &call.model, None, headers, &body);
        let conn = self.connect(peer).await?;
        let result = tunnel::relay_to_client(&conn, kind, &request, client, written).await;
        if result.is_err() {
            // A failed exchange taints the session; drop it so the next call
            // dials fresh.
            self.inner.sessions.lock().await.remove(&peer);
            self.note_dial_outcome(peer, false).await;
        }
        result
    }

    /// Proxy call: rank candidates from the registry and retry across them.
    pub async fn proxy_model_call(
        &self,
        message_type: MessageType,
        call: &ModelCall,
    ) -> Result<serde_json::Value, OverlayError> {
        let candidates = self.candidates(&call.project, &call.model).await?;
        let ranked = ranking::rank(candidates, false);
        let what = format!("{}/{}", call.project, call.model);
        let node = self.clone();
        ranking::failover(&what, &ranked, move |candidate| {
            let node = node.clone();
            let call = call.clone();
            async move {
                let peer: NodeId = candidate
                    .node_id
                    .parse()
                    .map_err(|_| OverlayError::Parse("bad peer id in registry".to_string()))?;
                node.call_model(peer, message_type, &call).await
            }
        })
        .await
    }

    /// Streaming proxy: rank hosting peers that hold a live session and retry
    /// across them over the direct tunnel. Once any response bytes have
    /// reached the client a failed attempt cannot be cleanly retried; the
    /// error comes straight back and the caller drops the connection.
    pub async fn proxy_model_stream(
        &self,
        kind: crate::registry::ModelKind,
        call: &ModelCall,
        headers: &[(String, String)],
        client: &mut tokio::net::TcpStream,
        written: &mut u64,
    ) -> Result<(), OverlayError> {
        let candidates = self.candidates(&call.project, &call.model).await?;
        let ranked = ranking::rank(candidates, true);
        if ranked.is_empty() {
            return Err(OverlayError::NoReachablePeers(format!(
                "{}/{}",
                call.project, call.model
            )));
        }
        let mut failures = 0u32;
        for candidate in ranked {
            let peer: NodeId = candidate
                .node_id
                .parse()
                .map_err(|_| OverlayError::Parse("bad peer id in registry".to_string()))?;
            match self.stream_model(peer, kind, call, headers, client, written).await {
                Ok(()) => return Ok(()),
                Err(e) if *written > 0 => {
                    // Partial response already on the client socket.
                    return Err(e);
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        "stream candidate {} failed ({failures}/{}): {e}",
                        candidate.node_id,
                        ranking::MAX_PROXY_FAILURES
                    );
                    if failures >= ranking::MAX_PROXY_FAILURES {
                        break;
                    }
                }
            }
        }
        Err(OverlayError::ProxyExhausted { attempts: failures })
    }

    /// Build the ranking input for one (project, model).
    pub async fn candidates(
        &self,
        project: &str,
        model: &str,
    ) -> Result<Vec<Candidate>, OverlayError> {
        let peer_ids = self
            .inner
            .store
            .find_peers(project, model, MAX_CANDIDATES)
            .await
            .map_err(|e| OverlayError::Internal(e.to_string()))?;

        let mut out = Vec::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            let Ok(id) = peer_id.parse::<NodeId>() else {
                tracing::warn!("registry holds unparseable peer id {peer_id}");
                continue;
            };
            // A peer we have never dialed ranks on nothing; dial once so the
            // session and its RTT feed the ranking. Failures are recorded by
            // connect and leave the candidate at (0, 0).
            if self.cached_rtt(id) == 0 {
                let _ = self.connect(id).await;
            }
            let (connectivity, latency_ms) = self.connectivity_of(id).await;
            out.push(Candidate {
                node_id: peer_id.clone(),
                connectivity,
                latency_ms,
                idle_count: self.inner.loads.idle_count(&peer_id, project, model),
            });
        }
        Ok(out)
    }

    /// (connectivity, latency_ms) for one peer: live session RTT when
    /// connected, last measured RTT otherwise, 0 when never measured.
    async fn connectivity_of(&self, peer: NodeId) -> (u8, u32) {
        let live = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .get(&peer)
                .filter(|c| c.close_reason().is_none())
                .map(conn_rtt_ms)
        };
        if let Some(rtt) = live {
            self.inner
                .last_rtt
                .lock()
                .expect("rtt mutex poisoned")
                .insert(peer, rtt);
            return (1, rtt);
        }
        (0, self.cached_rtt(peer))
    }

    fn cached_rtt(&self, peer: NodeId) -> u32 {
        self.inner
            .last_rtt
            .lock()
            .expect("rtt mutex poisoned")
            .get(&peer)
            .copied()
            .unwrap_or(0)
    }

    /// Dial (or reuse) a tunnel session to a peer, with connection-history
    /// bookkeeping.
    pub async fn connect(&self, peer: NodeId) -> Result<Connection, OverlayError> {
        {
            let sessions = self.inner.sessions.lock().await;
            if let Some(conn) = sessions.get(&peer) {
                if conn.close_reason().is_none() {
                    return Ok(conn.clone());
                }
            }
        }
        match self.inner.endpoint.connect(peer, tunnel::ALPN).await {
            Ok(conn) => {
                self.inner.sessions.lock().await.insert(peer, conn.clone());
                self.inner
                    .last_rtt
                    .lock()
                    .expect("rtt mutex poisoned")
                    .insert(peer, conn_rtt_ms(&conn));
                self.note_dial_outcome(peer, true).await;
                Ok(conn)
            }
            Err(e) => {
                self.note_dial_outcome(peer, false).await;
                Err(OverlayError::Overlay(format!(
                    "dial to {} failed: {e}",
                    peer.fmt_short()
                )))
            }
        }
    }

    async fn note_dial_outcome(&self, peer: NodeId, success: bool) {
        let peer_id = peer.to_string();
        let result = if success {
            self.inner.store.record_dial_success(&peer_id).await.map(|_| false)
        } else {
            self.inner.store.record_dial_failure(&peer_id).await
        };
        match result {
            Ok(true) => {
                tracing::info!("purged long-dead peer {}", peer.fmt_short());
                self.inner.loads.forget(&peer_id);
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("connection bookkeeping failed for {peer_id}: {e}"),
        }
    }

    /// Broadcast one request envelope and wait on its correlation slot.
    async fn broadcast_request(
        &self,
        message_type: MessageType,
        peer: NodeId,
        body: Vec<u8>,
    ) -> Result<Envelope, OverlayError> {
        let mut envelope = Envelope::request(message_type, &self.id(), &peer.to_string(), body);
        envelope.sign(&self.inner.secret)?;
        let bytes = envelope.encode()?;
        let id = envelope.id.clone();

        let slot = self.inner.correlate.enqueue(&id);
        if let Err(e) = self.inner.sender.broadcast(bytes.into()).await {
            self.inner.correlate.cancel(&id);
            return Err(OverlayError::Overlay(format!("broadcast failed: {e}")));
        }
        self.inner.correlate.wait(&id, slot).await
    }

    // ── Inbound request serving ──

    async fn serve_requests(self, mut rx: mpsc::Receiver<Envelope>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.serve_one(request).await;
                    });
                }
            }
        }
    }

    async fn serve_one(&self, request: Envelope) {
        let response_type = match request.message_type.response_type() {
            Some(t) => t,
            None => {
                tracing::warn!("no response type for {:?}, dropping", request.message_type);
                return;
            }
        };

        let (payload, result_code, result_message) = match self.build_reply(&request).await {
            Ok(payload) => (payload, code::OK, String::new()),
            Err(e) => {
                tracing::warn!("serving request {} failed: {e}", request.id);
                (Vec::new(), e.code(), e.to_string())
            }
        };

        let mut response = Envelope::response_to(
            &request,
            response_type,
            &self.id(),
            payload,
            result_code,
            result_message,
        );
        if let Err(e) = response.sign(&self.inner.secret) {
            tracing::error!("failed to sign response: {e}");
            return;
        }
        let bytes = match response.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("failed to encode response: {e}");
                return;
            }
        };
        if let Err(e) = self.inner.sender.broadcast(bytes.into()).await {
            tracing::warn!("failed to broadcast response for {}: {e}", request.id);
        }
    }

    async fn build_reply(&self, request: &Envelope) -> Result<Vec<u8>, OverlayError> {
        match request.message_type {
            MessageType::PeerIdentityRequest => {
                let identity = self.local_identity().await;
                serde_json::to_vec(&identity)
                    .map_err(|e| OverlayError::Internal(e.to_string()))
            }
            MessageType::ChatCompletionRequest | MessageType::ImageGenerationRequest => {
                let sender = sender_key(request)?;
                let plain = seal::unseal(&self.inner.secret, &sender, request.body.payload())?;
                let call: ModelCall = serde_json::from_slice(&plain)
                    .map_err(|e| OverlayError::Parse(format!("bad call payload: {e}")))?;
                let result = self.invoke_local(&call).await?;
                let response = serde_json::to_vec(&result)
                    .map_err(|e| OverlayError::Internal(e.to_string()))?;
                Ok(seal::seal(&self.inner.secret, &sender, &response)?)
            }
            other => Err(OverlayError::UnsupportedType(u32::from(other))),
        }
    }

    /// Invoke a locally registered model, holding its idle guard for the
    /// duration of the upstream round-trip.
    pub async fn invoke_local(&self, call: &ModelCall) -> Result<serde_json::Value, OverlayError> {
        let (record, _idle) = self
            .inner
            .registry
            .begin_invocation(&call.project, &call.model)
            .ok_or_else(|| OverlayError::NotFound(format!("{}/{}", call.project, call.model)))?;

        let response = self
            .inner
            .http
            .post(&record.api_endpoint)
            .json(&call.payload)
            .send()
            .await
            .map_err(|e| OverlayError::Upstream(format!("model endpoint unreachable: {e}")))?;
        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OverlayError::Upstream(format!("bad model response: {e}")))?;
        if !status.is_success() {
            return Err(OverlayError::Upstream(format!(
                "model endpoint returned {status}"
            )));
        }
        Ok(value)
    }

    // ── Background liveness ──

    /// Periodically sweep established sessions: drop closed ones into the
    /// connection-history store, refresh RTTs for the rest.
    async fn liveness_loop(self) {
        let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let snapshot: Vec<(NodeId, Connection)> = {
                let sessions = self.inner.sessions.lock().await;
                sessions.iter().map(|(k, v)| (*k, v.clone())).collect()
            };
            for (peer, conn) in snapshot {
                if conn.close_reason().is_some() {
                    self.inner.sessions.lock().await.remove(&peer);
                    self.note_dial_outcome(peer, false).await;
                    continue;
                }
                let rtt = conn_rtt_ms(&conn);
                self.inner
                    .last_rtt
                    .lock()
                    .expect("rtt mutex poisoned")
                    .insert(peer, rtt);
                self.note_dial_outcome(peer, true).await;
            }
        }
    }

    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(heartbeat) = self.inner.heartbeat.lock().await.take() {
            heartbeat.shutdown().await;
        }
        if let Err(e) = self.inner.router.shutdown().await {
            tracing::warn!("router shutdown: {e}");
        }
        self.inner.endpoint.close().await;
    }
}

/// The gossip handler behind the admission gate: every inbound session
/// upgrade passes the same policy as tunnel sessions before the gossip
/// actor sees it.
#[derive(Debug, Clone)]
struct GatedGossip {
    gate: ConnectionGate,
    inner: Gossip,
}

impl ProtocolHandler for GatedGossip {
    async fn accept(&self, connection: Connection) -> Result<(), AcceptError> {
        let remote = match connection.remote_node_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("gossip connection without node id: {e}");
                connection.close(1u32.into(), b"unidentified");
                return Ok(());
            }
        };
        if self.gate.decide(Direction::Inbound, &remote.to_string()).await == Decision::Deny {
            connection.close(1u32.into(), b"denied");
            return Ok(());
        }
        self.inner.accept(connection).await
    }

    async fn shutdown(&self) {
        ProtocolHandler::shutdown(&self.inner).await;
    }
}

/// RTT of a live session, in whole milliseconds, floored to 1 so that a
/// measured sub-millisecond link never collides with the 0 "unmeasured"
/// sentinel.
fn conn_rtt_ms(conn: &Connection) -> u32 {
    (conn.rtt().as_millis() as u32).max(1)
}

fn sender_key(request: &Envelope) -> Result<iroh::PublicKey, OverlayError> {
    let bytes: [u8; 32] = request
        .sender_pub_key
        .as_slice()
        .try_into()
        .map_err(|_| OverlayError::Parse("bad sender key length".to_string()))?;
    iroh::PublicKey::from_bytes(&bytes)
        .map_err(|_| OverlayError::Parse("bad sender key".to_string()))
}

fn decode_invite(token: &str) -> Result<NodeAddr> {
    let json = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(token)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModelKind, ModelRecord};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn model_call_round_trip() {
        let call = ModelCall {
            project: "acme".to_string(),
            model: "llama".to_string(),
            payload: serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}),
        };
        let bytes = serde_json::to_vec(&call).unwrap();
        let back: ModelCall = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.project, "acme");
        assert_eq!(back.payload["messages"][0]["content"], "hi");
    }

    #[test]
    fn model_call_payload_defaults_to_null() {
        let back: ModelCall = serde_json::from_str(r#"{"project":"p","model":"m"}"#).unwrap();
        assert!(back.payload.is_null());
    }

    #[test]
    fn invite_token_decodes() {
        let addr = NodeAddr::from(iroh::SecretKey::from_bytes(&[3u8; 32]).public());
        let json = serde_json::to_vec(&addr).unwrap();
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&json);
        let back = decode_invite(&token).unwrap();
        assert_eq!(back.node_id, addr.node_id);
        assert!(decode_invite("not base64 ***").is_err());
    }

    #[test]
    fn sender_key_rejects_short_keys() {
        let key = iroh::SecretKey::from_bytes(&[5u8; 32]);
        let mut env = Envelope::request(
            MessageType::ChatCompletionRequest,
            &key.public(),
            "peer",
            b"x".to_vec(),
        );
        assert!(sender_key(&env).is_ok());
        env.sender_pub_key.truncate(16);
        assert!(sender_key(&env).is_err());
    }

    /// Serve one canned JSON response and capture the request.
    async fn one_shot_model_server(body: &'static str) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            buf.truncate(n);
            buf
        });
        (format!("http://{addr}/v1/chat/completions"), handle)
    }

    fn registry_with(endpoint: &str) -> LocalRegistry {
        let registry = LocalRegistry::new();
        let mut models = HashMap::new();
        models.insert(
            "llama".to_string(),
            ModelRecord {
                api_endpoint: endpoint.to_string(),
                kind: ModelKind::Chat,
                idle_count: 0,
            },
        );
        registry.register("acme", models);
        registry
    }

    // invoke_local is exercised through a bare registry + http client pair
    // rather than a full node; the transport is not involved.
    async fn invoke(
        registry: &LocalRegistry,
        call: &ModelCall,
    ) -> Result<serde_json::Value, OverlayError> {
        let (record, _idle) = registry
            .begin_invocation(&call.project, &call.model)
            .ok_or_else(|| OverlayError::NotFound(format!("{}/{}", call.project, call.model)))?;
        let response = reqwest::Client::new()
            .post(&record.api_endpoint)
            .json(&call.payload)
            .send()
            .await
            .map_err(|e| OverlayError::Upstream(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| OverlayError::Upstream(e.to_string()))
    }

    #[tokio::test]
    async fn local_invocation_reaches_model_endpoint() {
        let (endpoint, server) = one_shot_model_server(r#"{"ok":true}"#).await;
        let registry = registry_with(&endpoint);
        let call = ModelCall {
            project: "acme".to_string(),
            model: "llama".to_string(),
            payload: serde_json::json!({"prompt": "hello"}),
        };
        let value = invoke(&registry, &call).await.unwrap();
        assert_eq!(value["ok"], true);

        let request_bytes = server.await.unwrap();
        let request = String::from_utf8_lossy(&request_bytes);
        assert!(request.contains("POST /v1/chat/completions"));
        assert!(request.contains("hello"));
        // The guard released on completion.
        assert_eq!(registry.get("acme", "llama").unwrap().idle_count, 0);
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let registry = LocalRegistry::new();
        let call = ModelCall {
            project: "ghost".to_string(),
            model: "none".to_string(),
            payload: serde_json::Value::Null,
        };
        assert!(matches!(
            invoke(&registry, &call).await,
            Err(OverlayError::NotFound(_))
        ));
    }
}
