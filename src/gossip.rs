//! Gossip heartbeat and overlay message routing.
//!
//! Every node on the overlay shares a single broadcast topic. Heartbeats
//! (`AiProject` envelopes carrying the local model inventory) and
//! request/response envelopes all ride on it; the listener routes by message
//! type and receiver. Delivery is at-most-once with no ordering guarantee,
//! so registry entries are last-writer-wins by the timestamp carried in the
//! envelope.

use crate::correlate::CorrelationQueue;
use crate::envelope::{Envelope, MessageType};
use crate::registry::{LocalRegistry, ModelKind};
use crate::store::{NodeFlags, PeerEntry, RegistryStore};
use anyhow::Result;
use futures::StreamExt;
use iroh_gossip::api::{Event, GossipSender};
use iroh_gossip::net::Gossip;
use iroh_gossip::proto::TopicId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// All overlay traffic shares one topic (exactly 32 bytes).
pub fn overlay_topic() -> TopicId {
    TopicId::from_bytes(*b"modelmesh-ai-project-gossip-v0!!")
}

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// One advertised model inside a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAdvert {
    pub kind: ModelKind,
    #[serde(default)]
    pub idle_count: u32,
}

/// Heartbeat payload: the sender's capability flags plus its full model
/// inventory with live load counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectAnnouncement {
    pub flags: NodeFlags,
    /// project → model → advert
    pub projects: HashMap<String, HashMap<String, ModelAdvert>>,
}

impl ProjectAnnouncement {
    pub fn from_registry(registry: &LocalRegistry, flags: NodeFlags) -> Self {
        let projects = registry
            .snapshot()
            .into_iter()
            .map(|(project, models)| {
                let adverts = models
                    .into_iter()
                    .map(|(name, record)| {
                        (
                            name,
                            ModelAdvert {
                                kind: record.kind,
                                idle_count: record.idle_count,
                            },
                        )
                    })
                    .collect();
                (project, adverts)
            })
            .collect();
        ProjectAnnouncement { flags, projects }
    }

    /// The durable-store shape: model names only, sorted for stable output.
    pub fn model_names(&self) -> HashMap<String, Vec<String>> {
        self.projects
            .iter()
            .map(|(project, models)| {
                let mut names: Vec<String> = models.keys().cloned().collect();
                names.sort();
                (project.clone(), names)
            })
            .collect()
    }

    pub fn idle_count(&self, project: &str, model: &str) -> Option<u32> {
        self.projects
            .get(project)
            .and_then(|m| m.get(model))
            .map(|a| a.idle_count)
    }
}

/// In-memory cache of the last heartbeat accepted per peer. Load counters
/// live here rather than in the durable store; they are too volatile to be
/// worth persisting.
#[derive(Clone, Default)]
pub struct PeerLoadCache {
    inner: Arc<Mutex<HashMap<String, ProjectAnnouncement>>>,
}

impl PeerLoadCache {
    pub fn put(&self, peer_id: &str, announcement: ProjectAnnouncement) {
        self.inner
            .lock()
            .expect("load cache mutex poisoned")
            .insert(peer_id.to_string(), announcement);
    }

    /// Zero when the peer has not been heard from.
    pub fn idle_count(&self, peer_id: &str, project: &str, model: &str) -> u32 {
        self.inner
            .lock()
            .expect("load cache mutex poisoned")
            .get(peer_id)
            .and_then(|a| a.idle_count(project, model))
            .unwrap_or(0)
    }

    pub fn forget(&self, peer_id: &str) {
        self.inner
            .lock()
            .expect("load cache mutex poisoned")
            .remove(peer_id);
    }
}

/// Everything the heartbeat loop and the listener need, shared by clone.
#[derive(Clone)]
pub struct GossipContext {
    pub secret: iroh::SecretKey,
    pub collect_metadata: bool,
    pub public_node: bool,
    pub registry: LocalRegistry,
    pub store: RegistryStore,
    pub loads: PeerLoadCache,
    pub correlate: CorrelationQueue,
    /// Inbound request envelopes addressed to this node, served elsewhere.
    pub requests: mpsc::Sender<Envelope>,
}

impl GossipContext {
    pub fn local_id(&self) -> iroh::NodeId {
        self.secret.public()
    }

    fn flags(&self) -> NodeFlags {
        let mut flags = NodeFlags::default();
        if self.public_node {
            flags = flags.with(NodeFlags::PUBLIC);
        }
        if self.collect_metadata {
            flags = flags.with(NodeFlags::COLLECTOR);
        }
        if !self.registry.is_empty() {
            flags = flags.with(NodeFlags::HOSTS_MODELS);
        }
        flags
    }
}

/// Encode one signed heartbeat envelope from the current registry state.
pub fn build_heartbeat(ctx: &GossipContext) -> Result<Vec<u8>> {
    let announcement = ProjectAnnouncement::from_registry(&ctx.registry, ctx.flags());
    let payload = serde_json::to_vec(&announcement)?;
    let mut envelope = Envelope::gossip(MessageType::AiProject, &ctx.local_id(), payload);
    envelope.sign(&ctx.secret)?;
    Ok(envelope.encode()?)
}

/// Where an inbound gossip frame ended up. Logged by the listener; asserted
/// directly by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Malformed,
    SelfOrigin,
    BadSignature,
    Heartbeat { fresh: bool },
    /// The frame was fine but the local store rejected the write.
    StoreFailed,
    DroppedNotCollector,
    Response { matched: bool },
    Request,
    NotAddressedHere,
    Unsupported(u32),
}

/// Decode, verify, and dispatch one frame off the topic. Never fails the
/// listener loop; malformed input is logged and dropped.
pub async fn route(ctx: &GossipContext, bytes: &[u8]) -> Routed {
    let envelope = match Envelope::decode(bytes) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("dropping malformed gossip frame: {e}");
            return Routed::Malformed;
        }
    };

    if envelope.sender == ctx.local_id().to_string() {
        return Routed::SelfOrigin;
    }
    if !envelope.verify() {
        tracing::warn!("dropping gossip frame with bad signature from {}", envelope.sender);
        return Routed::BadSignature;
    }

    match envelope.message_type {
        MessageType::AiProject => {
            if !ctx.collect_metadata {
                tracing::debug!("not a collector, dropping heartbeat from {}", envelope.sender);
                return Routed::DroppedNotCollector;
            }
            let announcement: ProjectAnnouncement =
                match serde_json::from_slice(envelope.body.payload()) {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!("bad heartbeat payload from {}: {e}", envelope.sender);
                        return Routed::Malformed;
                    }
                };
            let entry = PeerEntry {
                timestamp: envelope.timestamp,
                flags: announcement.flags,
                projects: announcement.model_names(),
            };
            let fresh = match ctx.store.upsert_peer_entry(&envelope.sender, entry).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    tracing::warn!("failed to store heartbeat from {}: {e}", envelope.sender);
                    return Routed::StoreFailed;
                }
            };
            if fresh {
                ctx.loads.put(&envelope.sender, announcement);
            }
            Routed::Heartbeat { fresh }
        }
        t if t.is_response() => {
            if envelope.receiver != ctx.local_id().to_string() {
                return Routed::NotAddressedHere;
            }
            let id = envelope.id.clone();
            let matched = ctx.correlate.complete(&id, envelope);
            Routed::Response { matched }
        }
        t if t.is_request() => {
            if envelope.receiver != ctx.local_id().to_string() {
                return Routed::NotAddressedHere;
            }
            if let Err(e) = ctx.requests.send(envelope).await {
                tracing::warn!("request handler gone, dropping inbound request: {e}");
            }
            Routed::Request
        }
        other => {
            let raw = u32::from(other);
            tracing::warn!("unsupported message type {raw} from {}", envelope.sender);
            Routed::Unsupported(raw)
        }
    }
}

/// The heartbeat broadcaster plus the topic listener, as background tasks.
pub struct HeartbeatService {
    sender: GossipSender,
    cancel: CancellationToken,
    announcer: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

impl HeartbeatService {
    pub async fn spawn(
        gossip: &Gossip,
        bootstrap: Vec<iroh::NodeId>,
        interval: Duration,
        ctx: GossipContext,
    ) -> Result<Self> {
        let topic = gossip.subscribe(overlay_topic(), bootstrap).await?;
        let (sender, mut receiver) = topic.split();
        let cancel = CancellationToken::new();

        let announcer_cancel = cancel.child_token();
        let announcer_sender = sender.clone();
        let announcer_ctx = ctx.clone();
        let announcer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = announcer_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match build_heartbeat(&announcer_ctx) {
                            Ok(bytes) => {
                                if let Err(e) = announcer_sender.broadcast(bytes.into()).await {
                                    tracing::warn!("heartbeat broadcast failed: {e}");
                                }
                            }
                            Err(e) => tracing::error!("failed to build heartbeat: {e}"),
                        }
                    }
                }
            }
            tracing::debug!("heartbeat announcer stopped");
        });

        let listener_cancel = cancel.child_token();
        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = listener_cancel.cancelled() => break,
                    event = receiver.next() => match event {
                        Some(Ok(Event::Received(msg))) => {
                            route(&ctx, &msg.content).await;
                        }
                        Some(Ok(Event::NeighborUp(peer))) => {
                            tracing::debug!("gossip neighbor up: {peer}");
                        }
                        Some(Ok(Event::NeighborDown(peer))) => {
                            tracing::debug!("gossip neighbor down: {peer}");
                        }
                        Some(Ok(Event::Lagged)) => {
                            tracing::warn!("gossip receiver lagged, frames dropped");
                        }
                        Some(Err(e)) => {
                            tracing::warn!("gossip receive error: {e}");
                        }
                        None => break,
                    }
                }
            }
            tracing::debug!("gossip listener stopped");
        });

        Ok(HeartbeatService {
            sender,
            cancel,
            announcer: Some(announcer),
            listener: Some(listener),
        })
    }

    /// Broadcast handle for request/response envelopes.
    pub fn sender(&self) -> GossipSender {
        self.sender.clone()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in [self.announcer.take(), self.listener.take()].into_iter().flatten() {
            let _ = task.await;
        }
    }
}

impl Drop for HeartbeatService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelRecord;

    fn ctx(fill: u8, collect: bool) -> (GossipContext, mpsc::Receiver<Envelope>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::open(dir.path().join("registry.db")).unwrap();
        let (tx, rx) = mpsc::channel(8);
        let ctx = GossipContext {
            secret: iroh::SecretKey::from_bytes(&[fill; 32]),
            collect_metadata: collect,
            public_node: false,
            registry: LocalRegistry::new(),
            store,
            loads: PeerLoadCache::default(),
            correlate: CorrelationQueue::new(),
            requests: tx,
        };
        (ctx, rx, dir)
    }

    fn host_models(ctx: &GossipContext) {
        let mut models = HashMap::new();
        models.insert(
            "llama".to_string(),
            ModelRecord {
                api_endpoint: "http://127.0.0.1:8080".to_string(),
                kind: ModelKind::Chat,
                idle_count: 2,
            },
        );
        ctx.registry.register("acme", models);
    }

    #[tokio::test]
    async fn heartbeat_updates_collector_store() {
        let (sender, _rx1, _d1) = ctx(1, false);
        let (collector, _rx2, _d2) = ctx(2, true);
        host_models(&sender);

        let bytes = build_heartbeat(&sender).unwrap();
        let routed = route(&collector, &bytes).await;
        assert_eq!(routed, Routed::Heartbeat { fresh: true });

        let sender_id = sender.local_id().to_string();
        let entry = collector.store.get_peer_entry(&sender_id).await.unwrap().unwrap();
        assert_eq!(entry.projects["acme"], vec!["llama".to_string()]);
        assert!(entry.flags.contains(NodeFlags::HOSTS_MODELS));
        assert_eq!(collector.loads.idle_count(&sender_id, "acme", "llama"), 2);
    }

    #[tokio::test]
    async fn non_collector_drops_heartbeat() {
        let (sender, _rx1, _d1) = ctx(1, false);
        let (plain, _rx2, _d2) = ctx(2, false);
        host_models(&sender);

        let bytes = build_heartbeat(&sender).unwrap();
        assert_eq!(route(&plain, &bytes).await, Routed::DroppedNotCollector);
        let sender_id = sender.local_id().to_string();
        assert!(plain.store.get_peer_entry(&sender_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn self_origin_is_ignored() {
        let (node, _rx, _d) = ctx(3, true);
        host_models(&node);
        let bytes = build_heartbeat(&node).unwrap();
        assert_eq!(route(&node, &bytes).await, Routed::SelfOrigin);
    }

    #[tokio::test]
    async fn tampered_heartbeat_is_dropped() {
        let (sender, _rx1, _d1) = ctx(1, false);
        let (collector, _rx2, _d2) = ctx(2, true);
        host_models(&sender);

        let bytes = build_heartbeat(&sender).unwrap();
        let mut envelope = Envelope::decode(&bytes).unwrap();
        envelope.timestamp += 1;
        let tampered = envelope.encode().unwrap();
        assert_eq!(route(&collector, &tampered).await, Routed::BadSignature);
    }

    #[tokio::test]
    async fn stale_heartbeat_does_not_regress() {
        let (sender, _rx1, _d1) = ctx(1, false);
        let (collector, _rx2, _d2) = ctx(2, true);
        host_models(&sender);

        let bytes = build_heartbeat(&sender).unwrap();
        assert_eq!(route(&collector, &bytes).await, Routed::Heartbeat { fresh: true });

        // Re-sign the same envelope with an older timestamp.
        let mut old = Envelope::decode(&bytes).unwrap();
        old.timestamp -= 60;
        old.sign(&sender.secret).unwrap();
        let routed = route(&collector, &old.encode().unwrap()).await;
        assert_eq!(routed, Routed::Heartbeat { fresh: false });
    }

    #[tokio::test]
    async fn response_completes_correlation() {
        let (node, _rx, _d) = ctx(4, false);
        let (peer, _rx2, _d2) = ctx(5, false);

        let request = Envelope::request(
            MessageType::ChatCompletionRequest,
            &node.local_id(),
            &peer.local_id().to_string(),
            b"{}".to_vec(),
        );
        let slot = node.correlate.enqueue(&request.id);

        let mut response = Envelope::response_to(
            &request,
            MessageType::ChatCompletionResponse,
            &peer.local_id(),
            b"ok".to_vec(),
            0,
            String::new(),
        );
        response.sign(&peer.secret).unwrap();

        let routed = route(&node, &response.encode().unwrap()).await;
        assert_eq!(routed, Routed::Response { matched: true });
        let delivered = slot.await.unwrap();
        assert_eq!(delivered.body.payload(), b"ok");
    }

    #[tokio::test]
    async fn request_is_forwarded_to_handler() {
        let (node, mut rx, _d) = ctx(6, false);
        let (peer, _rx2, _d2) = ctx(7, false);

        let mut request = Envelope::request(
            MessageType::PeerIdentityRequest,
            &peer.local_id(),
            &node.local_id().to_string(),
            b"{}".to_vec(),
        );
        request.sign(&peer.secret).unwrap();

        assert_eq!(route(&node, &request.encode().unwrap()).await, Routed::Request);
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.message_type, MessageType::PeerIdentityRequest);
    }

    #[tokio::test]
    async fn request_for_other_peer_is_ignored() {
        let (node, mut rx, _d) = ctx(8, false);
        let (peer, _rx2, _d2) = ctx(9, false);

        let mut request = Envelope::request(
            MessageType::ChatCompletionRequest,
            &peer.local_id(),
            "someone-else",
            b"{}".to_vec(),
        );
        request.sign(&peer.secret).unwrap();

        assert_eq!(route(&node, &request.encode().unwrap()).await, Routed::NotAddressedHere);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_type_is_rejected_not_ignored() {
        let (node, _rx, _d) = ctx(10, false);
        let (peer, _rx2, _d2) = ctx(11, false);

        let mut envelope = Envelope::gossip(MessageType::Unknown(99), &peer.local_id(), Vec::new());
        envelope.sign(&peer.secret).unwrap();

        assert_eq!(route(&node, &envelope.encode().unwrap()).await, Routed::Unsupported(99));
    }

    #[tokio::test]
    async fn garbage_frame_is_dropped() {
        let (node, _rx, _d) = ctx(12, true);
        assert_eq!(route(&node, b"not json").await, Routed::Malformed);
    }

    #[tokio::test]
    async fn store_failure_is_not_reported_as_malformed() {
        let (sender, _rx1, _d1) = ctx(13, false);
        let (collector, _rx2, dir) = ctx(14, true);
        host_models(&sender);

        let bytes = build_heartbeat(&sender).unwrap();
        // Pull the database out from under the collector; the valid frame
        // must surface as a storage problem, not a bad frame.
        drop(dir);
        assert_eq!(route(&collector, &bytes).await, Routed::StoreFailed);
    }
}
