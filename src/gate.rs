//! Inbound-connection admission policy.
//!
//! Collector nodes pinned to a client project only accept sessions from
//! peers known to host models for that project. Everyone else gets the
//! default: allow. A registry outage must never partition the network, so
//! lookup failures fall back to allow as well.

use crate::store::{NodeFlags, RegistryStore};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct ConnectionGate {
    collect_metadata: bool,
    /// Empty string disables the project filter.
    client_project: Arc<str>,
    store: RegistryStore,
}

impl ConnectionGate {
    pub fn new(collect_metadata: bool, client_project: &str, store: RegistryStore) -> Self {
        ConnectionGate {
            collect_metadata,
            client_project: Arc::from(client_project),
            store,
        }
    }

    /// Admission check, run on every inbound session upgrade. Outbound
    /// sessions are never filtered.
    pub async fn decide(&self, direction: Direction, remote_peer_id: &str) -> Decision {
        if direction != Direction::Inbound || !self.collect_metadata || self.client_project.is_empty()
        {
            return Decision::Allow;
        }

        let entry = match self.store.get_peer_entry(remote_peer_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tracing::debug!("gate: no registry entry for {remote_peer_id}, allowing");
                return Decision::Allow;
            }
            Err(e) => {
                tracing::warn!("gate: registry lookup failed for {remote_peer_id}, allowing: {e}");
                return Decision::Allow;
            }
        };

        let hosts_project = entry.flags.contains(NodeFlags::HOSTS_MODELS)
            && entry.projects.contains_key(self.client_project.as_ref());
        if hosts_project {
            Decision::Allow
        } else {
            tracing::info!(
                "gate: denying {remote_peer_id}, does not host project {}",
                self.client_project
            );
            Decision::Deny
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PeerEntry;
    use std::collections::HashMap;

    fn store() -> (tempfile::TempDir, RegistryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::open(dir.path().join("registry.db")).unwrap();
        (dir, store)
    }

    fn entry(flags: NodeFlags, projects: &[(&str, &[&str])]) -> PeerEntry {
        PeerEntry {
            timestamp: 1,
            flags,
            projects: projects
                .iter()
                .map(|(p, ms)| (p.to_string(), ms.iter().map(|m| m.to_string()).collect()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn default_allow_without_collection() {
        let (_dir, store) = store();
        let gate = ConnectionGate::new(false, "proj", store);
        assert_eq!(gate.decide(Direction::Inbound, "nobody").await, Decision::Allow);
    }

    #[tokio::test]
    async fn default_allow_without_project_filter() {
        let (_dir, store) = store();
        let gate = ConnectionGate::new(true, "", store);
        assert_eq!(gate.decide(Direction::Inbound, "nobody").await, Decision::Allow);
    }

    #[tokio::test]
    async fn outbound_never_filtered() {
        let (_dir, store) = store();
        let gate = ConnectionGate::new(true, "proj", store);
        assert_eq!(gate.decide(Direction::Outbound, "nobody").await, Decision::Allow);
    }

    #[tokio::test]
    async fn unknown_peer_fails_open() {
        let (_dir, store) = store();
        let gate = ConnectionGate::new(true, "proj", store);
        assert_eq!(gate.decide(Direction::Inbound, "stranger").await, Decision::Allow);
    }

    #[tokio::test]
    async fn denies_peer_without_the_project() {
        let (_dir, store) = store();
        store
            .upsert_peer_entry(
                "peer-a",
                entry(NodeFlags::HOSTS_MODELS, &[("other", &["m"])]),
            )
            .await
            .unwrap();
        let gate = ConnectionGate::new(true, "proj", store);
        assert_eq!(gate.decide(Direction::Inbound, "peer-a").await, Decision::Deny);
    }

    #[tokio::test]
    async fn denies_peer_without_hosting_flag() {
        let (_dir, store) = store();
        store
            .upsert_peer_entry("peer-b", entry(NodeFlags::PUBLIC, &[("proj", &["m"])]))
            .await
            .unwrap();
        let gate = ConnectionGate::new(true, "proj", store);
        assert_eq!(gate.decide(Direction::Inbound, "peer-b").await, Decision::Deny);
    }

    #[tokio::test]
    async fn allows_hosting_peer_with_matching_project() {
        let (_dir, store) = store();
        store
            .upsert_peer_entry(
                "peer-c",
                entry(
                    NodeFlags::HOSTS_MODELS.with(NodeFlags::PUBLIC),
                    &[("proj", &["m"])],
                ),
            )
            .await
            .unwrap();
        let gate = ConnectionGate::new(true, "proj", store);
        assert_eq!(gate.decide(Direction::Inbound, "peer-c").await, Decision::Allow);
    }
}
