//! Durable remote registry — gossip-fed model inventories per peer, plus the
//! connection-history bookkeeping that opportunistically purges dead peers.
//!
//! SQLite with WAL; a fresh connection per operation, wrapped in
//! `spawn_blocking` so registry reads never block the runtime. Writes are
//! keyed by peer id and come from the gossip listener; reads come from
//! ranking and the façade concurrently.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Node capability bits carried in gossip and stored per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeFlags(pub u32);

impl NodeFlags {
    /// Reachable from the public internet.
    pub const PUBLIC: NodeFlags = NodeFlags(1);
    /// Collects peer metadata from gossip.
    pub const COLLECTOR: NodeFlags = NodeFlags(1 << 1);
    /// Hosts at least one model.
    pub const HOSTS_MODELS: NodeFlags = NodeFlags(1 << 2);

    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | other.0)
    }
}

/// Durable registry record for one remote peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Wall-clock timestamp carried in the peer's gossip; last writer wins.
    pub timestamp: i64,
    pub flags: NodeFlags,
    /// project → advertised model names
    pub projects: HashMap<String, Vec<String>>,
}

/// Purge policy: both conditions must hold before a peer is deleted.
pub const PURGE_MIN_FAILURES: u32 = 10;
pub const PURGE_MIN_AGE_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct RegistryStore {
    db_path: PathBuf,
}

impl RegistryStore {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        init_db(&db_path)?;
        Ok(RegistryStore { db_path })
    }

    pub fn default_path(data_dir: Option<PathBuf>) -> PathBuf {
        let dir = data_dir.unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".modelmesh")
        });
        let _ = std::fs::create_dir_all(&dir);
        dir.join("registry.db")
    }

    /// Insert or replace a peer's entry, last-writer-wins by the gossip
    /// timestamp. Returns false when a fresher entry was already stored.
    pub async fn upsert_peer_entry(&self, peer_id: &str, entry: PeerEntry) -> Result<bool> {
        let db_path = self.db_path.clone();
        let peer_id = peer_id.to_string();
        tokio::task::spawn_blocking(move || upsert_entry(&db_path, &peer_id, &entry)).await?
    }

    pub async fn get_peer_entry(&self, peer_id: &str) -> Result<Option<PeerEntry>> {
        let db_path = self.db_path.clone();
        let peer_id = peer_id.to_string();
        tokio::task::spawn_blocking(move || get_entry(&db_path, &peer_id)).await?
    }

    /// Peers advertising (project, model), up to `limit`, in store iteration
    /// order. Freshness ordering happens downstream in ranking.
    pub async fn find_peers(&self, project: &str, model: &str, limit: usize) -> Result<Vec<String>> {
        let db_path = self.db_path.clone();
        let project = project.to_string();
        let model = model.to_string();
        tokio::task::spawn_blocking(move || find_peers_sync(&db_path, &project, &model, limit))
            .await?
    }

    pub async fn all_peers(&self) -> Result<Vec<(String, PeerEntry)>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || all_peers_sync(&db_path)).await?
    }

    /// Connection bookkeeping: a successful dial clears the failure streak.
    pub async fn record_dial_success(&self, peer_id: &str) -> Result<()> {
        let db_path = self.db_path.clone();
        let peer_id = peer_id.to_string();
        tokio::task::spawn_blocking(move || dial_success(&db_path, &peer_id)).await?
    }

    /// Connection bookkeeping: a failed dial bumps the streak and, when the
    /// peer has been unreachable long enough (≥10 consecutive failures AND
    /// >30 days since last success), purges its registry entry. Returns true
    /// when the peer was purged.
    pub async fn record_dial_failure(&self, peer_id: &str) -> Result<bool> {
        let db_path = self.db_path.clone();
        let peer_id = peer_id.to_string();
        tokio::task::spawn_blocking(move || dial_failure(&db_path, &peer_id, unix_now())).await?
    }

    #[cfg(test)]
    async fn record_dial_failure_at(&self, peer_id: &str, now: i64) -> Result<bool> {
        let db_path = self.db_path.clone();
        let peer_id = peer_id.to_string();
        tokio::task::spawn_blocking(move || dial_failure(&db_path, &peer_id, now)).await?
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn init_db(db_path: &PathBuf) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS peer_registry (
            peer_id TEXT PRIMARY KEY,
            ts INTEGER NOT NULL,
            flags INTEGER NOT NULL,
            projects_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS peer_connections (
            peer_id TEXT PRIMARY KEY,
            last_success INTEGER NOT NULL,
            consecutive_failures INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn upsert_entry(db_path: &PathBuf, peer_id: &str, entry: &PeerEntry) -> Result<bool> {
    let conn = Connection::open(db_path)?;
    let existing_ts: Option<i64> = conn
        .query_row(
            "SELECT ts FROM peer_registry WHERE peer_id = ?1",
            params![peer_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(ts) = existing_ts {
        if ts > entry.timestamp {
            return Ok(false);
        }
    }
    let projects_json = serde_json::to_string(&entry.projects)?;
    conn.execute(
        r#"
        INSERT INTO peer_registry (peer_id, ts, flags, projects_json, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(peer_id) DO UPDATE SET
            ts = excluded.ts,
            flags = excluded.flags,
            projects_json = excluded.projects_json,
            updated_at = excluded.updated_at
        "#,
        params![peer_id, entry.timestamp, entry.flags.0, projects_json, unix_now()],
    )?;
    Ok(true)
}

fn get_entry(db_path: &PathBuf, peer_id: &str) -> Result<Option<PeerEntry>> {
    let conn = Connection::open(db_path)?;
    let row: Option<(i64, u32, String)> = conn
        .query_row(
            "SELECT ts, flags, projects_json FROM peer_registry WHERE peer_id = ?1",
            params![peer_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    match row {
        Some((ts, flags, projects_json)) => Ok(Some(PeerEntry {
            timestamp: ts,
            flags: NodeFlags(flags),
            projects: serde_json::from_str(&projects_json)?,
        })),
        None => Ok(None),
    }
}

fn find_peers_sync(db_path: &PathBuf, project: &str, model: &str, limit: usize) -> Result<Vec<String>> {
    let conn = Connection::open(db_path)?;
    let mut stmt = conn.prepare("SELECT peer_id, projects_json FROM peer_registry")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (peer_id, projects_json) = row?;
        let projects: HashMap<String, Vec<String>> = match serde_json::from_str(&projects_json) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if projects
            .get(project)
            .is_some_and(|models| models.iter().any(|m| m == model))
        {
            out.push(peer_id);
            if out.len() >= limit {
                break;
            }
        }
    }
    Ok(out)
}

fn all_peers_sync(db_path: &PathBuf) -> Result<Vec<(String, PeerEntry)>> {
    let conn = Connection::open(db_path)?;
    let mut stmt = conn.prepare("SELECT peer_id, ts, flags, projects_json FROM peer_registry")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, u32>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (peer_id, ts, flags, projects_json) = row?;
        let projects = match serde_json::from_str(&projects_json) {
            Ok(p) => p,
            Err(_) => continue,
        };
        out.push((
            peer_id,
            PeerEntry {
                timestamp: ts,
                flags: NodeFlags(flags),
                projects,
            },
        ));
    }
    Ok(out)
}

fn dial_success(db_path: &PathBuf, peer_id: &str) -> Result<()> {
    let conn = Connection::open(db_path)?;
    conn.execute(
        r#"
        INSERT INTO peer_connections (peer_id, last_success, consecutive_failures)
        VALUES (?1, ?2, 0)
        ON CONFLICT(peer_id) DO UPDATE SET
            last_success = excluded.last_success,
            consecutive_failures = 0
        "#,
        params![peer_id, unix_now()],
    )?;
    Ok(())
}

fn dial_failure(db_path: &PathBuf, peer_id: &str, now: i64) -> Result<bool> {
    let conn = Connection::open(db_path)?;
    conn.execute(
        r#"
        INSERT INTO peer_connections (peer_id, last_success, consecutive_failures)
        VALUES (?1, ?2, 1)
        ON CONFLICT(peer_id) DO UPDATE SET
            consecutive_failures = consecutive_failures + 1
        "#,
        params![peer_id, now],
    )?;

    let (last_success, failures): (i64, u32) = conn.query_row(
        "SELECT last_success, consecutive_failures FROM peer_connections WHERE peer_id = ?1",
        params![peer_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    // Both conditions required (conjunction): a long-dead peer that briefly
    // answered recently, or a flapping peer with a recent success, survives.
    if failures >= PURGE_MIN_FAILURES && now - last_success > PURGE_MIN_AGE_SECS {
        conn.execute("DELETE FROM peer_registry WHERE peer_id = ?1", params![peer_id])?;
        conn.execute("DELETE FROM peer_connections WHERE peer_id = ?1", params![peer_id])?;
        return Ok(true);
    }
    Ok(false)
}
