//! Local service registry — which models this node hosts, with a live
//! per-model idle counter used as a load proxy.
//!
//! All mutation goes through a single lock with read-old/compute-new/swap
//! semantics so a registration racing an idle update never drops counters of
//! models still present afterward. Snapshots are plain clones; callers iterate
//! without holding the lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Chat,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub api_endpoint: String,
    pub kind: ModelKind,
    /// In-flight invocation count; saturates at zero. A load proxy, not a
    /// concurrency limiter.
    #[serde(default)]
    pub idle_count: u32,
}

/// project → model → record
pub type Snapshot = HashMap<String, HashMap<String, ModelRecord>>;

#[derive(Debug, Clone, Default)]
pub struct LocalRegistry {
    inner: Arc<Mutex<Snapshot>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a project's models. New registration wins for
    /// endpoint and kind, but idle counts carry over for any (project, model)
    /// present both before and after.
    pub fn register(&self, project: &str, models: HashMap<String, ModelRecord>) {
        let mut table = self.inner.lock().expect("registry mutex poisoned");
        let mut next = models;
        if let Some(old) = table.get(project) {
            for (name, record) in next.iter_mut() {
                if let Some(prev) = old.get(name) {
                    record.idle_count = prev.idle_count;
                }
            }
        }
        let mut updated = table.clone();
        updated.insert(project.to_string(), next);
        *table = updated;
    }

    pub fn unregister(&self, project: &str) {
        let mut table = self.inner.lock().expect("registry mutex poisoned");
        let mut updated = table.clone();
        updated.remove(project);
        *table = updated;
    }

    /// Adjust a model's idle counter by `delta`, saturating at zero.
    /// No-op if the (project, model) key is not registered.
    pub fn update_idle(&self, project: &str, model: &str, delta: i32) {
        let mut table = self.inner.lock().expect("registry mutex poisoned");
        let mut updated = table.clone();
        if let Some(record) = updated.get_mut(project).and_then(|m| m.get_mut(model)) {
            record.idle_count = if delta >= 0 {
                record.idle_count.saturating_add(delta as u32)
            } else {
                record.idle_count.saturating_sub(delta.unsigned_abs())
            };
            *table = updated;
        }
    }

    /// Immutable copy, safe to iterate while mutations continue.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().expect("registry mutex poisoned").clone()
    }

    pub fn get(&self, project: &str, model: &str) -> Option<ModelRecord> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .get(project)
            .and_then(|m| m.get(model))
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("registry mutex poisoned").is_empty()
    }

    /// project → model names, as advertised in gossip and stored durably.
    pub fn project_models(&self) -> HashMap<String, Vec<String>> {
        let table = self.inner.lock().expect("registry mutex poisoned");
        table
            .iter()
            .map(|(project, models)| {
                let mut names: Vec<String> = models.keys().cloned().collect();
                names.sort();
                (project.clone(), names)
            })
            .collect()
    }

    /// Resolve a model and mark an invocation in flight. The returned guard
    /// decrements the counter when dropped, on every exit path.
    pub fn begin_invocation(&self, project: &str, model: &str) -> Option<(ModelRecord, IdleGuard)> {
        let record = self.get(project, model)?;
        self.update_idle(project, model, 1);
        Some((
            record,
            IdleGuard {
                registry: self.clone(),
                project: project.to_string(),
                model: model.to_string(),
            },
        ))
    }
}

/// Scope-guaranteed idle release. Holding this marks one invocation in flight.
pub struct IdleGuard {
    registry: LocalRegistry,
    project: String,
    model: String,
}

impl Drop for IdleGuard {
    fn drop(&mut self) {
        self.registry.update_idle(&self.project, &self.model, -1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(endpoint: &str) -> ModelRecord {
        ModelRecord {
            api_endpoint: endpoint.to_string(),
            kind: ModelKind::Chat,
            idle_count: 0,
        }
    }

    fn models(names: &[&str]) -> HashMap<String, ModelRecord> {
        names
            .iter()
            .map(|n| (n.to_string(), chat("http://127.0.0.1:8000/v1")))
            .collect()
    }

    #[test]
    fn register_then_snapshot() {
        let reg = LocalRegistry::new();
        reg.register("p", models(&["m1", "m2"]));
        let snap = reg.snapshot();
        assert_eq!(snap["p"].len(), 2);
        reg.unregister("p");
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn idle_count_saturates_at_zero() {
        let reg = LocalRegistry::new();
        reg.register("p", models(&["m"]));
        reg.update_idle("p", "m", -5);
        assert_eq!(reg.get("p", "m").unwrap().idle_count, 0);
        reg.update_idle("p", "m", 3);
        reg.update_idle("p", "m", -1);
        assert_eq!(reg.get("p", "m").unwrap().idle_count, 2);
    }

    #[test]
    fn reregistration_carries_idle_counts_over() {
        let reg = LocalRegistry::new();
        reg.register("p", models(&["kept", "dropped"]));
        reg.update_idle("p", "kept", 4);

        // New registration: "kept" survives with a new endpoint, "dropped"
        // goes away, "added" is new.
        let mut next = models(&["kept", "added"]);
        next.get_mut("kept").unwrap().api_endpoint = "http://127.0.0.1:9000/v1".into();
        reg.register("p", next);

        let kept = reg.get("p", "kept").unwrap();
        assert_eq!(kept.idle_count, 4);
        assert_eq!(kept.api_endpoint, "http://127.0.0.1:9000/v1");
        assert_eq!(reg.get("p", "added").unwrap().idle_count, 0);
        assert!(reg.get("p", "dropped").is_none());
    }

    #[test]
    fn idle_guard_releases_on_drop() {
        let reg = LocalRegistry::new();
        reg.register("p", models(&["m"]));
        {
            let (_record, _guard) = reg.begin_invocation("p", "m").unwrap();
            assert_eq!(reg.get("p", "m").unwrap().idle_count, 1);
            let (_r2, _g2) = reg.begin_invocation("p", "m").unwrap();
            assert_eq!(reg.get("p", "m").unwrap().idle_count, 2);
        }
        assert_eq!(reg.get("p", "m").unwrap().idle_count, 0);
    }

    #[test]
    fn begin_invocation_unknown_model_is_none() {
        let reg = LocalRegistry::new();
        assert!(reg.begin_invocation("p", "m").is_none());
    }

    #[test]
    fn idle_counter_conservation_under_concurrency() {
        let reg = LocalRegistry::new();
        reg.register("p", models(&["m"]));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    reg.update_idle("p", "m", 1);
                    reg.update_idle("p", "m", -1);
                }
            }));
        }
        // Concurrent re-registrations must not drop in-flight counters for
        // keys present throughout.
        let racer = {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    reg.register("p", models(&["m"]));
                }
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        racer.join().unwrap();
        assert_eq!(reg.get("p", "m").unwrap().idle_count, 0);
    }
}
