//! Peer ranking and proxy failover.
//!
//! Candidates come from the remote registry; connectivity and latency come
//! from the live session map. Connected peers beat unconnected, lighter load
//! beats heavier, then lower round-trip wins. Failover is strictly
//! sequential — the next candidate is tried only after the previous one has
//! fully failed — and gives up after three failures.

use crate::error::OverlayError;
use std::future::Future;

/// Ephemeral per-ranking view of one peer. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node_id: String,
    /// 1 when an authenticated session is currently established.
    pub connectivity: u8,
    /// Smoothed round-trip estimate; 0 means unmeasured.
    pub latency_ms: u32,
    pub idle_count: u32,
}

/// Candidate failures tolerated before a proxy call gives up.
pub const MAX_PROXY_FAILURES: u32 = 3;

/// Filter and order candidates. Unmeasured peers (`latency_ms == 0`) are
/// always discarded; `direct_only` additionally discards peers without an
/// established session.
pub fn rank(mut candidates: Vec<Candidate>, direct_only: bool) -> Vec<Candidate> {
    candidates.retain(|c| c.latency_ms != 0 && (!direct_only || c.connectivity == 1));
    candidates.sort_by_key(|c| (c.connectivity != 1, c.idle_count, c.latency_ms));
    candidates
}

/// Try ranked candidates in order until one succeeds or three have failed.
///
/// `attempt` re-issues the call against one candidate; any `Err` counts as a
/// failure (connect, timeout, decode, and non-zero application codes all end
/// up here). An empty candidate list fails immediately without any attempt.
pub async fn failover<T, F, Fut>(
    what: &str,
    candidates: &[Candidate],
    mut attempt: F,
) -> Result<T, OverlayError>
where
    F: FnMut(Candidate) -> Fut,
    Fut: Future<Output = Result<T, OverlayError>>,
{
    if candidates.is_empty() {
        return Err(OverlayError::NoReachablePeers(what.to_string()));
    }

    let mut failures = 0u32;
    for candidate in candidates {
        match attempt(candidate.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    "proxy candidate {} failed ({failures}/{MAX_PROXY_FAILURES}): {e}",
                    candidate.node_id
                );
                if failures >= MAX_PROXY_FAILURES {
                    break;
                }
            }
        }
    }
    Err(OverlayError::ProxyExhausted { attempts: failures })
}
