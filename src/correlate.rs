//! Correlation queue — bridges a synchronous caller with a reply that
//! arrives on the asynchronous broadcast channel.
//!
//! Outstanding requests are a linear-scan list under one lock; at the
//! expected scale (bounded by façade concurrency) that beats a map. For a
//! given id, exactly one of `complete` or `cancel` consumes the entry; the
//! loser is a no-op.

use crate::envelope::Envelope;
use crate::error::OverlayError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Fixed per-exchange deadline; not configurable per call.
pub const EXCHANGE_DEADLINE: Duration = Duration::from_secs(120);

struct Pending {
    id: String,
    tx: oneshot::Sender<Envelope>,
}

#[derive(Clone, Default)]
pub struct CorrelationQueue {
    inner: Arc<Mutex<Vec<Pending>>>,
}

impl CorrelationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding request and get its single-use delivery slot.
    pub fn enqueue(&self, id: &str) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .expect("correlation mutex poisoned")
            .push(Pending { id: id.to_string(), tx });
        rx
    }

    /// Deliver a response into the matching slot and remove it.
    /// Returns false (no-op) when the id is absent — already completed or
    /// timed out.
    pub fn complete(&self, id: &str, payload: Envelope) -> bool {
        let entry = {
            let mut pending = self.inner.lock().expect("correlation mutex poisoned");
            match pending.iter().position(|p| p.id == id) {
                Some(idx) => Some(pending.swap_remove(idx)),
                None => None,
            }
        };
        match entry {
            // A dropped receiver just means the caller gave up first.
            Some(p) => p.tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Remove and close a slot without delivering (timeout path).
    pub fn cancel(&self, id: &str) -> bool {
        let mut pending = self.inner.lock().expect("correlation mutex poisoned");
        match pending.iter().position(|p| p.id == id) {
            Some(idx) => {
                pending.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("correlation mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the slot to produce a value or the fixed deadline to elapse.
    /// On timeout the entry is cancelled here so a late response cannot leak
    /// a queue entry.
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<Envelope>,
    ) -> Result<Envelope, OverlayError> {
        self.wait_with_deadline(id, rx, EXCHANGE_DEADLINE).await
    }

    async fn wait_with_deadline(
        &self,
        id: &str,
        rx: oneshot::Receiver<Envelope>,
        deadline: Duration,
    ) -> Result<Envelope, OverlayError> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            // Sender dropped without delivering: someone cancelled under us.
            Ok(Err(_)) => Err(OverlayError::Timeout),
            Err(_) => {
                self.cancel(id);
                Err(OverlayError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;

    fn test_envelope(id: &str) -> Envelope {
        let key = iroh::SecretKey::from_bytes(&[1u8; 32]);
        let mut env = Envelope::request(
            MessageType::PeerIdentityRequest,
            &key.public().into(),
            "",
            vec![1],
        );
        env.id = id.to_string();
        env
    }

    #[tokio::test]
    async fn complete_delivers_exactly_once() {
        let queue = CorrelationQueue::new();
        let rx = queue.enqueue("req-1");

        assert!(queue.complete("req-1", test_envelope("req-1")));
        // Second completion for the same id is a no-op.
        assert!(!queue.complete("req-1", test_envelope("req-1")));

        let got = rx.await.unwrap();
        assert_eq!(got.id, "req-1");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn cancel_then_complete_is_noop() {
        let queue = CorrelationQueue::new();
        let rx = queue.enqueue("req-2");

        assert!(queue.cancel("req-2"));
        assert!(!queue.complete("req-2", test_envelope("req-2")));
        assert!(rx.await.is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn complete_then_cancel_is_noop() {
        let queue = CorrelationQueue::new();
        let _rx = queue.enqueue("req-3");

        assert!(queue.complete("req-3", test_envelope("req-3")));
        assert!(!queue.cancel("req-3"));
    }

    #[tokio::test]
    async fn unknown_id_is_noop() {
        let queue = CorrelationQueue::new();
        assert!(!queue.complete("ghost", test_envelope("ghost")));
        assert!(!queue.cancel("ghost"));
    }

    #[tokio::test]
    async fn wait_times_out_and_removes_entry() {
        let queue = CorrelationQueue::new();
        let rx = queue.enqueue("req-4");

        let err = queue
            .wait_with_deadline("req-4", rx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::Timeout));
        // Timeout path removed the entry; a late response is a no-op.
        assert!(queue.is_empty());
        assert!(!queue.complete("req-4", test_envelope("req-4")));
    }

    #[tokio::test]
    async fn wait_returns_delivered_payload() {
        let queue = CorrelationQueue::new();
        let rx = queue.enqueue("req-5");

        let q2 = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            q2.complete("req-5", test_envelope("req-5"));
        });

        let got = queue
            .wait_with_deadline("req-5", rx, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got.id, "req-5");
    }

    #[tokio::test]
    async fn concurrent_complete_and_cancel_exactly_one_wins() {
        for _ in 0..50 {
            let queue = CorrelationQueue::new();
            let _rx = queue.enqueue("race");
            let q1 = queue.clone();
            let q2 = queue.clone();
            let a = tokio::spawn(async move { q1.complete("race", test_envelope("race")) });
            let b = tokio::spawn(async move { q2.cancel("race") });
            let (a, b) = (a.await.unwrap(), b.await.unwrap());
            assert!(a ^ b, "exactly one of complete/cancel must win");
            assert!(queue.is_empty());
        }
    }
}
