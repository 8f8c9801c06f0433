//! In-flight request correlation.
//!
//! A slot is registered before the request bytes leave, so a response racing
//! the send is never lost. Each slot is completed exactly once: by a matching
//! response, by its waiter timing out, or by [`PendingRequests::abort_all`].
//! A waiter that is dropped before completion removes its own slot.

use crate::protocol::{RequestId, Response};
use crate::{Result, RomError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct Slot {
    tx: oneshot::Sender<Result<Response>>,
    method: String,
    submitted_at: Instant,
}

/// Per-session table of pending requests.
#[derive(Clone, Default)]
pub struct PendingRequests {
    slots: Arc<Mutex<HashMap<RequestId, Slot>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a slot for `id`. Fails if `id` already has one.
    pub fn prepare(&self, id: RequestId, method: &str) -> Result<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.lock();
        if slots.contains_key(&id) {
            return Err(RomError::DuplicateRequestId(id));
        }
        slots.insert(
            id,
            Slot {
                tx,
                method: method.to_string(),
                submitted_at: Instant::now(),
            },
        );
        Ok(PendingResponse {
            id,
            rx,
            pending: self.clone(),
            finished: false,
        })
    }

    /// Complete the slot matching `response.id`.
    ///
    /// Returns `false` for an orphaned response (unknown or expired id),
    /// which is logged and otherwise ignored.
    pub fn resolve(&self, response: Response) -> bool {
        let slot = response.id.and_then(|id| self.lock().remove(&id));
        match slot {
            Some(slot) => {
                debug!(
                    "Resolved '{}' (id={:?}) after {:?}",
                    slot.method,
                    response.id,
                    slot.submitted_at.elapsed()
                );
                // The waiter may have given up already; nothing left to do then.
                let _ = slot.tx.send(Ok(response));
                true
            }
            None => {
                warn!(
                    "Orphaned response for id {:?} (no pending request)",
                    response.id
                );
                false
            }
        }
    }

    /// Remove a slot without completing it. Used when the send itself fails.
    pub fn remove(&self, id: RequestId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fail every pending slot with an abort error carrying `reason`.
    pub fn abort_all(&self, reason: &str) -> usize {
        let drained: Vec<(RequestId, Slot)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, slot) in drained {
            debug!("Aborting '{}' (id={}): {}", slot.method, id, reason);
            let _ = slot.tx.send(Err(RomError::aborted(reason)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The receiving half of a pending slot.
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<Result<Response>>,
    pending: PendingRequests,
    finished: bool,
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.finished && self.pending.remove(self.id) {
            debug!("Waiter for id {} went away, slot removed", self.id);
        }
    }
}

impl PendingResponse {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the slot to complete, bounded by `timeout`.
    ///
    /// On timeout the slot is removed; a late response is then orphaned.
    pub async fn wait(mut self, timeout: Duration) -> Result<Response> {
        let outcome = tokio::time::timeout(timeout, &mut self.rx).await;
        self.finished = true;
        match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RomError::aborted("pending slot dropped")),
            Err(_) => {
                if self.pending.remove(self.id) {
                    return Err(RomError::Timeout(timeout));
                }
                // Completed between the deadline and the removal.
                match self.rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RomError::Timeout(timeout)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_prepare_then_resolve() {
        let pending = PendingRequests::new();
        let slot = pending.prepare(1, "invoke").unwrap();
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve(Response::success(Some(1), json!(true))));
        let response = slot.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.result(), Some(&json!(true)));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_duplicate_id_fails_fast() {
        let pending = PendingRequests::new();
        let _slot = pending.prepare(5, "create").unwrap();
        assert!(matches!(
            pending.prepare(5, "create"),
            Err(RomError::DuplicateRequestId(5))
        ));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_orphaned_response_is_ignored() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve(Response::success(Some(99), json!(null))));
        assert!(!pending.resolve(Response::success(None, json!(null))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_slot_and_orphans_late_response() {
        let pending = PendingRequests::new();
        let slot = pending.prepare(2, "invoke").unwrap();

        let result = slot.wait(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(RomError::Timeout(_))));
        assert!(pending.is_empty());

        assert!(!pending.resolve(Response::success(Some(2), json!(1))));
    }

    #[tokio::test]
    async fn test_abort_all_fails_every_waiter() {
        let pending = PendingRequests::new();
        let a = pending.prepare(1, "invoke").unwrap();
        let b = pending.prepare(2, "create").unwrap();

        assert_eq!(pending.abort_all("session closed"), 2);

        for slot in [a, b] {
            match slot.wait(Duration::from_secs(1)).await {
                Err(RomError::Aborted { reason }) => assert_eq!(reason, "session closed"),
                other => panic!("Expected Aborted, got: {:?}", other.map(|r| r.id)),
            }
        }
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_resolution_is_exactly_once() {
        let pending = PendingRequests::new();
        let slot = pending.prepare(3, "invoke").unwrap();

        assert!(pending.resolve(Response::success(Some(3), json!("first"))));
        assert_eq!(pending.abort_all("late abort"), 0);
        assert!(!pending.resolve(Response::success(Some(3), json!("second"))));

        let response = slot.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.result(), Some(&json!("first")));
    }

    #[tokio::test]
    async fn test_dropped_waiter_removes_its_slot() {
        let pending = PendingRequests::new();
        let never = pending.prepare(6, "invoke").unwrap();
        drop(never);
        assert!(pending.is_empty());

        let slot = pending.prepare(7, "invoke").unwrap();
        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), slot.wait(Duration::from_secs(30))).await;
        assert!(cancelled.is_err());
        assert!(pending.is_empty());
        assert!(!pending.resolve(Response::success(Some(7), json!(1))));
    }

    #[test]
    fn test_remove_after_send_failure() {
        let pending = PendingRequests::new();
        let _slot = pending.prepare(4, "invoke").unwrap();
        assert!(pending.remove(4));
        assert!(!pending.remove(4));
    }
}
