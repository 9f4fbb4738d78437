//! Request/response correlation.
//!
//! DESIGN
//! ======
//! `register` allocates the next request id and parks a oneshot sender in a
//! map keyed by that id. Whoever removes the entry first completes it:
//! `resolve`, `reject`, the timeout sweep, or `fail_all` on disconnect.
//! Because completion always goes through `HashMap::remove`, a second
//! completion for the same id finds nothing and returns `false`.
//!
//! One table lives as long as its `Session`, so ids keep increasing across
//! reconnects and a straggling response from a dead connection can never
//! match a request issued on the new one.
//!
//! Deadlines use `tokio::time::Instant` so paused-clock tests drive the sweep.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::SessionError;
use crate::message::RequestId;

type Outcome = Result<Value, SessionError>;

struct PendingRequest {
    issued_at: Instant,
    timeout_at: Instant,
    tx: oneshot::Sender<Outcome>,
}

/// Single-assignment result handle returned by `register`.
#[derive(Debug)]
pub struct ResponseSlot {
    id: RequestId,
    rx: oneshot::Receiver<Outcome>,
}

impl ResponseSlot {
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the request to be completed.
    ///
    /// # Errors
    ///
    /// Returns whatever error the request was rejected with, or
    /// [`SessionError::ConnectionLost`] if the table was dropped.
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or(Err(SessionError::ConnectionLost))
    }
}

pub struct CorrelationTable {
    next_id: AtomicU32,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: AtomicU32::new(1), pending: Mutex::new(HashMap::new()) }
    }

    /// Allocate an id and park a pending request that expires after `timeout`.
    pub fn register(&self, timeout: Duration) -> (RequestId, ResponseSlot) {
        self.register_at(timeout, Instant::now())
    }

    pub fn register_at(&self, timeout: Duration, now: Instant) -> (RequestId, ResponseSlot) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest { issued_at: now, timeout_at: now + timeout, tx };
        self.lock().insert(id, pending);
        (id, ResponseSlot { id, rx })
    }

    /// Complete `id` successfully. Returns `false` if it was not pending.
    pub fn resolve(&self, id: RequestId, payload: Value) -> bool {
        self.complete(id, Ok(payload))
    }

    /// Complete `id` with an error. Returns `false` if it was not pending.
    pub fn reject(&self, id: RequestId, error: SessionError) -> bool {
        self.complete(id, Err(error))
    }

    /// Reject, with `Timeout`, every request issued at least `timeout` ago.
    pub fn expire_older_than(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        self.drain_where(|p| p.issued_at + timeout <= now, &SessionError::Timeout)
    }

    /// Reject, with `Timeout`, every request whose deadline is at or before `now`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        self.drain_where(|p| p.timeout_at <= now, &SessionError::Timeout)
    }

    /// Reject every pending request with `error` and clear the table.
    pub fn fail_all(&self, error: SessionError) -> usize {
        self.drain_where(|_| true, &error)
    }

    #[must_use]
    pub fn is_pending(&self, id: RequestId) -> bool {
        self.lock().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn complete(&self, id: RequestId, outcome: Outcome) -> bool {
        let Some(pending) = self.lock().remove(&id) else {
            return false;
        };
        // the caller may have given up already; the entry is consumed either way
        let _ = pending.tx.send(outcome);
        true
    }

    fn drain_where(&self, mut matches: impl FnMut(&PendingRequest) -> bool, error: &SessionError) -> usize {
        let expired = {
            let mut pending = self.lock();
            let ids = pending.iter().filter(|(_, p)| matches(p)).map(|(id, _)| *id).collect::<Vec<_>>();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect::<Vec<_>>()
        };
        let count = expired.len();
        for request in expired {
            let _ = request.tx.send(Err(error.clone()));
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "correlation_test.rs"]
mod tests;
