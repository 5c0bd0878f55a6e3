//! Correlation of outbound requests with their replies.
//!
//! Every pending request owns a one-shot slot. `fulfill` and `fail` remove
//! the entry under the table's write lock before delivering, so at most one
//! delivery succeeds per identifier.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::context::CallContext;
use crate::error::ClientError;
use crate::message::{Payload, RequestId};

type ReplySlot = oneshot::Sender<Result<Payload, ClientError>>;

struct PendingEntry {
    // Distinguishes a re-used identifier from the entry a dropped handle owned.
    seq: u64,
    slot: ReplySlot,
}

#[derive(Default)]
struct Inner {
    pending: RwLock<HashMap<RequestId, PendingEntry>>,
    next_seq: AtomicU64,
}

/// Identifier-indexed table of in-flight requests.
#[derive(Clone, Default)]
pub struct RequestManager {
    inner: Arc<Inner>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request under a fresh, non-zero identifier.
    pub fn create(&self, timeout: Duration) -> Request {
        let (tx, rx) = oneshot::channel();
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.inner.pending.write();
        let id = loop {
            let id = RequestId::from_u64(rand::random::<u64>());
            if !id.is_zero() && !pending.contains_key(&id) {
                break id;
            }
        };
        pending.insert(id, PendingEntry { seq, slot: tx });
        drop(pending);

        Request {
            id,
            seq,
            timeout,
            reply: rx,
            manager: self.clone(),
        }
    }

    /// Deliver a reply. Returns false if nobody is waiting for `id`.
    pub fn fulfill(&self, id: RequestId, payload: Payload) -> bool {
        self.deliver(id, Ok(payload))
    }

    /// Deliver a failure. Returns false if nobody is waiting for `id`.
    pub fn fail(&self, id: RequestId, error: ClientError) -> bool {
        self.deliver(id, Err(error))
    }

    /// Fail every pending request with the same error.
    pub fn fail_all(&self, error: &ClientError) {
        let drained: Vec<_> = self.inner.pending.write().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), %error, "failing pending requests");
        }
        for (_, entry) in drained {
            let _ = entry.slot.send(Err(error.clone()));
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.read().len()
    }

    fn deliver(&self, id: RequestId, result: Result<Payload, ClientError>) -> bool {
        let Some(entry) = self.inner.pending.write().remove(&id) else {
            debug!(%id, "reply for unknown request dropped");
            return false;
        };
        entry.slot.send(result).is_ok()
    }

    fn deregister(&self, id: RequestId, seq: u64) {
        let mut pending = self.inner.pending.write();
        if pending.get(&id).is_some_and(|entry| entry.seq == seq) {
            pending.remove(&id);
        }
    }
}

/// Handle to one pending request. Dropping it deregisters the request.
pub struct Request {
    id: RequestId,
    seq: u64,
    timeout: Duration,
    reply: oneshot::Receiver<Result<Payload, ClientError>>,
    manager: RequestManager,
}

impl Request {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the reply, the caller's cancellation or the deadline.
    ///
    /// The caller's deadline wins over the default timeout and expires with
    /// [`ClientError::DeadlineExceeded`]; the default timeout expires with
    /// [`ClientError::Timeout`].
    pub async fn await_reply(mut self, ctx: &CallContext) -> Result<Payload, ClientError> {
        let (deadline, expired) = match ctx.get_deadline() {
            Some(deadline) => (deadline, ClientError::DeadlineExceeded),
            None => (Instant::now() + self.timeout, ClientError::Timeout),
        };

        tokio::select! {
            biased;
            reply = &mut self.reply => reply.unwrap_or(Err(ClientError::Disconnected)),
            () = ctx.canceled() => Err(ClientError::Canceled),
            () = tokio::time::sleep_until(deadline) => Err(expired),
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.manager.deregister(self.id, self.seq);
    }
}
