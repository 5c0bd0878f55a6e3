//! Fan-in barrier for reconnect attempts.
//!
//! Callers that find the link down [`join`](ReconnectGate::join) the current
//! generation. The first joiner of a generation is told to start the
//! reconnect; everyone else just waits. [`flush`](ReconnectGate::flush)
//! releases the whole generation with one outcome and opens a fresh one, so a
//! caller joining after the flush never sees the old outcome.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::ClientError;

type Outcome = Option<Result<(), ClientError>>;

struct Generation {
    tx: watch::Sender<Outcome>,
    reconnecting: bool,
}

impl Generation {
    fn fresh() -> Self {
        Self {
            tx: watch::Sender::new(None),
            reconnecting: false,
        }
    }
}

/// Generation-counted reconnect barrier.
pub struct ReconnectGate {
    current: Mutex<Generation>,
}

/// A place in one gate generation.
pub struct GateTicket {
    rx: watch::Receiver<Outcome>,
    leader: bool,
}

impl Default for ReconnectGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectGate {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Generation::fresh()),
        }
    }

    /// Join the current generation. The returned ticket is the leader if no
    /// reconnect is running for this generation yet.
    pub fn join(&self) -> GateTicket {
        let mut generation = self.current.lock();
        let leader = !generation.reconnecting;
        generation.reconnecting = true;
        GateTicket {
            rx: generation.tx.subscribe(),
            leader,
        }
    }

    /// Release every waiter of the current generation and open a new one.
    pub fn flush(&self, outcome: Result<(), ClientError>) {
        let old = std::mem::replace(&mut *self.current.lock(), Generation::fresh());
        old.tx.send_replace(Some(outcome));
    }

    /// Whether anyone still holds a ticket for the current generation.
    pub fn has_waiters(&self) -> bool {
        self.current.lock().tx.receiver_count() > 0
    }
}

impl GateTicket {
    /// This ticket must start the reconnect.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Wait for the generation's outcome, or `Timeout` after `timeout`.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<(), ClientError> {
        let outcome = async {
            match self.rx.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone().unwrap_or(Err(ClientError::Disconnected)),
                Err(_) => Err(ClientError::Disconnected),
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, outcome)
                .await
                .unwrap_or(Err(ClientError::Timeout)),
            None => outcome.await,
        }
    }
}
