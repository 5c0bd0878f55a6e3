//! Keep-alive frames for idle links.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::framing::FrameWriter;
use crate::message::msg_type::HEARTBEAT;

/// Shortest interval a heartbeat task runs at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(50);

struct Running {
    reset: Arc<Notify>,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic heartbeat writer, at most one task at a time.
#[derive(Default)]
pub struct Heartbeat {
    running: Mutex<Option<Running>>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a heartbeat every `interval` of outbound silence, raised to at
    /// least [`MIN_INTERVAL`]. A zero interval disables heartbeats. No-op
    /// while a task is already running.
    pub fn start(&self, interval: Duration, writer: Arc<FrameWriter>) {
        if interval.is_zero() {
            debug!("heartbeat disabled");
            return;
        }
        let interval = interval.max(MIN_INTERVAL);
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let reset = Arc::new(Notify::new());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(heartbeat_loop(interval, writer, reset.clone(), stop.clone()));
        *running = Some(Running {
            reset,
            stop,
            handle,
        });
    }

    /// Restart the interval, e.g. after other outbound traffic.
    pub fn reset(&self) {
        if let Some(running) = self.running.lock().as_ref() {
            running.reset.notify_one();
        }
    }

    /// Stop the task. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.stop.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn heartbeat_loop(
    interval: Duration,
    writer: Arc<FrameWriter>,
    reset: Arc<Notify>,
    stop: CancellationToken,
) {
    debug!(?interval, "heartbeat started");
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            () = reset.notified() => continue,
            () = tokio::time::sleep(interval) => {
                // The read loop decides when the link is dead.
                if let Err(e) = writer.write_frame(&[HEARTBEAT]).await {
                    warn!(error = %e, "heartbeat write failed");
                }
            }
        }
    }
    debug!("heartbeat stopped");
}
