//! In-process transport for tests and embedding.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::server::Server;
use crate::transport::{Connection, Dialer};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Dials an in-process [`Server`] over a `tokio::io::duplex` pipe.
///
/// Counts dial attempts and can be taken offline to make dials fail.
#[derive(Clone)]
pub struct MemoryDialer {
    server: Server,
    dials: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

impl MemoryDialer {
    pub fn new(server: Server) -> Self {
        Self {
            server,
            dials: Arc::new(AtomicUsize::new(0)),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Dial attempts so far, failed ones included.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Make later dials fail with `ConnectionRefused`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> std::io::Result<Connection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory transport offline",
            ));
        }
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.server.serve(Connection::from_stream(server, "memory-client"));
        Ok(Connection::from_stream(client, "memory"))
    }

    fn address(&self) -> String {
        "memory".to_string()
    }
}
