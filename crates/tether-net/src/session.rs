//! Server-issued sessions and their storage.
//!
//! A session travels on the wire as a JSON document:
//!
//! ```text
//! {"key": "...", "creation": <ms since epoch>, "last_lookup": <ms since epoch>, "info": <any>}
//! ```

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Length of generated session keys, in hex characters.
const SESSION_KEY_LEN: usize = 32;

/// Identity state a connection can carry across reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Key used to restore the session.
    pub key: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub creation: u64,
    /// Last time the session was looked up, milliseconds since the Unix epoch.
    pub last_lookup: u64,
    /// Application data attached at creation.
    #[serde(default)]
    pub info: Option<serde_json::Value>,
}

impl Session {
    /// New session with a random key.
    pub fn new(info: Option<serde_json::Value>) -> Self {
        let now = now_millis();
        Self {
            key: generate_key(),
            creation: now,
            last_lookup: now,
            info,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Random lowercase hex session key.
pub fn generate_key() -> String {
    let bytes: [u8; SESSION_KEY_LEN / 2] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Errors reported by a session store.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The backing store failed.
    #[error("session store failure: {0}")]
    Store(String),
}

/// Session storage used by the server.
#[async_trait]
pub trait SessionManager: Send + Sync + 'static {
    /// Persist a freshly created session.
    async fn session_created(&self, session: &Session) -> Result<(), SessionError>;

    /// Find a session by key, refreshing its lookup time.
    async fn session_lookup(&self, key: &str) -> Result<Option<Session>, SessionError>;

    /// Forget a session.
    async fn session_closed(&self, key: &str) -> Result<(), SessionError>;
}

/// In-memory session store.
#[derive(Default)]
pub struct MemorySessionManager {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionManager for MemorySessionManager {
    async fn session_created(&self, session: &Session) -> Result<(), SessionError> {
        self.sessions
            .write()
            .await
            .insert(session.key.clone(), session.clone());
        Ok(())
    }

    async fn session_lookup(&self, key: &str) -> Result<Option<Session>, SessionError> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.get_mut(key).map(|session| {
            session.last_lookup = now_millis();
            session.clone()
        }))
    }

    async fn session_closed(&self, key: &str) -> Result<(), SessionError> {
        self.sessions.write().await.remove(key);
        Ok(())
    }
}
