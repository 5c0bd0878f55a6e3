//! Errors surfaced to callers of the client.

use std::sync::Arc;

use crate::framing::FrameError;
use crate::message::{MessageError, SpecialReply};

/// Every failure a client call can report.
///
/// `Clone` so a single reconnect outcome can be handed to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// No usable connection and no way to get one.
    #[error("not connected")]
    Disconnected,

    /// The default request timeout or an autoconnect wait elapsed.
    #[error("timed out")]
    Timeout,

    /// The caller-supplied deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The caller canceled the call.
    #[error("canceled")]
    Canceled,

    /// A malformed message, detected locally or reported by the server.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The server's request handler returned an application error.
    #[error("application error {code}: {message}")]
    Application {
        /// Application error code.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// The server failed internally. No details are exposed.
    #[error("internal server error")]
    Internal,

    /// The session to restore does not exist on the server.
    #[error("session not found")]
    SessionNotFound,

    /// The server has sessions disabled.
    #[error("sessions are disabled")]
    SessionsDisabled,

    /// The session already has the maximum number of connections.
    #[error("session connection limit reached")]
    MaxSessionConnections,

    /// The outbound frame is larger than the negotiated buffer size.
    #[error("message of {size} bytes exceeds buffer size {max}")]
    BufferOverflow {
        /// Encoded frame size.
        size: usize,
        /// Negotiated maximum.
        max: u32,
    },

    /// The server is shutting down and refused the request.
    #[error("server is shutting down")]
    ServerShutdown,

    /// The server speaks a different protocol major version.
    #[error("incompatible protocol major version {major}")]
    IncompatibleProtocol {
        /// Major version advertised by the server.
        major: u8,
    },

    /// A session is already attached; close it before restoring another.
    #[error("a session is already active")]
    SessionAlreadyActive,

    /// The underlying stream failed.
    #[error("transport error: {0}")]
    Transport(Arc<std::io::Error>),

    /// The first frame from the server was not a configuration message.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl ClientError {
    /// Worth trying again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Disconnected
                | ClientError::Timeout
                | ClientError::DeadlineExceeded
                | ClientError::Transport(_)
                | ClientError::ServerShutdown
        )
    }

    /// Retrying the same call will fail the same way.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientError::Protocol(_)
                | ClientError::Application { .. }
                | ClientError::SessionsDisabled
                | ClientError::SessionNotFound
                | ClientError::IncompatibleProtocol { .. }
                | ClientError::SessionAlreadyActive
                | ClientError::BufferOverflow { .. }
        )
    }

    /// Map an identifier-only reply to its error.
    pub fn from_special_reply(kind: SpecialReply) -> Self {
        match kind {
            SpecialReply::Shutdown => ClientError::ServerShutdown,
            SpecialReply::InternalError => ClientError::Internal,
            SpecialReply::SessionNotFound => ClientError::SessionNotFound,
            SpecialReply::MaxSessionConnections => ClientError::MaxSessionConnections,
            SpecialReply::SessionsDisabled => ClientError::SessionsDisabled,
            SpecialReply::ProtocolError => {
                ClientError::Protocol("server rejected the request as malformed".into())
            }
        }
    }
}

impl From<MessageError> for ClientError {
    fn from(e: MessageError) -> Self {
        ClientError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Transport(Arc::new(e))
    }
}

impl From<FrameError> for ClientError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::PayloadTooLarge { size, max } => ClientError::BufferOverflow { size, max },
            FrameError::ConnectionClosed => ClientError::Disconnected,
            FrameError::Io(e) => ClientError::Transport(Arc::new(e)),
        }
    }
}
