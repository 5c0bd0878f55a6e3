//! Binary request/reply and signal protocol over framed byte streams: wire
//! codec, client connection engine with autoconnect and sessions, and a
//! reference server.

pub mod client;
pub mod context;
pub mod error;
pub mod framing;
pub mod gate;
pub mod heartbeat;
pub mod memory;
pub mod message;
pub mod platform;
pub mod requests;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{
    Client, ClientHooks, ClientOptions, ConnectionState, ConnectionStateWatch, NoHooks,
};
pub use context::CallContext;
pub use error::ClientError;
pub use framing::{FrameError, FrameReader, FrameWriter, read_frame, write_frame};
pub use memory::MemoryDialer;
pub use message::{Encoding, Message, MessageError, Payload, RequestId, ServerConfiguration};
pub use platform::{KeepaliveConfig, SocketConfig};
pub use server::{
    ClientConnection, ConnectionId, ConnectionRegistry, HandlerError, Server, ServerError,
    ServerHandler, ServerOptions,
};
pub use session::{MemorySessionManager, Session, SessionManager};
pub use transport::{Connection, Dialer, TcpDialer};
