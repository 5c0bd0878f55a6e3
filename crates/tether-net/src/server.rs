//! Reference server: accepts connections, runs the handshake and dispatches
//! requests, signals and session operations to a [`ServerHandler`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::framing::{DEFAULT_MAX_FRAME_SIZE, FrameError, FrameReader, FrameWriter};
use crate::message::{
    Message, MessageError, Name, Payload, RequestId, ServerConfiguration, SpecialReply,
};
use crate::platform::{SocketConfig, configure_stream};
use crate::session::{MemorySessionManager, Session, SessionError, SessionManager};
use crate::transport::Connection;

/// Unique identifier for a connection within one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure returned by [`ServerHandler::on_request`].
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Reported to the client as an error reply with code and message.
    #[error("application error {code}: {message}")]
    Application {
        /// Error code, 1-255 printable ASCII bytes.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// Logged here; the client only learns that something failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn application(code: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Application {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Errors from server-side connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The server has sessions disabled.
    #[error("sessions are disabled")]
    SessionsDisabled,
    /// The connection already carries a session.
    #[error("connection already has a session")]
    SessionAlreadyActive,
    /// The session reached its connection limit.
    #[error("session connection limit reached")]
    MaxSessionConnections,
    /// The server that owned the connection is gone.
    #[error("server stopped")]
    Stopped,
    /// Building the outbound message failed.
    #[error("invalid message: {0}")]
    Message(#[from] MessageError),
    /// Writing the frame failed.
    #[error("write failed: {0}")]
    Frame(#[from] FrameError),
    /// The session store failed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Session info could not be serialized.
    #[error("session encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Application callbacks.
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// A connection finished its handshake.
    async fn on_client_connected(&self, _client: &ClientConnection) {}

    /// A connection is gone.
    async fn on_client_disconnected(&self, _client: &ClientConnection) {}

    /// The client sent a signal.
    async fn on_signal(&self, _client: &ClientConnection, _name: Option<&str>, _payload: Payload) {
    }

    /// The client sent a request. The returned payload becomes the reply.
    async fn on_request(
        &self,
        client: &ClientConnection,
        name: Option<&str>,
        payload: Payload,
    ) -> Result<Payload, HandlerError>;
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Allow session creation and restore. Default: true.
    pub sessions_enabled: bool,
    /// Maximum concurrent connections, 0 for unlimited. Default: 1024.
    pub max_connections: usize,
    /// Maximum connections sharing one session, 0 for unlimited. Default: 0.
    pub max_session_connections: usize,
    /// Close a connection after this long without a frame. Zero disables. Default: 60s.
    pub read_timeout: Duration,
    /// Largest frame accepted, in bytes. Default: 1 MiB.
    pub buffer_size: u32,
    /// Sub-protocol name advertised in the handshake.
    pub sub_protocol: Option<String>,
    /// Socket options for accepted TCP connections.
    pub socket: SocketConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            sessions_enabled: true,
            max_connections: 1024,
            max_session_connections: 0,
            read_timeout: Duration::from_secs(60),
            buffer_size: DEFAULT_MAX_FRAME_SIZE,
            sub_protocol: None,
            socket: SocketConfig::default(),
        }
    }
}

/// Error returned when the registry is at capacity.
#[derive(Debug)]
pub struct ConnectionLimitReached;

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ClientConnection>,
    session_connections: HashMap<String, usize>,
}

/// Live connections and how many of them share each session.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryState>,
    max_connections: usize,
    max_session_connections: usize,
}

impl ConnectionRegistry {
    /// Create a registry with the given limits (0 = unlimited).
    pub fn new(max_connections: usize, max_session_connections: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryState::default()),
            max_connections,
            max_session_connections,
        }
    }

    /// Register a connection. Returns `Err` if the registry is at capacity.
    pub async fn insert(&self, client: ClientConnection) -> Result<(), ConnectionLimitReached> {
        let mut state = self.inner.write().await;
        if self.max_connections != 0 && state.connections.len() >= self.max_connections {
            return Err(ConnectionLimitReached);
        }
        state.connections.insert(client.id(), client);
        Ok(())
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, id: ConnectionId) -> Option<ClientConnection> {
        self.inner.write().await.connections.remove(&id)
    }

    /// Snapshot of every live connection.
    pub async fn connections(&self) -> Vec<ClientConnection> {
        self.inner.read().await.connections.values().cloned().collect()
    }

    /// Return the number of live connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Return whether no connection is live.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.connections.is_empty()
    }

    /// Count one more connection on `key`. False if the session is full.
    pub async fn attach_session(&self, key: &str) -> bool {
        let mut state = self.inner.write().await;
        let count = state.session_connections.entry(key.to_string()).or_default();
        if self.max_session_connections != 0 && *count >= self.max_session_connections {
            return false;
        }
        *count += 1;
        true
    }

    /// Count one connection less on `key`.
    pub async fn detach_session(&self, key: &str) {
        let mut state = self.inner.write().await;
        if let Some(count) = state.session_connections.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.session_connections.remove(key);
            }
        }
    }

    /// Connections currently attached to `key`.
    pub async fn session_connections(&self, key: &str) -> usize {
        self.inner
            .read()
            .await
            .session_connections
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

struct Shared {
    options: ServerOptions,
    handler: Arc<dyn ServerHandler>,
    sessions: Arc<dyn SessionManager>,
    registry: ConnectionRegistry,
    ids: IdGenerator,
    draining: AtomicBool,
    // Stops the accept loop.
    shutdown: CancellationToken,
    // Closes every connection.
    stop: CancellationToken,
}

struct ClientConnectionInner {
    id: ConnectionId,
    remote_addr: String,
    writer: Arc<FrameWriter>,
    session: parking_lot::Mutex<Option<Session>>,
    closed: CancellationToken,
    server: Weak<Shared>,
}

/// Server-side handle to one client connection.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<ClientConnectionInner>,
}

impl ClientConnection {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// The session attached to this connection.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.lock().clone()
    }

    /// Create a session for this connection and notify the client.
    pub async fn create_session(
        &self,
        info: Option<serde_json::Value>,
    ) -> Result<Session, ServerError> {
        let shared = self.server()?;
        if !shared.options.sessions_enabled {
            return Err(ServerError::SessionsDisabled);
        }
        if self.inner.session.lock().is_some() {
            return Err(ServerError::SessionAlreadyActive);
        }

        let session = Session::new(info);
        let frame = Message::SessionCreated {
            info: session.to_bytes()?,
        };
        if !shared.registry.attach_session(&session.key).await {
            return Err(ServerError::MaxSessionConnections);
        }
        if let Err(e) = shared.sessions.session_created(&session).await {
            shared.registry.detach_session(&session.key).await;
            return Err(e.into());
        }
        *self.inner.session.lock() = Some(session.clone());
        self.send(&frame).await?;
        info!(connection = %self.id(), key = %session.key, "session created");
        Ok(session)
    }

    /// Close the attached session and notify the client.
    pub async fn close_session(&self) -> Result<(), ServerError> {
        let shared = self.server()?;
        let attached = self.inner.session.lock().take();
        let Some(session) = attached else {
            return Ok(());
        };
        shared.sessions.session_closed(&session.key).await?;
        shared.registry.detach_session(&session.key).await;
        self.send(&Message::SessionClosed).await?;
        info!(connection = %self.id(), key = %session.key, "session closed");
        Ok(())
    }

    /// Send a signal to the client.
    pub async fn signal(&self, name: Option<&str>, payload: Payload) -> Result<(), ServerError> {
        self.send(&Message::signal(name, payload)?).await
    }

    /// Close the connection.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    fn server(&self) -> Result<Arc<Shared>, ServerError> {
        self.inner.server.upgrade().ok_or(ServerError::Stopped)
    }

    async fn send(&self, message: &Message) -> Result<(), ServerError> {
        let frame = message.encode()?;
        self.inner.writer.write_frame(&frame).await?;
        Ok(())
    }

    async fn reply(&self, message: Message) {
        if let Err(e) = self.send(&message).await {
            warn!(connection = %self.id(), error = %e, "failed to send reply");
        }
    }
}

/// The reference server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Server with in-memory session storage.
    pub fn new(options: ServerOptions, handler: Arc<dyn ServerHandler>) -> Self {
        Self::with_session_manager(options, handler, Arc::new(MemorySessionManager::new()))
    }

    /// Server with a custom session store.
    pub fn with_session_manager(
        options: ServerOptions,
        handler: Arc<dyn ServerHandler>,
        sessions: Arc<dyn SessionManager>,
    ) -> Self {
        let registry =
            ConnectionRegistry::new(options.max_connections, options.max_session_connections);
        Self {
            shared: Arc::new(Shared {
                options,
                handler,
                sessions,
                registry,
                ids: IdGenerator::new(),
                draining: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    /// Run the accept loop until [`shutdown`](Self::shutdown).
    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = ?listener.local_addr().ok(), "server listening");
        loop {
            tokio::select! {
                () = self.shared.shutdown.cancelled() => break,
                result = listener.accept() => {
                    let (stream, peer_addr) = result?;
                    if let Err(e) = configure_stream(&stream, &self.shared.options.socket) {
                        warn!(%peer_addr, error = %e, "failed to configure socket");
                    }
                    self.serve(Connection::from_tcp(stream));
                }
            }
        }
        info!("server stopped accepting connections");
        Ok(())
    }

    /// Serve one connection over any byte stream.
    pub fn serve(&self, connection: Connection) -> JoinHandle<()> {
        tokio::spawn(handle_connection(Arc::clone(&self.shared), connection))
    }

    /// Stop accepting connections and answer every further request with a
    /// shutdown reply. Existing connections stay open.
    pub fn shutdown(&self) {
        self.shared.draining.store(true, Ordering::SeqCst);
        self.shared.shutdown.cancel();
    }

    /// Shut down and close every connection.
    pub fn stop(&self) {
        self.shutdown();
        self.shared.stop.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.draining.load(Ordering::SeqCst)
    }
}

async fn handle_connection(shared: Arc<Shared>, connection: Connection) {
    let Connection {
        mut reader,
        writer,
        remote_addr,
    } = connection;
    reader.set_max_frame_size(shared.options.buffer_size);
    let writer = Arc::new(writer);

    let client = ClientConnection {
        inner: Arc::new(ClientConnectionInner {
            id: shared.ids.next_id(),
            remote_addr,
            writer: Arc::clone(&writer),
            session: parking_lot::Mutex::new(None),
            closed: CancellationToken::new(),
            server: Arc::downgrade(&shared),
        }),
    };
    let id = client.id();

    if shared.stop.is_cancelled() || shared.registry.insert(client.clone()).await.is_err() {
        warn!(connection = %id, remote = %client.remote_addr(), "rejecting connection");
        writer.close().await;
        return;
    }

    let config = ServerConfiguration::new(shared.options.read_timeout, shared.options.buffer_size)
        .with_sub_protocol(shared.options.sub_protocol.clone());
    if let Err(e) = client.send(&Message::Configuration(config)).await {
        warn!(connection = %id, error = %e, "handshake failed");
        shared.registry.remove(id).await;
        return;
    }
    info!(connection = %id, remote = %client.remote_addr(), "client connected");
    shared.handler.on_client_connected(&client).await;

    loop {
        let frame = tokio::select! {
            () = client.inner.closed.cancelled() => break,
            () = shared.stop.cancelled() => break,
            frame = read_with_timeout(&mut reader, shared.options.read_timeout) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(ReadEnd::TimedOut) => {
                info!(connection = %id, "read timeout");
                break;
            }
            Err(ReadEnd::Frame(FrameError::ConnectionClosed)) => break,
            Err(ReadEnd::Frame(e)) => {
                warn!(connection = %id, error = %e, "read failed");
                break;
            }
        };

        match Message::decode(&frame) {
            Ok(Some(message)) => {
                if let Err(violation) = dispatch(&shared, &client, message).await {
                    warn!(connection = %id, %violation, "protocol violation, closing connection");
                    break;
                }
            }
            Ok(None) => debug!(
                connection = %id,
                message_type = frame.first().copied().unwrap_or_default(),
                "ignoring unknown message type"
            ),
            Err(e) => {
                warn!(connection = %id, error = %e, "malformed frame, closing connection");
                break;
            }
        }
    }

    shared.registry.remove(id).await;
    if let Some(session) = client.session() {
        shared.registry.detach_session(&session.key).await;
    }
    writer.close().await;
    info!(connection = %id, "client disconnected");
    shared.handler.on_client_disconnected(&client).await;
}

enum ReadEnd {
    TimedOut,
    Frame(FrameError),
}

async fn read_with_timeout(reader: &mut FrameReader, timeout: Duration) -> Result<Vec<u8>, ReadEnd> {
    if timeout.is_zero() {
        return reader.read_frame().await.map_err(ReadEnd::Frame);
    }
    match tokio::time::timeout(timeout, reader.read_frame()).await {
        Ok(frame) => frame.map_err(ReadEnd::Frame),
        Err(_) => Err(ReadEnd::TimedOut),
    }
}

/// Route one inbound message. `Err` names a message a client may not send.
async fn dispatch(
    shared: &Arc<Shared>,
    client: &ClientConnection,
    message: Message,
) -> Result<(), &'static str> {
    match message {
        Message::Heartbeat => {}
        Message::Request { id, name, payload } => {
            if shared.draining.load(Ordering::SeqCst) {
                client.reply(special(id, SpecialReply::Shutdown)).await;
                return Ok(());
            }
            let handler = Arc::clone(&shared.handler);
            let client = client.clone();
            tokio::spawn(async move {
                let name = name.as_ref().map(Name::as_str);
                let result = handler.on_request(&client, name, payload).await;
                client.reply(request_reply(&client, id, result)).await;
            });
        }
        Message::Signal { name, payload } => {
            let handler = Arc::clone(&shared.handler);
            let client = client.clone();
            tokio::spawn(async move {
                handler
                    .on_signal(&client, name.as_ref().map(Name::as_str), payload)
                    .await;
            });
        }
        Message::RestoreSession { id, key } => {
            let reply = restore_session(shared, client, id, &key).await;
            client.reply(reply).await;
        }
        Message::CloseSession { id } => {
            let reply = close_session(shared, client, id).await;
            client.reply(reply).await;
        }
        Message::Configuration(_) => return Err("configuration"),
        Message::Reply { .. } => return Err("reply"),
        Message::ErrorReply { .. } => return Err("error reply"),
        Message::SpecialReply { .. } => return Err("special reply"),
        Message::SessionCreated { .. } => return Err("session created"),
        Message::SessionClosed => return Err("session closed"),
    }
    Ok(())
}

fn special(id: RequestId, kind: SpecialReply) -> Message {
    Message::SpecialReply { id, kind }
}

fn request_reply(
    client: &ClientConnection,
    id: RequestId,
    result: Result<Payload, HandlerError>,
) -> Message {
    match result {
        Ok(payload) => Message::Reply { id, payload },
        Err(HandlerError::Application { code, message }) => {
            Message::error_reply(id, &code, message).unwrap_or_else(|e| {
                warn!(connection = %client.id(), error = %e, "handler returned an invalid error code");
                special(id, SpecialReply::InternalError)
            })
        }
        Err(HandlerError::Internal(detail)) => {
            warn!(connection = %client.id(), %detail, "request handler failed");
            special(id, SpecialReply::InternalError)
        }
    }
}

async fn restore_session(
    shared: &Shared,
    client: &ClientConnection,
    id: RequestId,
    key: &str,
) -> Message {
    if !shared.options.sessions_enabled {
        return special(id, SpecialReply::SessionsDisabled);
    }
    let session = match shared.sessions.session_lookup(key).await {
        Ok(Some(session)) => session,
        Ok(None) => return special(id, SpecialReply::SessionNotFound),
        Err(e) => {
            warn!(connection = %client.id(), error = %e, "session lookup failed");
            return special(id, SpecialReply::InternalError);
        }
    };
    let info = match session.to_bytes() {
        Ok(info) => info,
        Err(e) => {
            warn!(connection = %client.id(), error = %e, "session encoding failed");
            return special(id, SpecialReply::InternalError);
        }
    };

    let already_attached = client
        .session()
        .is_some_and(|current| current.key == session.key);
    if !already_attached {
        if !shared.registry.attach_session(&session.key).await {
            return special(id, SpecialReply::MaxSessionConnections);
        }
        let previous = client.inner.session.lock().replace(session.clone());
        if let Some(previous) = previous {
            shared.registry.detach_session(&previous.key).await;
        }
    }
    info!(connection = %client.id(), key = %session.key, "session restored");
    Message::Reply {
        id,
        payload: Payload::binary(info),
    }
}

async fn close_session(shared: &Shared, client: &ClientConnection, id: RequestId) -> Message {
    if !shared.options.sessions_enabled {
        return special(id, SpecialReply::SessionsDisabled);
    }
    let session = client.inner.session.lock().take();
    if let Some(session) = session {
        if let Err(e) = shared.sessions.session_closed(&session.key).await {
            warn!(connection = %client.id(), error = %e, "session close failed");
        }
        shared.registry.detach_session(&session.key).await;
        info!(connection = %client.id(), key = %session.key, "session closed by client");
    }
    Message::Reply {
        id,
        payload: Payload::default(),
    }
}
