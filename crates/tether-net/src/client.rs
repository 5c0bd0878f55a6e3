//! Client connection engine.
//!
//! Owns at most one live link to the server. A link is established lazily
//! (or through [`Client::connect`]), handshakes, then runs a read loop that
//! routes replies to the [`RequestManager`] and notifications to
//! [`ClientHooks`]. When the link is down and autoconnect is on, callers
//! meet at the [`ReconnectGate`] so only one dial is in flight.
//!
//! State changes are published on a [`watch`] channel so any number of
//! consumers can react without polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::CallContext;
use crate::error::ClientError;
use crate::framing::{FrameError, FrameReader, FrameWriter};
use crate::gate::ReconnectGate;
use crate::heartbeat::Heartbeat;
use crate::message::{
    Message, MessageError, Name, PROTOCOL_MAJOR, Payload, RequestId, ServerConfiguration,
    requires_reply,
};
use crate::requests::RequestManager;
use crate::session::Session;
use crate::transport::{Connection, Dialer};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link. A call may trigger autoconnect.
    Disconnected,
    /// Dialing and handshaking.
    Connecting,
    /// Link established.
    Connected,
    /// Closed by the user. Nothing reconnects until [`Client::connect`].
    Disabled,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Callbacks for server-initiated events.
///
/// Called from the read loop, in arrival order. A hook must not wait on a
/// reply from the same client, since the read loop is busy running it.
/// Session operations started by the client itself do not fire hooks.
#[async_trait]
pub trait ClientHooks: Send + Sync + 'static {
    /// The server created a session for this connection.
    async fn on_session_created(&self, _session: &Session) {}

    /// The server closed the session of this connection.
    async fn on_session_closed(&self) {}

    /// The link was lost.
    async fn on_disconnected(&self) {}

    /// The server sent a signal.
    async fn on_signal(&self, _name: Option<&str>, _payload: Payload) {}
}

/// Hooks that ignore every event.
pub struct NoHooks;

impl ClientHooks for NoHooks {}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Reconnect on demand when a call finds the link down. Default: true.
    pub autoconnect: bool,
    /// Reply timeout for calls without their own deadline. Default: 60s.
    pub request_timeout: Duration,
    /// Bound on dialing plus handshake. Default: 5s.
    pub dial_timeout: Duration,
    /// Pause between failed reconnect attempts. Default: 2s.
    pub reconnection_interval: Duration,
    /// Heartbeat interval, clamped to half the server's read timeout and
    /// raised to at least [`heartbeat::MIN_INTERVAL`](crate::heartbeat::MIN_INTERVAL).
    /// Zero disables heartbeats. Default: 30s.
    pub heartbeat_interval: Duration,
    /// Largest inbound frame accepted, in bytes. Default: 1 MiB.
    pub buffer_size: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            autoconnect: true,
            request_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
            reconnection_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            buffer_size: crate::framing::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// One established connection.
struct Link {
    id: u64,
    writer: Arc<FrameWriter>,
    config: ServerConfiguration,
    remote_addr: String,
    closed: CancellationToken,
}

struct ClientInner {
    dialer: Box<dyn Dialer>,
    options: ClientOptions,
    hooks: Arc<dyn ClientHooks>,
    state: ConnectionStateWatch,
    // Shared by request/signal, exclusive for session operations.
    api_lock: RwLock<()>,
    connect_lock: Mutex<()>,
    link: parking_lot::Mutex<Option<Arc<Link>>>,
    next_link_id: AtomicU64,
    // Bumped by every `close()`; a connect attempt that saw an older value
    // must not publish its link.
    closes: AtomicU64,
    session: parking_lot::Mutex<Option<Session>>,
    requests: RequestManager,
    heartbeat: Heartbeat,
    gate: ReconnectGate,
}

/// Handle to the connection engine. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client without dialing. The first call (or
    /// [`connect`](Self::connect)) establishes the link.
    pub fn new(dialer: impl Dialer, options: ClientOptions) -> Self {
        Self::with_hooks(dialer, options, Arc::new(NoHooks))
    }

    /// Create a client with event hooks.
    pub fn with_hooks(
        dialer: impl Dialer,
        options: ClientOptions,
        hooks: Arc<dyn ClientHooks>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                dialer: Box::new(dialer),
                options,
                hooks,
                state: ConnectionStateWatch::new(),
                api_lock: RwLock::new(()),
                connect_lock: Mutex::new(()),
                link: parking_lot::Mutex::new(None),
                next_link_id: AtomicU64::new(1),
                closes: AtomicU64::new(0),
                session: parking_lot::Mutex::new(None),
                requests: RequestManager::new(),
                heartbeat: Heartbeat::new(),
                gate: ReconnectGate::new(),
            }),
        }
    }

    /// Establish the link now. No-op when already connected; re-enables a
    /// closed client.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.connect_once(true).await
    }

    /// Send a request and wait for its reply.
    pub async fn request(
        &self,
        ctx: &CallContext,
        name: Option<&str>,
        payload: Payload,
    ) -> Result<Payload, ClientError> {
        let name = Name::optional(name)?;
        if name.is_none() && payload.is_empty() {
            return Err(MessageError::EmptyRequest.into());
        }

        let _guard = self.inner.api_lock.read().await;
        let link = self.inner.ensure_connected(ctx).await?;
        let message = Message::Request {
            id: RequestId::ZERO,
            name,
            payload,
        };
        self.inner.call(&link, message, ctx).await
    }

    /// Send a fire-and-forget signal.
    pub async fn signal(
        &self,
        ctx: &CallContext,
        name: Option<&str>,
        payload: Payload,
    ) -> Result<(), ClientError> {
        let message = Message::signal(name, payload)?;

        let _guard = self.inner.api_lock.read().await;
        let link = self.inner.ensure_connected(ctx).await?;
        self.inner.call(&link, message, ctx).await?;
        Ok(())
    }

    /// Attach an existing server session by key.
    ///
    /// Fails with [`ClientError::SessionAlreadyActive`] while a session is
    /// held locally.
    pub async fn restore_session(
        &self,
        ctx: &CallContext,
        key: &str,
    ) -> Result<Session, ClientError> {
        if key.is_empty() {
            return Err(MessageError::EmptySessionKey.into());
        }

        let _guard = self.inner.api_lock.write().await;
        if self.inner.session.lock().is_some() {
            return Err(ClientError::SessionAlreadyActive);
        }
        let link = self.inner.ensure_connected(ctx).await?;
        self.inner.restore_on(&link, key, ctx).await
    }

    /// Close the held session. Without a link the session is dropped
    /// locally without telling the server.
    pub async fn close_session(&self, ctx: &CallContext) -> Result<(), ClientError> {
        let _guard = self.inner.api_lock.write().await;
        if self.inner.session.lock().is_none() {
            return Ok(());
        }

        let Some(link) = self.inner.current_link() else {
            self.inner.session.lock().take();
            info!("session closed offline");
            return Ok(());
        };

        let message = Message::CloseSession { id: RequestId::ZERO };
        self.inner.call(&link, message, ctx).await?;
        self.inner.session.lock().take();
        info!("session closed");
        Ok(())
    }

    /// Disable the client: drop the link, fail pending requests and stop
    /// reconnecting until [`connect`](Self::connect) is called.
    pub async fn close(&self) {
        let link = {
            let mut current = self.inner.link.lock();
            self.inner.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.state.set(ConnectionState::Disabled);
            self.inner.heartbeat.stop();
            self.inner.requests.fail_all(&ClientError::Disconnected);
            current.take()
        };
        if let Some(link) = link {
            link.closed.cancel();
            link.writer.close().await;
            info!(remote = %link.remote_addr, "client closed");
        }
    }

    pub fn status(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current_link().is_some()
    }

    /// The held session, if any.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.lock().clone()
    }

    /// Key of the held session, if any.
    pub fn session_key(&self) -> Option<String> {
        self.inner.session.lock().as_ref().map(|s| s.key.clone())
    }

    /// Handshake parameters of the live link.
    pub fn server_configuration(&self) -> Option<ServerConfiguration> {
        self.inner.current_link().map(|link| link.config.clone())
    }

    pub fn remote_addr(&self) -> Option<String> {
        self.inner.current_link().map(|link| link.remote_addr.clone())
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.requests.pending_requests()
    }
}

impl ClientInner {
    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.lock().clone()
    }

    /// Return the live link, autoconnecting through the gate if allowed.
    async fn ensure_connected(
        self: &Arc<Self>,
        ctx: &CallContext,
    ) -> Result<Arc<Link>, ClientError> {
        if let Some(link) = self.current_link() {
            return Ok(link);
        }
        if !self.options.autoconnect || self.state.current() == ConnectionState::Disabled {
            return Err(ClientError::Disconnected);
        }

        let ticket = self.gate.join();
        if ticket.is_leader() {
            tokio::spawn(Arc::clone(self).reconnect());
        }

        let (wait, expired) = match ctx.get_deadline() {
            Some(deadline) => (
                deadline.saturating_duration_since(Instant::now()),
                ClientError::DeadlineExceeded,
            ),
            None => (self.options.request_timeout, ClientError::Timeout),
        };
        tokio::select! {
            outcome = ticket.wait(Some(wait)) => match outcome {
                Err(ClientError::Timeout) => return Err(expired),
                other => other?,
            },
            () = ctx.canceled() => return Err(ClientError::Canceled),
        }

        self.current_link().ok_or(ClientError::Disconnected)
    }

    /// Background reconnect for one gate generation. Retries while anyone
    /// is still waiting on the gate.
    async fn reconnect(self: Arc<Self>) {
        loop {
            let error = match self.connect_once(false).await {
                Ok(()) => {
                    self.gate.flush(Ok(()));
                    return;
                }
                Err(e) => e,
            };

            let permanent = matches!(error, ClientError::IncompatibleProtocol { .. })
                || self.state.current() == ConnectionState::Disabled;
            if permanent || !self.gate.has_waiters() {
                self.gate.flush(Err(error));
                return;
            }

            warn!(
                address = %self.dialer.address(),
                error = %error,
                retry_in = ?self.options.reconnection_interval,
                "reconnect attempt failed"
            );
            tokio::time::sleep(self.options.reconnection_interval).await;
            if !self.gate.has_waiters() {
                self.gate.flush(Err(error));
                return;
            }
        }
    }

    /// Dial and handshake once, serialized with other connect attempts.
    async fn connect_once(self: &Arc<Self>, explicit: bool) -> Result<(), ClientError> {
        let _guard = self.connect_lock.lock().await;
        if self.current_link().is_some() {
            return Ok(());
        }
        if !explicit && self.state.current() == ConnectionState::Disabled {
            return Err(ClientError::Disconnected);
        }

        let closes = self.closes.load(Ordering::SeqCst);
        self.state.set(ConnectionState::Connecting);
        let handshake = tokio::time::timeout(self.options.dial_timeout, self.dial_and_handshake());
        let (connection, config) = match handshake.await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => return Err(self.connect_failed(e)),
            Err(_) => return Err(self.connect_failed(ClientError::Timeout)),
        };

        let Some(link) = self.install(connection, config, closes) else {
            info!(address = %self.dialer.address(), "client closed while connecting");
            return Err(ClientError::Disconnected);
        };
        info!(
            remote = %link.remote_addr,
            major = link.config.major_version,
            minor = link.config.minor_version,
            "connected"
        );

        self.restore_held_session(&link).await;
        Ok(())
    }

    fn connect_failed(&self, error: ClientError) -> ClientError {
        if self.state.current() == ConnectionState::Connecting {
            self.state.set(ConnectionState::Disconnected);
        }
        debug!(address = %self.dialer.address(), error = %error, "connect failed");
        error
    }

    async fn dial_and_handshake(&self) -> Result<(Connection, ServerConfiguration), ClientError> {
        let mut connection = self.dialer.dial().await?;
        connection.reader.set_max_frame_size(self.options.buffer_size);

        let frame = connection.reader.read_frame().await?;
        match Message::decode(&frame)? {
            Some(Message::Configuration(config)) => {
                if config.major_version != PROTOCOL_MAJOR {
                    return Err(ClientError::IncompatibleProtocol {
                        major: config.major_version,
                    });
                }
                Ok((connection, config))
            }
            Some(other) => Err(ClientError::Handshake(format!(
                "expected configuration, got message type {}",
                other.message_type()
            ))),
            None => Err(ClientError::Handshake(format!(
                "expected configuration, got unknown message type {}",
                frame.first().copied().unwrap_or_default()
            ))),
        }
    }

    /// Publish a fresh link and start its read loop and heartbeat. Returns
    /// `None`, dropping the connection, if the client was closed after
    /// `closes` was sampled.
    fn install(
        self: &Arc<Self>,
        connection: Connection,
        config: ServerConfiguration,
        closes: u64,
    ) -> Option<Arc<Link>> {
        let Connection {
            reader,
            writer,
            remote_addr,
        } = connection;
        writer.set_max_frame_size(config.buffer_size);

        let interval = if config.read_timeout.is_zero() {
            self.options.heartbeat_interval
        } else {
            self.options.heartbeat_interval.min(config.read_timeout / 2)
        };

        let link = Arc::new(Link {
            id: self.next_link_id.fetch_add(1, Ordering::Relaxed),
            writer: Arc::new(writer),
            config,
            remote_addr,
            closed: CancellationToken::new(),
        });

        {
            let mut current = self.link.lock();
            if self.closes.load(Ordering::SeqCst) != closes {
                self.state.set(ConnectionState::Disabled);
                return None;
            }
            *current = Some(Arc::clone(&link));
            self.heartbeat.start(interval, Arc::clone(&link.writer));
            self.state.set(ConnectionState::Connected);
        }
        tokio::spawn(read_loop(Arc::downgrade(self), reader, Arc::clone(&link)));
        Some(link)
    }

    /// Best-effort restore of the session held before the link dropped.
    async fn restore_held_session(&self, link: &Arc<Link>) {
        let held = self.session.lock().as_ref().map(|s| s.key.clone());
        let Some(key) = held else {
            return;
        };
        match self.restore_on(link, &key, &CallContext::new()).await {
            Ok(session) => info!(key = %session.key, "session restored"),
            Err(ClientError::Disconnected) => {
                debug!("link lost during session restore, keeping local session");
            }
            Err(e) => {
                warn!(error = %e, "session restore failed, dropping local session");
                self.session.lock().take();
            }
        }
    }

    async fn restore_on(
        &self,
        link: &Link,
        key: &str,
        ctx: &CallContext,
    ) -> Result<Session, ClientError> {
        let message = Message::restore_session(RequestId::ZERO, key)?;
        let reply = self.call(link, message, ctx).await?;

        let session = Session::from_bytes(reply.data())
            .map_err(|e| ClientError::Protocol(format!("invalid session info: {e}")))?;
        *self.session.lock() = Some(session.clone());
        Ok(session)
    }

    /// Send `message` on `link`. If its type expects a reply, it is first
    /// registered under a fresh identifier and the reply is awaited;
    /// otherwise an empty payload is returned once the frame is written.
    async fn call(
        &self,
        link: &Link,
        mut message: Message,
        ctx: &CallContext,
    ) -> Result<Payload, ClientError> {
        if ctx.is_canceled() {
            return Err(ClientError::Canceled);
        }
        if !requires_reply(message.message_type()) {
            self.send(link, &message).await?;
            return Ok(Payload::default());
        }

        let request = self.requests.create(self.options.request_timeout);
        message.set_id(request.id());
        self.send(link, &message).await?;
        request.await_reply(ctx).await
    }

    /// Encode and write one message on `link`.
    async fn send(&self, link: &Link, message: &Message) -> Result<(), ClientError> {
        let frame = message.encode()?;
        let max = link.writer.max_frame_size();
        if frame.len() > max as usize {
            return Err(ClientError::BufferOverflow {
                size: frame.len(),
                max,
            });
        }
        link.writer.write_frame(&frame).await?;
        self.heartbeat.reset();
        Ok(())
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::Reply { id, payload } => {
                self.requests.fulfill(id, payload);
            }
            Message::ErrorReply { id, code, message } => {
                self.requests.fail(
                    id,
                    ClientError::Application {
                        code: code.as_str().to_string(),
                        message,
                    },
                );
            }
            Message::SpecialReply { id, kind } => {
                self.requests.fail(id, ClientError::from_special_reply(kind));
            }
            Message::Signal { name, payload } => {
                self.hooks
                    .on_signal(name.as_ref().map(Name::as_str), payload)
                    .await;
            }
            Message::SessionCreated { info } => match Session::from_bytes(&info) {
                Ok(session) => {
                    info!(key = %session.key, "session created");
                    *self.session.lock() = Some(session.clone());
                    self.hooks.on_session_created(&session).await;
                }
                Err(e) => warn!(error = %e, "ignoring invalid session info"),
            },
            Message::SessionClosed => {
                info!("session closed by server");
                self.session.lock().take();
                self.hooks.on_session_closed().await;
            }
            Message::Heartbeat => debug!("heartbeat received"),
            other => warn!(
                message_type = other.message_type(),
                "ignoring unexpected message from server"
            ),
        }
    }

    /// Tear down after the read loop ended. No-op if `link` was already
    /// replaced or closed.
    async fn link_lost(&self, link: &Link) {
        {
            let mut current = self.link.lock();
            if !current.as_ref().is_some_and(|l| l.id == link.id) {
                return;
            }
            *current = None;
            self.heartbeat.stop();
            self.requests.fail_all(&ClientError::Disconnected);
            if self.state.current() != ConnectionState::Disabled {
                self.state.set(ConnectionState::Disconnected);
            }
        }
        link.writer.close().await;
        info!(remote = %link.remote_addr, "disconnected");
        self.hooks.on_disconnected().await;
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.closed.cancel();
        }
    }
}

async fn read_loop(client: Weak<ClientInner>, mut reader: FrameReader, link: Arc<Link>) {
    loop {
        let frame = tokio::select! {
            () = link.closed.cancelled() => break,
            frame = reader.read_frame() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => break,
            Err(e) => {
                warn!(error = %e, "read failed");
                break;
            }
        };

        let Some(inner) = client.upgrade() else {
            break;
        };
        match Message::decode(&frame) {
            Ok(Some(message)) => inner.dispatch(message).await,
            Ok(None) => warn!(
                message_type = frame.first().copied().unwrap_or_default(),
                "ignoring unknown message type"
            ),
            Err(e) => {
                warn!(error = %e, "malformed frame from server, closing link");
                break;
            }
        }
    }

    match client.upgrade() {
        Some(inner) => inner.link_lost(&link).await,
        None => link.writer.close().await,
    }
}
