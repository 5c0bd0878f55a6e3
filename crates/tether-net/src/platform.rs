//! Socket options for tether links, applied through `socket2`.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

const DEFAULT_BACKLOG: i32 = 128;

/// TCP keepalive timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Idle time before the first keepalive packet.
    pub idle: Duration,
    /// Time between keepalive packets.
    pub interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(10),
        }
    }
}

/// Options applied to dialed and accepted streams and to listeners.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// `TCP_NODELAY`. Frames are small and latency-bound. Default: true.
    pub nodelay: bool,
    /// Keepalive timing, `None` to leave the OS default. Default: 60s idle, 10s interval.
    pub keepalive: Option<KeepaliveConfig>,
    /// `SO_REUSEADDR` on listeners. Default: off on Windows, on elsewhere.
    pub reuse_addr: bool,
    /// Listen backlog. Default: 128.
    pub backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(KeepaliveConfig::default()),
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Apply the stream options to a connected socket.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> io::Result<()> {
    stream.set_nodelay(config.nodelay)?;
    if let Some(keepalive) = config.keepalive {
        let params = TcpKeepalive::new()
            .with_time(keepalive.idle)
            .with_interval(keepalive.interval);
        SockRef::from(stream).set_tcp_keepalive(&params)?;
    }
    Ok(())
}

/// Bind a non-blocking listener on `addr`. Must run inside a tokio runtime.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;
    TcpListener::from_std(socket.into())
}

/// Resolve `host:port` and bind to the first address that accepts.
pub async fn bind(address: &str, config: &SocketConfig) -> io::Result<TcpListener> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host(address).await? {
        match create_listener(addr, config) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{address} resolved to no addresses"),
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair(config: &SocketConfig) -> (TcpStream, TcpStream) {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), config).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_defaults_enable_nodelay_and_keepalive() {
        let config = SocketConfig::default();
        let (client, server) = connected_pair(&config).await;
        configure_stream(&client, &config).unwrap();
        configure_stream(&server, &config).unwrap();

        assert!(client.nodelay().unwrap());
        assert!(SockRef::from(&server).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_options_can_be_turned_off() {
        let config = SocketConfig {
            nodelay: false,
            keepalive: None,
            ..Default::default()
        };
        let (client, _server) = connected_pair(&config).await;
        configure_stream(&client, &config).unwrap();

        assert!(!client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_bind_resolves_hostname() {
        let listener = bind("localhost:0", &SocketConfig::default()).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_unresolvable_fails() {
        assert!(bind("not a host", &SocketConfig::default()).await.is_err());
    }
}
