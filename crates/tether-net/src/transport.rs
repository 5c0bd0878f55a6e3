//! Transport boundary: dialing a duplex byte stream and framing it.
//!
//! The connection engine only needs something that can [`Dialer::dial`] a
//! fresh [`Connection`]. [`TcpDialer`] does it over TCP with the socket
//! options from [`SocketConfig`]; the in-process
//! [`MemoryDialer`](crate::memory::MemoryDialer) is used by tests.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::framing::{DEFAULT_MAX_FRAME_SIZE, FrameReader, FrameWriter};
use crate::platform::{SocketConfig, configure_stream};

/// A framed duplex connection, split into its two halves.
pub struct Connection {
    /// Inbound frames. Owned by one read loop.
    pub reader: FrameReader,
    /// Outbound frames. Shared by every writer.
    pub writer: FrameWriter,
    /// Human-readable peer address.
    pub remote_addr: String,
}

impl Connection {
    /// Frame any duplex byte stream.
    pub fn from_stream<S>(stream: S, remote_addr: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(Box::new(reader), DEFAULT_MAX_FRAME_SIZE),
            writer: FrameWriter::new(Box::new(writer), DEFAULT_MAX_FRAME_SIZE),
            remote_addr: remote_addr.into(),
        }
    }

    /// Frame a TCP stream using its owned halves.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let remote_addr = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
        let (reader, writer) = stream.into_split();
        Self {
            reader: FrameReader::new(Box::new(reader), DEFAULT_MAX_FRAME_SIZE),
            writer: FrameWriter::new(Box::new(writer), DEFAULT_MAX_FRAME_SIZE),
            remote_addr,
        }
    }
}

/// Opens new connections to one fixed peer.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Open a fresh connection.
    async fn dial(&self) -> std::io::Result<Connection>;

    /// Address being dialed, for logging.
    fn address(&self) -> String;
}

/// Dials a TCP address (`host:port`).
#[derive(Debug, Clone)]
pub struct TcpDialer {
    address: String,
    socket: SocketConfig,
}

impl TcpDialer {
    /// Dialer with default socket options.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            socket: SocketConfig::default(),
        }
    }

    /// Override the socket options.
    pub fn with_socket_config(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> std::io::Result<Connection> {
        let stream = TcpStream::connect(self.address.as_str()).await?;
        configure_stream(&stream, &self.socket)?;
        Ok(Connection::from_tcp(stream))
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::create_listener;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dialer_connects_and_frames() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &SocketConfig::default()).unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::from_tcp(stream);
            conn.reader.read_frame().await.unwrap()
        });

        let dialer = TcpDialer::new(addr.to_string());
        let conn = dialer.dial().await.unwrap();
        assert_eq!(conn.remote_addr, addr.to_string());
        conn.writer.write_frame(b"ping").await.unwrap();

        assert_eq!(accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_tcp_dialer_reports_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = TcpDialer::new(addr.to_string());
        assert!(dialer.dial().await.is_err());
        assert_eq!(dialer.address(), addr.to_string());
    }

    #[tokio::test]
    async fn test_stream_connection_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let left = Connection::from_stream(a, "left");
        let mut right = Connection::from_stream(b, "right");

        left.writer.write_frame(b"hello").await.unwrap();
        assert_eq!(right.reader.read_frame().await.unwrap(), b"hello");
        assert_eq!(right.remote_addr, "right");
    }
}
