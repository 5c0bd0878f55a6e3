//! Length-prefixed framing that turns a byte stream into a message transport.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   frame            |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the prefix itself. Frames larger than the
//! configured maximum are rejected in both directions.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Default maximum frame size: 1 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1_048_576;

/// Boxed read half of a duplex byte stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a duplex byte stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame size exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual frame size.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// The peer closed the stream before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read a single length-prefixed frame from the stream.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let frame_len = u32::from_le_bytes(len_buf);
    if frame_len > max_frame_size {
        return Err(FrameError::PayloadTooLarge {
            size: frame_len as usize,
            max: max_frame_size,
        });
    }

    let mut frame = vec![0u8; frame_len as usize];
    if frame_len > 0 {
        reader.read_exact(&mut frame).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::ConnectionClosed
            } else {
                FrameError::Io(e)
            }
        })?;
    }

    Ok(frame)
}

/// Write a single length-prefixed frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    frame: &[u8],
    max_frame_size: u32,
) -> Result<(), FrameError> {
    let len = u32::try_from(frame.len())
        .ok()
        .filter(|len| *len <= max_frame_size)
        .ok_or(FrameError::PayloadTooLarge {
            size: frame.len(),
            max: max_frame_size,
        })?;

    writer.write_all(&len.to_le_bytes()).await?;
    if !frame.is_empty() {
        writer.write_all(frame).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Read half of a framed connection. Owned by a single read loop.
pub struct FrameReader {
    inner: BoxedReader,
    max_frame_size: u32,
}

impl FrameReader {
    /// Wrap a byte-stream read half.
    pub fn new(inner: BoxedReader, max_frame_size: u32) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }

    /// Read the next frame.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        read_frame(&mut self.inner, self.max_frame_size).await
    }

    /// Change the inbound size limit.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }
}

/// Write half of a framed connection.
///
/// Writers from many tasks share one `FrameWriter`; the internal lock makes
/// sure only one frame is on the wire at a time.
pub struct FrameWriter {
    inner: Mutex<Option<BoxedWriter>>,
    max_frame_size: AtomicU32,
}

impl FrameWriter {
    /// Wrap a byte-stream write half.
    pub fn new(inner: BoxedWriter, max_frame_size: u32) -> Self {
        Self {
            inner: Mutex::new(Some(inner)),
            max_frame_size: AtomicU32::new(max_frame_size),
        }
    }

    /// Largest frame this writer will send.
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.load(Ordering::Relaxed)
    }

    /// Change the outbound size limit, e.g. after the handshake.
    pub fn set_max_frame_size(&self, max_frame_size: u32) {
        self.max_frame_size.store(max_frame_size, Ordering::Relaxed);
    }

    /// Write one frame under the write lock.
    pub async fn write_frame(&self, frame: &[u8]) -> Result<(), FrameError> {
        let max = self.max_frame_size();
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(FrameError::ConnectionClosed)?;
        write_frame(writer, frame, max).await
    }

    /// Shut the write half down. Later writes fail with `ConnectionClosed`.
    pub async fn close(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const MAX: u32 = DEFAULT_MAX_FRAME_SIZE;

    #[tokio::test]
    async fn test_single_frame_roundtrip() {
        let (mut client, mut server) = duplex(8192);
        write_frame(&mut client, b"hello world", MAX).await.unwrap();
        let received = read_frame(&mut server, MAX).await.unwrap();
        assert_eq!(received, b"hello world");
    }

    #[tokio::test]
    async fn test_back_to_back_frames_dont_merge() {
        let (mut client, mut server) = duplex(8192);
        write_frame(&mut client, b"aaa", MAX).await.unwrap();
        write_frame(&mut client, b"bbb", MAX).await.unwrap();

        assert_eq!(read_frame(&mut server, MAX).await.unwrap(), b"aaa");
        assert_eq!(read_frame(&mut server, MAX).await.unwrap(), b"bbb");
    }

    #[tokio::test]
    async fn test_partial_read_resumes_correctly() {
        // A tiny pipe forces the frame across several reads.
        let (mut client, mut server) = duplex(8);
        let frame = b"this frame is larger than the pipe buffer";

        let write_task = tokio::spawn(async move {
            write_frame(&mut client, frame, MAX).await.unwrap();
        });

        let received = read_frame(&mut server, MAX).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, mut server) = duplex(8192);
        client.write_all(&1024u32.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, 16).await;
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 1024, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut client, _server) = duplex(8192);
        let result = write_frame(&mut client, &[0u8; 1024], 16).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_connection_closed_during_length_read() {
        let (client, mut server) = duplex(8192);
        drop(client);
        let result = read_frame(&mut server, MAX).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connection_closed_mid_frame() {
        let (mut client, mut server) = duplex(8192);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        let result = read_frame(&mut server, MAX).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_frame_writer_serializes_concurrent_writers() {
        let (client, server) = duplex(64);
        let writer = std::sync::Arc::new(FrameWriter::new(Box::new(client), MAX));
        let mut reader = FrameReader::new(Box::new(server), MAX);

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                writer.write_frame(&[i; 100]).await.unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let frame = reader.read_frame().await.unwrap();
            assert_eq!(frame.len(), 100);
            assert!(frame.iter().all(|b| *b == frame[0]), "frames interleaved");
            seen.push(frame[0]);
        }
        for task in tasks {
            task.await.unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_frame_writer_close_rejects_writes() {
        let (client, _server) = duplex(64);
        let writer = FrameWriter::new(Box::new(client), MAX);
        writer.close().await;
        assert!(writer.is_closed().await);
        assert!(matches!(
            writer.write_frame(b"x").await,
            Err(FrameError::ConnectionClosed)
        ));
    }
}
