use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// This is an abstraction for the reliable byte-stream transport underneath a
///  connection's stream channel, introduced to facilitate mocking the I/O part away
///  for testing.
///
/// The connection issues at most one read and at most one write at a time, but read and
///  write may be in flight concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Reads the next chunk of bytes off the stream, at most `max_len` of them. An empty
    ///  chunk means the peer closed the stream in an orderly fashion.
    async fn read_chunk(&self, max_len: usize) -> io::Result<Bytes>;

    /// Writes a chunk of bytes to the stream, completely.
    async fn write_chunk(&self, chunk: &[u8]) -> io::Result<()>;

    /// Shuts the stream down. Errors during shutdown are not reported - the connection
    ///  is going away regardless.
    async fn shutdown(&self);
}

/// [StreamTransport] implementation on a TCP stream.
pub struct TcpStreamTransport {
    read_half: Mutex<OwnedReadHalf>,
    write_half: Mutex<OwnedWriteHalf>,
}

impl TcpStreamTransport {
    pub fn new(stream: TcpStream) -> TcpStreamTransport {
        let (read_half, write_half) = stream.into_split();
        TcpStreamTransport {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
        }
    }
}

#[async_trait]
impl StreamTransport for TcpStreamTransport {
    async fn read_chunk(&self, max_len: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(max_len);
        self.read_half.lock().await
            .read_buf(&mut buf).await?;
        Ok(buf.freeze())
    }

    async fn write_chunk(&self, chunk: &[u8]) -> io::Result<()> {
        self.write_half.lock().await
            .write_all(chunk).await
    }

    async fn shutdown(&self) {
        if let Err(e) = self.write_half.lock().await.shutdown().await {
            debug!("error shutting down TCP stream: {}", e);
        }
    }
}
