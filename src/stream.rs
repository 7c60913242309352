//! Byte-stream plumbing shared by the tunnel relays.
//!
//! Both ends of a CONNECT tunnel are expressed as a [`BidirectionalByteStream`]
//! that splits into a read side and a write side, each owned by one copy task
//! and each closable on its own (half-close). Three implementors exist:
//!
//! - [`ExclusiveSocketStream`]: an HTTP/1 connection handed over by hyper after
//!   the `200` response; bytes go straight to the client socket.
//! - [`FlushingFrameStream`]: an HTTP/2 stream. The connection is shared with
//!   other requests, so every write is flushed to push the data frame out.
//! - `TcpStream`: the dialed target.

use crate::buffer_pool::BufferPool;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Error type for a single copy direction
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// The peer went away while we were still writing to it
    #[error("write on closed connection: {0}")]
    ConnectionClosed(#[source] io::Error),
}

impl CopyError {
    fn from_write(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero => CopyError::ConnectionClosed(err),
            _ => CopyError::Write(err),
        }
    }
}

/// Read half of a tunnel endpoint
pub trait ReadSide: AsyncRead + Unpin + Send + 'static {
    /// Stop reading from the peer. Releasing the half is enough by default.
    fn close_read(self)
    where
        Self: Sized,
    {
        drop(self)
    }
}

/// Write half of a tunnel endpoint
pub trait WriteSide: AsyncWrite + Unpin + Send + 'static {
    /// Whether data must be flushed after every write to reach the peer
    fn flushes_each_write(&self) -> bool {
        false
    }

    /// Signal end-of-stream to the peer
    fn close_write(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        AsyncWriteExt::shutdown(self)
    }
}

/// A duplex connection that can be split into independently closable halves
pub trait BidirectionalByteStream: Send + 'static {
    type Reader: ReadSide;
    type Writer: WriteSide;

    fn into_sides(self) -> (Self::Reader, Self::Writer);
}

/// HTTP/1 client connection taken over after the CONNECT response
pub struct ExclusiveSocketStream {
    io: TokioIo<Upgraded>,
}

impl ExclusiveSocketStream {
    pub fn new(upgraded: Upgraded) -> Self {
        Self {
            io: TokioIo::new(upgraded),
        }
    }
}

impl BidirectionalByteStream for ExclusiveSocketStream {
    type Reader = ReadHalf<TokioIo<Upgraded>>;
    type Writer = WriteHalf<TokioIo<Upgraded>>;

    fn into_sides(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self.io)
    }
}

impl ReadSide for ReadHalf<TokioIo<Upgraded>> {}
impl WriteSide for WriteHalf<TokioIo<Upgraded>> {}

/// HTTP/2 CONNECT stream; request body in, response body out
pub struct FlushingFrameStream {
    io: TokioIo<Upgraded>,
}

impl FlushingFrameStream {
    pub fn new(upgraded: Upgraded) -> Self {
        Self {
            io: TokioIo::new(upgraded),
        }
    }
}

impl BidirectionalByteStream for FlushingFrameStream {
    type Reader = ReadHalf<TokioIo<Upgraded>>;
    type Writer = FrameWriter;

    fn into_sides(self) -> (Self::Reader, Self::Writer) {
        let (reader, writer) = tokio::io::split(self.io);
        (reader, FrameWriter { inner: writer })
    }
}

/// Response-stream writer of an HTTP/2 tunnel
pub struct FrameWriter {
    inner: WriteHalf<TokioIo<Upgraded>>,
}

impl AsyncWrite for FrameWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl WriteSide for FrameWriter {
    fn flushes_each_write(&self) -> bool {
        true
    }
}

impl BidirectionalByteStream for TcpStream {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn into_sides(self) -> (Self::Reader, Self::Writer) {
        self.into_split()
    }
}

impl ReadSide for OwnedReadHalf {
    fn close_read(self) {
        let socket = socket2::SockRef::from(self.as_ref());
        if let Err(e) = socket.shutdown(std::net::Shutdown::Read) {
            // Already torn down by the peer; nothing left to release
            debug!("target read shutdown: {}", e);
        }
    }
}

impl WriteSide for OwnedWriteHalf {}

/// Copy `reader` into `writer` until EOF using the caller's buffer.
///
/// Returns the number of bytes relayed. An unexpected EOF from the reader
/// counts as a normal end of stream.
pub async fn copy_with_buffer<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin,
    W: WriteSide,
{
    let flush_each_write = writer.flushes_each_write();
    let mut total = 0u64;

    loop {
        let n = match reader.read(buf).await {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(total),
            Err(e) => return Err(CopyError::Read(e)),
        };

        writer
            .write_all(&buf[..n])
            .await
            .map_err(CopyError::from_write)?;
        if flush_each_write {
            writer.flush().await.map_err(CopyError::from_write)?;
        }
        total += n as u64;
    }
}

/// Relay one direction of a tunnel, then half-close both sides it owns.
///
/// The buffer is leased from `pool` and goes back on every exit path.
pub async fn pump<R, W>(mut reader: R, mut writer: W, pool: &Arc<BufferPool>) -> Result<u64, CopyError>
where
    R: ReadSide,
    W: WriteSide,
{
    let mut lease = pool.lease().await;
    let result = copy_with_buffer(&mut reader, &mut writer, lease.as_mut_slice()).await;
    drop(lease);

    if let Err(e) = writer.close_write().await {
        debug!("close write side: {}", e);
    }
    reader.close_read();

    result
}
