//! Transport handles: the per-connection byte streams the registry owns.
//!
//! A control connection is split: the reactor task keeps the
//! [`ControlReader`], and a cloneable [`ControlHandle`] (write half + close
//! signal) lives in the registry so the egress writer can reach the peer.
//! A bulk connection is a [`BulkHandle`], owned by exactly one party at a
//! time: the bulk registry until the router takes it, then one pool task.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

/// Process-unique connection identifier.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh connection id.
pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// What the registry needs from a handle it owns.
pub trait Transport: Send + Sync + 'static {
    fn conn_id(&self) -> ConnId;
    fn peer_addr(&self) -> SocketAddr;
    /// Release the connection. Must be idempotent and must not block.
    fn close(&self);
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("operation timed out")]
    Timeout,
}

// ── Control channel ───────────────────────────────────────────────────────────

/// Write side of a control connection. Clones share the same socket.
#[derive(Clone)]
pub struct ControlHandle {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    conn_id: ConnId,
    peer_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

/// Read side of a control connection, driven by the reactor.
pub struct ControlReader {
    reader: OwnedReadHalf,
    closed: watch::Receiver<bool>,
}

impl ControlHandle {
    pub fn split(stream: TcpStream, conn_id: ConnId) -> io::Result<(ControlHandle, ControlReader)> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (closed_tx, closed_rx) = watch::channel(false);

        let handle = ControlHandle {
            inner: Arc::new(ControlInner {
                conn_id,
                peer_addr,
                writer: Mutex::new(writer),
                closed: closed_tx,
            }),
        };
        let reader = ControlReader {
            reader,
            closed: closed_rx,
        };
        Ok((handle, reader))
    }

    /// Write one complete frame.
    pub async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(frame).await?;
        Ok(())
    }

    /// [`send`](Self::send) bounded by `limit`.
    pub async fn send_timeout(&self, frame: &[u8], limit: Duration) -> Result<(), TransportError> {
        tokio::time::timeout(limit, self.send(frame))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Flush and half-close the write side. Called by the reader task once
    /// the connection is done.
    pub async fn shutdown(&self) {
        self.inner.closed.send_replace(true);
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(conn_id = self.inner.conn_id, error = %e, "control shutdown");
        }
    }
}

impl Transport for ControlHandle {
    fn conn_id(&self) -> ConnId {
        self.inner.conn_id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    fn close(&self) {
        self.inner.closed.send_replace(true);
    }
}

impl std::fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("conn_id", &self.inner.conn_id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ControlReader {
    /// Append whatever is readable to `buf`. Returns `Ok(0)` on EOF and
    /// `Err(Closed)` once the handle has been closed.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            read = self.reader.read_buf(buf) => Ok(read?),
            _ = self.closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        }
    }
}

// ── Bulk channel ──────────────────────────────────────────────────────────────

/// A bulk-channel connection awaiting (or running) a transfer.
pub struct BulkHandle {
    conn_id: ConnId,
    peer_addr: SocketAddr,
    stream: BulkStream,
}

impl BulkHandle {
    /// Wrap an accepted bulk socket. `prefix` holds bytes the reactor read
    /// past the File request; they are replayed before the socket.
    pub fn new(stream: TcpStream, prefix: Bytes, conn_id: ConnId) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            conn_id,
            peer_addr,
            stream: BulkStream { prefix, stream },
        })
    }

    /// Size the kernel buffers for `chunk_size` transfers. Best effort.
    pub fn tune(&self, chunk_size: usize) {
        let sock = SockRef::from(&self.stream.stream);
        if let Err(e) = sock.set_recv_buffer_size(chunk_size) {
            tracing::debug!(conn_id = self.conn_id, error = %e, "set_recv_buffer_size failed");
        }
        if let Err(e) = sock.set_send_buffer_size(chunk_size) {
            tracing::debug!(conn_id = self.conn_id, error = %e, "set_send_buffer_size failed");
        }
    }

    pub fn into_stream(self) -> BulkStream {
        self.stream
    }
}

impl Transport for BulkHandle {
    fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn close(&self) {
        if let Err(e) = SockRef::from(&self.stream.stream).shutdown(std::net::Shutdown::Both) {
            tracing::trace!(conn_id = self.conn_id, error = %e, "bulk shutdown");
        }
    }
}

impl std::fmt::Debug for BulkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkHandle")
            .field("conn_id", &self.conn_id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// A bulk socket with a replay prefix.
pub struct BulkStream {
    prefix: Bytes,
    stream: TcpStream,
}

impl AsyncRead for BulkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for BulkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
