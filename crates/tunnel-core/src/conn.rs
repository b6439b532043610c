//! Presents an SSH channel as an ordinary byte-stream connection.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::TunnelError;
use crate::session::Session;

type Result<T> = crate::TunnelResult<T>;

/// Streams that can back a tunneled connection.
pub trait TunnelStreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed byte stream carried by a [`TunneledConn`].
pub type TunnelStream = Box<dyn TunnelStreamIo>;

/// A tunneled byte-stream connection.
///
/// Dropping the connection closes its channel but not the SSH session that
/// carries it. The session stays reachable through the handle so the
/// transport outlives the last channel opened on it.
pub struct TunneledConn {
    stream: TunnelStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    _session: Option<Session>,
}

impl TunneledConn {
    pub(crate) fn new(stream: TunnelStream, session: Option<Session>) -> Self {
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        Self {
            stream,
            local_addr: unspecified,
            peer_addr: unspecified,
            _session: session,
        }
    }

    /// Synthetic local address; SSH channels carry no socket addresses.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Synthetic peer address; SSH channels carry no socket addresses.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Always fails: SSH channels have no per-endpoint timers. Callers that
    /// need timeouts must wrap operations in an outer timer.
    pub fn set_deadline(&self, deadline: std::time::Instant) -> Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    /// Always fails; see [`TunneledConn::set_deadline`].
    pub fn set_read_deadline(&self, _deadline: std::time::Instant) -> Result<()> {
        Err(TunnelError::DeadlineUnsupported)
    }

    /// Always fails; see [`TunneledConn::set_deadline`].
    pub fn set_write_deadline(&self, _deadline: std::time::Instant) -> Result<()> {
        Err(TunnelError::DeadlineUnsupported)
    }
}

impl AsyncRead for TunneledConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunneledConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
