//! Opening tunneled connections.

use std::str::FromStr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::addr;
use crate::config::TunnelConfig;
use crate::conn::{TunnelStream, TunneledConn};
use crate::error::TunnelError;
use crate::session::{ClosedSignal, Session};

type Result<T> = crate::TunnelResult<T>;

/// Network tag of a tunnel destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
    Unixgram,
    Unixpacket,
}

impl Network {
    fn is_tcp(self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }
}

impl FromStr for Network {
    type Err = TunnelError;

    fn from_str(tag: &str) -> Result<Self> {
        match tag {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "unix" => Ok(Network::Unix),
            "unixgram" => Ok(Network::Unixgram),
            "unixpacket" => Ok(Network::Unixpacket),
            other => Err(TunnelError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// Sessions able to open forwarding channels. The seam keeps the dialer and
/// the listener bridge testable against in-memory streams.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open_direct_tcpip(&self, host: &str, port: u32) -> Result<TunnelStream>;
    async fn open_direct_streamlocal(&self, path: &str) -> Result<TunnelStream>;
}

#[async_trait]
impl ChannelOpener for Session {
    async fn open_direct_tcpip(&self, host: &str, port: u32) -> Result<TunnelStream> {
        Session::open_direct_tcpip(self, host, port).await
    }

    async fn open_direct_streamlocal(&self, path: &str) -> Result<TunnelStream> {
        Session::open_direct_streamlocal(self, path).await
    }
}

/// Open a tunneled connection to `addr` on the named network.
///
/// Supported networks are `tcp`, `tcp4` (IPv4-only), `tcp6` (IPv6-only),
/// `unix`, `unixgram` and `unixpacket`. The returned signal fires once with
/// the session's terminal cause.
pub async fn dial(
    network: &str,
    addr: &str,
    config: &TunnelConfig,
) -> Result<(TunneledConn, ClosedSignal)> {
    dial_with(&CancellationToken::new(), network, addr, config).await
}

/// [`dial`] under a caller-supplied cancellation token. Cancelling the token
/// aborts an in-progress dial and later disconnects the session.
pub async fn dial_with(
    cancel: &CancellationToken,
    network: &str,
    addr: &str,
    config: &TunnelConfig,
) -> Result<(TunneledConn, ClosedSignal)> {
    let network = network.parse()?;
    if cancel.is_cancelled() {
        return Err(TunnelError::Cancelled);
    }
    let (session, closed) = Session::connect(cancel, config).await?;
    let conn = open_tunnel(cancel, &session, network, addr).await?;
    Ok((conn, closed))
}

/// [`dial`] over an already-open transport socket; only the SSH handshake is
/// performed on it.
pub async fn dial_on<S>(
    cancel: &CancellationToken,
    transport: S,
    network: &str,
    addr: &str,
    config: &TunnelConfig,
) -> Result<(TunneledConn, ClosedSignal)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let network = network.parse()?;
    if cancel.is_cancelled() {
        return Err(TunnelError::Cancelled);
    }
    let (session, closed) = Session::adopt(cancel, transport, config).await?;
    let conn = open_tunnel(cancel, &session, network, addr).await?;
    Ok((conn, closed))
}

/// Open the forwarding channel for `addr` on a live session and wrap it as a
/// connection that keeps the session reachable.
pub(crate) async fn open_tunnel(
    cancel: &CancellationToken,
    session: &Session,
    network: Network,
    addr: &str,
) -> Result<TunneledConn> {
    if cancel.is_cancelled() {
        return Err(TunnelError::Cancelled);
    }
    let stream = open_channel(session, network, addr).await?;
    Ok(TunneledConn::new(stream, Some(session.clone())))
}

/// Channel-open dispatch shared by the session-backed and mocked paths.
/// Incoming channel-level requests are consumed and discarded by the stream
/// the channel is converted into.
pub(crate) async fn open_channel<O>(opener: &O, network: Network, addr: &str) -> Result<TunnelStream>
where
    O: ChannelOpener + ?Sized,
{
    if network.is_tcp() {
        let (host, port) = addr::split_host_port(addr)?;
        debug!(%host, port, "opening direct-tcpip channel");
        opener.open_direct_tcpip(&host, port).await
    } else {
        debug!(path = addr, "opening direct-streamlocal channel");
        opener.open_direct_streamlocal(addr).await
    }
}

#[cfg(test)]
#[path = "dial_tests.rs"]
mod tests;
