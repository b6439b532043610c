//! Serving an SSH tunnel on a local listener.
//!
//! Accepted local connections are paired with tunneled connections from a
//! shared redial stream, so one SSH session carries successive accepts and
//! is re-established when it drops.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffConfig;
use crate::config::TunnelConfig;
use crate::conn::TunnelStream;
use crate::error::TunnelError;
use crate::redial::{self, ErrStream};

type Result<T> = crate::TunnelResult<T>;

/// Local address to serve a tunnel on.
#[derive(Debug, Clone)]
pub enum ListenAddr {
    /// TCP listener address, `host:port`; port 0 asks for an ephemeral port.
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

/// A bound local listener; accepts produce boxed byte streams.
pub enum LocalListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl LocalListener {
    /// Bind `laddr`. A stale unix socket file at the path is removed first.
    pub async fn bind(laddr: &ListenAddr) -> Result<Self> {
        match laddr {
            ListenAddr::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|source| TunnelError::Bind {
                    address: addr.clone(),
                    source,
                })?;
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path).map_err(|source| TunnelError::Bind {
                    address: path.display().to_string(),
                    source,
                })?;
                Ok(Self::Unix(listener, path.clone()))
            }
            #[cfg(not(unix))]
            ListenAddr::Unix(path) => Err(TunnelError::Bind {
                address: path.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix listeners require a unix platform",
                ),
            }),
        }
    }

    /// The bound TCP address, when listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Self::Unix(..) => None,
        }
    }

    /// Accept one local connection.
    pub async fn accept(&self) -> std::io::Result<TunnelStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "accepted local connection");
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                debug!("accepted local unix connection");
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for LocalListener {
    fn drop(&mut self) {
        if let Self::Unix(_, path) = self
            && let Err(err) = std::fs::remove_file(&path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(?err, socket = %path.display(), "failed to remove unix socket");
        }
    }
}

/// Handle to a serving listener. Closing it (or cancelling the token passed
/// to [`listen`]) stops the accept loop and closes the local socket.
pub struct TunnelListener {
    local_addr: Option<SocketAddr>,
    scope: CancellationToken,
}

impl TunnelListener {
    pub fn new(local_addr: Option<SocketAddr>, scope: CancellationToken) -> Self {
        Self { local_addr, scope }
    }

    /// The bound TCP address, when listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting and tear down all connection handlers.
    pub fn close(&self) {
        self.scope.cancel();
    }
}

/// Serve an SSH tunnel to `addr` on the local address `laddr`.
///
/// Each accepted connection is piped to a tunneled connection obtained from
/// a shared [`redial`](crate::redial::redial) stream. Terminal errors appear
/// on the returned stream; cancellation is published there exactly once.
pub async fn listen(
    cancel: &CancellationToken,
    laddr: ListenAddr,
    network: &str,
    addr: &str,
    config: TunnelConfig,
    backoff: BackoffConfig,
) -> Result<(TunnelListener, ErrStream)> {
    let listener = LocalListener::bind(&laddr).await?;
    let local_addr = listener.local_addr();
    let scope = cancel.child_token();
    let (tunnel_conns, tunnel_errs) = redial::redial(&scope, network, addr, config, backoff);
    let (err_tx, err_rx) = mpsc::channel(1);
    info!(laddr = ?laddr, network, addr, "tunnel listener started");
    tokio::spawn(run_accept_loop(
        scope.clone(),
        listener,
        tunnel_conns,
        tunnel_errs,
        err_tx,
    ));
    Ok((TunnelListener::new(local_addr, scope), err_rx))
}

/// Accept loop: one handler task per accepted connection. Terminates on
/// accept failure or cancellation; it is the only publisher of the
/// cancellation cause.
pub(crate) async fn run_accept_loop<T>(
    scope: CancellationToken,
    listener: LocalListener,
    tunnel_conns: mpsc::Receiver<T>,
    tunnel_errs: ErrStream,
    err_tx: mpsc::Sender<TunnelError>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tunnel_conns = Arc::new(Mutex::new(tunnel_conns));
    let tunnel_errs = Arc::new(Mutex::new(tunnel_errs));
    loop {
        tokio::select! {
            _ = scope.cancelled() => {
                let _ = err_tx.try_send(TunnelError::Cancelled);
                debug!("tunnel listener cancelled");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(local_conn) => {
                    tokio::spawn(handle_conn(
                        scope.clone(),
                        local_conn,
                        tunnel_conns.clone(),
                        tunnel_errs.clone(),
                        err_tx.clone(),
                    ));
                }
                Err(err) => {
                    debug!(?err, "accept failed; stopping tunnel listener");
                    return;
                }
            }
        }
    }
}

/// Pair one accepted connection with the next tunneled connection and pipe
/// the two until either side finishes. The accepted connection is closed
/// exactly once, on drop.
async fn handle_conn<T, L>(
    scope: CancellationToken,
    local_conn: L,
    tunnel_conns: Arc<Mutex<mpsc::Receiver<T>>>,
    tunnel_errs: Arc<Mutex<ErrStream>>,
    err_tx: mpsc::Sender<TunnelError>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tunnel_conn = tokio::select! {
        _ = scope.cancelled() => return,
        err = async { tunnel_errs.lock().await.recv().await } => {
            // The redial loop died; surface its terminal error. Its
            // cancellation cause is owned by the accept loop instead.
            if let Some(err) = err
                && !matches!(err, TunnelError::Cancelled)
            {
                let _ = err_tx.try_send(err);
            }
            return;
        }
        conn = async { tunnel_conns.lock().await.recv().await } => {
            match conn {
                Some(conn) => conn,
                None => return,
            }
        }
    };
    let pipe_scope = scope.child_token();
    if let Err(err) = crate::pipe::pipe(&pipe_scope, tunnel_conn, local_conn).await {
        warn!(%err, "tunnel pipe failed");
        let _ = err_tx.try_send(err);
    }
}

#[cfg(test)]
#[path = "listen_tests.rs"]
mod tests;
