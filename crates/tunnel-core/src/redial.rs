//! Automatic re-establishment of dropped tunnel connections.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::BackoffConfig;
use crate::config::TunnelConfig;
use crate::conn::TunneledConn;
use crate::dial::{self, Network};
use crate::error::TunnelError;
use crate::session::{ClosedSignal, Session};

/// Stream of live tunneled connections produced by [`redial`].
pub type ConnStream = mpsc::Receiver<TunneledConn>;

/// Terminal-error stream produced by [`redial`] and [`listen`](crate::listen).
pub type ErrStream = mpsc::Receiver<TunnelError>;

/// Open a tunneled connection to `addr` on the named network, re-dialling
/// failed connections under `backoff` and re-establishing dropped
/// connections immediately.
///
/// At most one connection is live at a time: the next one is dialled only
/// after the previous session closed. A connection the consumer has not
/// taken by the time its session closes is discarded. Back-off exhaustion
/// and cancellation are published on the error stream, after which both
/// streams close.
pub fn redial(
    cancel: &CancellationToken,
    network: &str,
    addr: &str,
    config: TunnelConfig,
    backoff: BackoffConfig,
) -> (ConnStream, ErrStream) {
    let (conn_tx, conn_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = mpsc::channel(1);
    let cancel = cancel.clone();
    let network_tag = network.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        let network: Network = match network_tag.parse() {
            Ok(network) => network,
            Err(err) => {
                let _ = err_tx.send(err).await;
                return;
            }
        };
        if let Err(err) = backoff.validate() {
            let _ = err_tx.send(err).await;
            return;
        }
        let config = Arc::new(config);
        let dial_once = {
            let cancel = cancel.clone();
            move || {
                let cancel = cancel.clone();
                let config = config.clone();
                let addr = addr.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Err(TunnelError::Cancelled);
                    }
                    let (session, closed) = Session::connect(&cancel, &config).await?;
                    let conn = dial::open_tunnel(&cancel, &session, network, &addr).await?;
                    Ok((conn, closed))
                }
            }
        };
        run_redial(cancel, dial_once, backoff, conn_tx, err_tx).await;
    });
    (conn_rx, err_rx)
}

/// Core loop, generic over the dialler so tests can substitute one.
pub(crate) async fn run_redial<T, D, Fut>(
    cancel: CancellationToken,
    mut dial: D,
    backoff: BackoffConfig,
    conn_tx: mpsc::Sender<T>,
    err_tx: mpsc::Sender<TunnelError>,
) where
    D: FnMut() -> Fut,
    Fut: Future<Output = Result<(T, ClosedSignal), TunnelError>>,
    T: Send,
{
    loop {
        let (conn, mut closed) = match backoff.run(&cancel, &mut dial).await {
            Ok(live) => live,
            Err(err) => {
                let _ = err_tx.send(err.into()).await;
                return;
            }
        };
        debug!("tunnel connection established");
        tokio::select! {
            sent = conn_tx.send(conn) => {
                if sent.is_err() {
                    return; // consumer went away
                }
                tokio::select! {
                    _ = &mut closed => {
                        debug!("tunnel session closed; redialling");
                    }
                    _ = cancel.cancelled() => {
                        let _ = err_tx.send(TunnelError::Cancelled).await;
                        return;
                    }
                }
            }
            _ = &mut closed => {
                warn!("tunnel session closed before the connection was taken; discarding");
            }
            _ = cancel.cancelled() => {
                let _ = err_tx.send(TunnelError::Cancelled).await;
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "redial_tests.rs"]
mod tests;
