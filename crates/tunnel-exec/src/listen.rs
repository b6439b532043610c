//! Serving a tunnel with one external client process per accepted
//! connection.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunnel_core::TunnelStream;
use tunnel_core::listen::{ListenAddr, LocalListener, TunnelListener};
use tunnel_core::pipe;

use crate::config::ExecConfig;
use crate::dial;
use crate::error::{ExecError, ExecResult};

/// Serve an SSH tunnel to `remote_addr` on the local address `laddr`.
///
/// Unlike the session-sharing listener in `tunnel-core`, every accepted
/// connection spawns a fresh external client process, which is killed when
/// the connection or the tunnel is torn down.
pub async fn listen(
    cancel: &CancellationToken,
    laddr: ListenAddr,
    remote_addr: &str,
    config: ExecConfig,
) -> ExecResult<(TunnelListener, mpsc::Receiver<ExecError>)> {
    let listener = LocalListener::bind(&laddr).await.map_err(ExecError::Tunnel)?;
    let local_addr = listener.local_addr();
    let scope = cancel.child_token();
    let (err_tx, err_rx) = mpsc::channel(1);
    let remote_addr = remote_addr.to_string();
    let config = Arc::new(config);
    let accept_scope = scope.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_scope.cancelled() => {
                    let _ = err_tx.try_send(ExecError::Cancelled);
                    debug!("tunnel listener cancelled");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(local_conn) => {
                        tokio::spawn(handle_conn(
                            accept_scope.clone(),
                            local_conn,
                            remote_addr.clone(),
                            config.clone(),
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
    });
    Ok((TunnelListener::new(local_addr, scope), err_rx))
}

/// Dial a fresh tunnel for one accepted connection and pipe the two until
/// either side finishes or the client process dies.
async fn handle_conn(
    scope: CancellationToken,
    local_conn: TunnelStream,
    remote_addr: String,
    config: Arc<ExecConfig>,
    err_tx: mpsc::Sender<ExecError>,
) {
    let conn_scope = scope.child_token();
    let (tunnel_conn, mut client_errs) = match dial::dial(&conn_scope, &remote_addr, &config).await {
        Ok(live) => live,
        Err(err) => {
            warn!(%err, "tunnel dial failed");
            let _ = err_tx.try_send(err);
            return;
        }
    };
    tokio::select! {
        outcome = pipe::pipe(&conn_scope, tunnel_conn, local_conn) => {
            if let Err(err) = outcome {
                warn!(%err, "tunnel pipe failed");
                let _ = err_tx.try_send(ExecError::Tunnel(err));
            }
        }
        err = client_errs.recv() => {
            if let Some(err) = err
                && !matches!(err, ExecError::Cancelled)
            {
                let _ = err_tx.try_send(err);
            }
        }
    }
    // Tear down the client process serving this accept.
    conn_scope.cancel();
}
