//! Dialing through a spawned external SSH client.

use std::net::{IpAddr, Ipv4Addr};

use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tunnel_core::addr;

use crate::command::TemplateData;
use crate::config::ExecConfig;
use crate::error::{ExecError, ExecResult};

/// Spawn the configured external SSH client for `remote_addr` and connect
/// to the local forwarding port it opens.
///
/// The returned stream carries the client process's terminal status; the
/// process is killed when `cancel` fires. Because the forwarding port only
/// exists once the child has bound it, the local connect runs under the
/// configured back-off.
pub async fn dial(
    cancel: &CancellationToken,
    remote_addr: &str,
    config: &ExecConfig,
) -> ExecResult<(TcpStream, mpsc::Receiver<ExecError>)> {
    let local_ip = config.local_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let (local_port, port) = addr::pick_free_port(local_ip)?;
    let (name, args) = config.command_template.command_line(&TemplateData {
        local_ip: local_ip.to_string(),
        local_port,
        remote_addr: remote_addr.to_string(),
        user: config.user.clone(),
        ssh_host: config.ssh_host.clone(),
        ssh_port: config.ssh_port.clone(),
        extra_args: config.command_extra_args.clone(),
    })?;

    debug!(command = %name, ?args, "starting external ssh client");
    let mut child = Command::new(&name)
        .args(&args)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            name: name.clone(),
            source,
        })?;

    let cmd_scope = cancel.child_token();
    let (err_tx, mut err_rx) = mpsc::channel(1);
    {
        let scope = cmd_scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    // A client that exits while the tunnel is wanted is an
                    // error, successful exit status included.
                    let status = match status {
                        Ok(status) => status.to_string(),
                        Err(err) => err.to_string(),
                    };
                    let _ = err_tx.send(ExecError::ClientExited(status)).await;
                }
                _ = scope.cancelled() => {
                    if let Err(err) = child.kill().await {
                        warn!(?err, "failed to kill external ssh client");
                    }
                    let _ = err_tx.send(ExecError::Cancelled).await;
                }
            }
        });
    }

    let connect = config.backoff.run(cancel, move || async move {
        TcpStream::connect((local_ip, port)).await.map_err(ExecError::Io)
    });
    tokio::select! {
        conn = connect => match conn {
            Ok(stream) => {
                debug!(port, "connected to external ssh client");
                Ok((stream, err_rx))
            }
            Err(err) => {
                cmd_scope.cancel();
                Err(err.into())
            }
        },
        err = err_rx.recv() => {
            cmd_scope.cancel();
            Err(err.unwrap_or(ExecError::Cancelled))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::command::CommandTemplate;
    use tunnel_core::backoff::BackoffConfig;

    fn config(template: &str, max_attempts: u32) -> ExecConfig {
        ExecConfig {
            user: "u".into(),
            ssh_host: "h".into(),
            ssh_port: "22".into(),
            command_template: CommandTemplate::new(template),
            command_extra_args: String::new(),
            backoff: BackoffConfig {
                min: Duration::from_millis(10),
                max: Duration::from_millis(50),
                max_attempts,
            },
            local_ip: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_exit_surfaces_as_an_error() {
        let cancel = CancellationToken::new();
        let result = dial(&cancel, "db:5432", &config("sh -c 'exit 0'", 200)).await;
        match result {
            Err(ExecError::ClientExited(_)) => {}
            other => panic!("expected client-exit error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_binary_fails_to_spawn() {
        let cancel = CancellationToken::new();
        let result = dial(&cancel, "db:5432", &config("definitely-not-an-ssh-client", 1)).await;
        assert!(matches!(result, Err(ExecError::Spawn { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_kills_the_client() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            token.cancel();
        });
        let started = std::time::Instant::now();
        let result = dial(&cancel, "db:5432", &config("sleep 30", 500)).await;
        assert!(matches!(result, Err(ExecError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
