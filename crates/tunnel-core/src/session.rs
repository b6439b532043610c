//! SSH session lifetime management.
//!
//! A [`Session`] owns an authenticated russh transport. Construction hands
//! back a [`ClosedSignal`] alongside it: a single-shot channel that fires
//! exactly once with the transport's terminal cause. A monitor task watches
//! the caller's cancellation token and disconnects the transport when it
//! fires; whichever of {transport death, cancellation} happens first decides
//! the published cause.

use std::future::Future;
use std::sync::Arc;

use russh::client::{self, AuthResult, DisconnectReason, Handle};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::Disconnect;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::addr;
use crate::config::{AgentAuth, AuthConfig, TunnelConfig};
use crate::conn::TunnelStream;
use crate::error::TunnelError;

type Result<T> = crate::TunnelResult<T>;

/// Fires exactly once with the session's terminal cause.
pub type ClosedSignal = oneshot::Receiver<TunnelError>;

/// russh event handler: accepts the presented host key and reports
/// transport termination.
///
/// Host-key policy is part of the opaque transport configuration and is not
/// enforced here; callers needing verification wrap the transport
/// themselves.
pub struct ClientHandler {
    closed_tx: Option<oneshot::Sender<TunnelError>>,
}

impl ClientHandler {
    fn new(closed_tx: oneshot::Sender<TunnelError>) -> Self {
        Self {
            closed_tx: Some(closed_tx),
        }
    }

    fn publish(&mut self, cause: TunnelError) {
        if let Some(tx) = self.closed_tx.take() {
            let _ = tx.send(cause);
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = std::result::Result<bool, Self::Error>> + Send {
        debug!(
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "accepting server host key"
        );
        async { Ok(true) }
    }

    fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send {
        let cause = match &reason {
            DisconnectReason::Error(err) => TunnelError::TransportClosed(err.to_string()),
            _ => TunnelError::TransportClosed("disconnected by server".into()),
        };
        self.publish(cause);
        async move {
            match reason {
                DisconnectReason::Error(err) => Err(err),
                _ => Ok(()),
            }
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        // The handler dies with the transport task; teardown paths that skip
        // the disconnect callback still fire the signal exactly once.
        self.publish(TunnelError::TransportClosed("ssh transport terminated".into()));
    }
}

/// An authenticated SSH transport. Cheap to clone; channels may be opened
/// concurrently and the underlying library serializes wire framing.
#[derive(Clone)]
pub struct Session {
    handle: Arc<Handle<ClientHandler>>,
}

impl Session {
    /// Open a TCP connection to the configured SSH server, perform the
    /// handshake, and authenticate.
    pub async fn connect(
        cancel: &CancellationToken,
        config: &TunnelConfig,
    ) -> Result<(Self, ClosedSignal)> {
        let ssh_addr = addr::with_default_port(&config.ssh_addr, 22);
        let (host, port) = addr::split_host_port(&ssh_addr)?;
        let port = u16::try_from(port)
            .map_err(|_| TunnelError::invalid_address(&ssh_addr, "port out of range"))?;
        let client_config = client_config(config);
        let (closed_tx, closed_rx) = oneshot::channel();
        let handler = ClientHandler::new(closed_tx);
        let handle = client::connect(client_config, (host.as_str(), port), handler)
            .await
            .map_err(|source| TunnelError::TransportDial {
                addr: ssh_addr.clone(),
                source,
            })?;
        info!(addr = %ssh_addr, "ssh transport established");
        Self::finish(cancel, handle, closed_rx, &config.auth).await
    }

    /// Perform the SSH handshake and authentication over an already-open
    /// byte stream, adopting it as the transport.
    pub async fn adopt<S>(
        cancel: &CancellationToken,
        transport: S,
        config: &TunnelConfig,
    ) -> Result<(Self, ClosedSignal)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ssh_addr = addr::with_default_port(&config.ssh_addr, 22);
        let client_config = client_config(config);
        let (closed_tx, closed_rx) = oneshot::channel();
        let handler = ClientHandler::new(closed_tx);
        let handle = client::connect_stream(client_config, transport, handler)
            .await
            .map_err(|source| TunnelError::TransportDial {
                addr: ssh_addr.clone(),
                source,
            })?;
        info!(addr = %ssh_addr, "ssh transport adopted");
        Self::finish(cancel, handle, closed_rx, &config.auth).await
    }

    async fn finish(
        cancel: &CancellationToken,
        mut handle: Handle<ClientHandler>,
        internal: oneshot::Receiver<TunnelError>,
        auth: &AuthConfig,
    ) -> Result<(Self, ClosedSignal)> {
        authenticate(&mut handle, auth).await?;
        let session = Session {
            handle: Arc::new(handle),
        };
        let closed = session.watch(cancel.clone(), internal);
        Ok((session, closed))
    }

    /// Spawn the monitor that publishes the session's terminal cause. The
    /// monitor is the sole writer of the returned signal and terminates once
    /// either the transport dies or the token fires.
    fn watch(
        &self,
        cancel: CancellationToken,
        mut internal: oneshot::Receiver<TunnelError>,
    ) -> ClosedSignal {
        let (tx, rx) = oneshot::channel();
        let session = self.clone();
        tokio::spawn(async move {
            let cause = tokio::select! {
                cause = &mut internal => cause
                    .unwrap_or_else(|_| TunnelError::TransportClosed("ssh transport terminated".into())),
                _ = cancel.cancelled() => {
                    session.close().await;
                    TunnelError::Cancelled
                }
            };
            debug!(%cause, "ssh session closed");
            let _ = tx.send(cause);
        });
        rx
    }

    /// Open a `direct-tcpip` forwarding channel to `host:port`, reachable
    /// from the server. The origin fields are sent empty/zero.
    pub async fn open_direct_tcpip(&self, host: &str, port: u32) -> Result<TunnelStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port, "", 0)
            .await
            .map_err(|source| TunnelError::ChannelOpen {
                channel_type: "direct-tcpip",
                target: format!("{host}:{port}"),
                source,
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    /// Open a `direct-streamlocal@openssh.com` forwarding channel to a unix
    /// domain socket path on the server.
    pub async fn open_direct_streamlocal(&self, path: &str) -> Result<TunnelStream> {
        let channel = self
            .handle
            .channel_open_direct_streamlocal(path)
            .await
            .map_err(|source| TunnelError::ChannelOpen {
                channel_type: "direct-streamlocal@openssh.com",
                target: path.to_string(),
                source,
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    /// Disconnect the transport; the closed signal fires with the cause.
    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "")
            .await;
    }
}

fn client_config(config: &TunnelConfig) -> Arc<client::Config> {
    config
        .client
        .clone()
        .unwrap_or_else(|| Arc::new(client::Config::default()))
}

enum AuthMethod {
    Password(SecretString),
    Agent(AgentAuth),
    PublicKeys(Vec<Arc<PrivateKey>>),
}

impl AuthMethod {
    fn label(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::Agent(_) => "agent",
            AuthMethod::PublicKeys(_) => "publickey",
        }
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
        rsa_hint: Option<HashAlg>,
    ) -> Result<AuthResult> {
        match self {
            AuthMethod::Password(password) => handle
                .authenticate_password(username.to_string(), password.expose_secret().to_string())
                .await
                .map_err(Into::into),
            AuthMethod::Agent(agent) => authenticate_via_agent(handle, username, agent, rsa_hint).await,
            AuthMethod::PublicKeys(keys) => {
                authenticate_public_keys(handle, username, keys, rsa_hint).await
            }
        }
    }
}

/// Try the configured methods in order: password, agent signers, then key
/// sources. The first accepted method wins.
async fn authenticate(handle: &mut Handle<ClientHandler>, auth: &AuthConfig) -> Result<()> {
    let mut methods = Vec::new();
    if let Some(password) = &auth.password {
        methods.push(AuthMethod::Password(password.clone()));
    }
    if let Some(agent) = &auth.agent {
        methods.push(AuthMethod::Agent(agent.clone()));
    }
    if !auth.keys.is_empty() {
        let mut keys = Vec::with_capacity(auth.keys.len());
        for source in &auth.keys {
            keys.push(source.load().await?);
        }
        methods.push(AuthMethod::PublicKeys(keys));
    }
    if methods.is_empty() {
        return Err(TunnelError::InvalidConfig(
            "no authentication methods configured; supply a password, a key, or an ssh-agent".into(),
        ));
    }

    let rsa_hint = handle.best_supported_rsa_hash().await.unwrap_or(None).flatten();

    for method in methods {
        let label = method.label();
        match method.authenticate(handle, &auth.username, rsa_hint).await {
            Ok(AuthResult::Success) => {
                info!(method = label, "authentication succeeded");
                return Ok(());
            }
            Ok(AuthResult::Failure { .. }) => {
                warn!(method = label, "authentication rejected by server");
            }
            Err(err) => {
                warn!(method = label, error = ?err, "authentication attempt failed");
            }
        }
    }

    Err(TunnelError::AuthFailed(
        "all configured authentication methods were rejected".into(),
    ))
}

async fn authenticate_public_keys(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    keys: &[Arc<PrivateKey>],
    rsa_hint: Option<HashAlg>,
) -> Result<AuthResult> {
    let mut last_failure = None;
    for key in keys {
        debug!(algorithm = ?key.algorithm(), "attempting public-key auth");
        let hash_alg = if key.algorithm().is_rsa() { rsa_hint } else { None };
        let key = PrivateKeyWithHashAlg::new(key.clone(), hash_alg);
        match handle.authenticate_publickey(username.to_string(), key).await {
            Ok(result) if result.success() => return Ok(result),
            Ok(other) => last_failure = Some(other),
            Err(err) => {
                warn!(error = ?err, "public-key authentication attempt failed");
            }
        }
    }
    Ok(last_failure.unwrap_or(AuthResult::Failure {
        remaining_methods: russh::MethodSet::empty(),
        partial_success: false,
    }))
}

#[cfg(unix)]
async fn authenticate_via_agent(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    agent_config: &AgentAuth,
    rsa_hint: Option<HashAlg>,
) -> Result<AuthResult> {
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(&agent_config.socket).await?;
    let mut agent = russh::keys::agent::client::AgentClient::connect(stream);

    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(err) => {
            // A locked agent refuses to list signers; unlock and retry when
            // a passphrase is configured.
            let Some(passphrase) = &agent_config.passphrase else {
                return Err(TunnelError::AuthFailed(format!(
                    "failed to list identities from ssh-agent: {err}"
                )));
            };
            agent
                .unlock(passphrase.expose_secret().as_bytes())
                .await
                .map_err(|err| TunnelError::AuthFailed(format!("failed to unlock ssh-agent: {err}")))?;
            agent.request_identities().await.map_err(|err| {
                TunnelError::AuthFailed(format!("failed to list identities from ssh-agent: {err}"))
            })?
        }
    };
    if identities.is_empty() {
        return Err(TunnelError::AuthFailed("ssh-agent has no loaded keys".into()));
    }

    debug!(count = identities.len(), "attempting agent-based authentication");

    let mut last_failure = None;
    for key in identities {
        let hash_alg = match key.algorithm() {
            russh::keys::Algorithm::Rsa { .. } => rsa_hint,
            _ => None,
        };
        match handle
            .authenticate_publickey_with(username.to_string(), key, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(result),
            Ok(other) => last_failure = Some(other),
            Err(err) => {
                warn!(error = ?err, "agent authentication attempt failed");
            }
        }
    }
    Ok(last_failure.unwrap_or(AuthResult::Failure {
        remaining_methods: russh::MethodSet::empty(),
        partial_success: false,
    }))
}

#[cfg(not(unix))]
async fn authenticate_via_agent(
    _handle: &mut Handle<ClientHandler>,
    _username: &str,
    _agent_config: &AgentAuth,
    _rsa_hint: Option<HashAlg>,
) -> Result<AuthResult> {
    warn!("agent authentication is not supported on this platform");
    Ok(AuthResult::Failure {
        remaining_methods: russh::MethodSet::empty(),
        partial_success: false,
    })
}
