//! Tunnel and authentication configuration.

use std::path::PathBuf;
use std::sync::Arc;

use russh::keys::{self, PrivateKey};
use secrecy::{ExposeSecret, SecretString};
use tokio::fs;

use crate::error::TunnelError;

type Result<T> = crate::TunnelResult<T>;

/// Per-tunnel configuration.
///
/// `ssh_addr` may omit the port; `:22` is filled in. The raw russh client
/// configuration is opaque to the tunnel; defaults apply when `None`.
#[derive(Clone)]
pub struct TunnelConfig {
    /// `host[:port]` address of the SSH server (required).
    pub ssh_addr: String,
    /// Authentication settings (required).
    pub auth: AuthConfig,
    /// Raw russh client configuration (optional handshake parameters).
    pub client: Option<Arc<russh::client::Config>>,
}

impl TunnelConfig {
    pub fn new(ssh_addr: impl Into<String>, auth: AuthConfig) -> Self {
        Self {
            ssh_addr: ssh_addr.into(),
            auth,
            client: None,
        }
    }
}

/// Authentication settings for an SSH tunnel.
#[derive(Clone, Default)]
pub struct AuthConfig {
    pub username: String,
    /// Password, tried first when set.
    pub password: Option<SecretString>,
    /// ssh-agent connection; its signers are tried after the password.
    pub agent: Option<AgentAuth>,
    /// Private-key sources, tried in order after the agent.
    pub keys: Vec<KeySource>,
}

impl AuthConfig {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(SecretString::from(password.into())),
            ..Default::default()
        }
    }

    /// True when no authentication method is configured at all.
    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.agent.is_none() && self.keys.is_empty()
    }
}

/// Configuration of an ssh-agent connection.
#[derive(Clone)]
pub struct AgentAuth {
    /// Path of the agent's unix socket (usually `$SSH_AUTH_SOCK`).
    pub socket: PathBuf,
    /// Unlock passphrase for agents that start locked.
    pub passphrase: Option<SecretString>,
}

/// One private-key source tried during public-key authentication.
///
/// Keys that are encrypted require the matching passphrase.
#[derive(Clone)]
pub enum KeySource {
    /// An already-decoded private key.
    Key(Arc<PrivateKey>),
    /// An in-memory PEM or OpenSSH blob.
    Pem {
        pem: String,
        passphrase: Option<SecretString>,
    },
    /// A key file on disk.
    File {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
}

impl KeySource {
    /// Decode the key, consulting the passphrase when the blob is encrypted.
    pub async fn load(&self) -> Result<Arc<PrivateKey>> {
        match self {
            KeySource::Key(key) => Ok(key.clone()),
            KeySource::Pem { pem, passphrase } => decode_key(pem, passphrase.as_ref(), "in-memory key"),
            KeySource::File { path, passphrase } => {
                let data = fs::read_to_string(path).await?;
                decode_key(&data, passphrase.as_ref(), &path.display().to_string())
            }
        }
    }
}

fn decode_key(data: &str, passphrase: Option<&SecretString>, origin: &str) -> Result<Arc<PrivateKey>> {
    let passphrase = passphrase.map(|p| p.expose_secret().to_string());
    match keys::decode_secret_key(data, passphrase.as_deref()) {
        Ok(key) => Ok(Arc::new(key)),
        Err(keys::Error::KeyIsEncrypted) => Err(TunnelError::InvalidConfig(format!(
            "{origin} is encrypted and no passphrase is configured"
        ))),
        Err(err) => Err(TunnelError::InvalidConfig(format!(
            "{origin} is not a usable private key: {err}"
        ))),
    }
}
