use thiserror::Error;

use crate::backoff::BackoffError;

/// Errors that can occur while establishing or serving a tunnel.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Destination network tag is not in the supported set.
    #[error("unsupported network: {0:?}")]
    UnsupportedNetwork(String),

    /// Deadlines cannot be applied to SSH channel connections.
    #[error("deadlines are not supported on tunneled connections")]
    DeadlineUnsupported,

    /// The tunnel configuration is unusable as given.
    #[error("invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    /// An endpoint address failed to parse.
    #[error("parse address {addr:?}: {message}")]
    InvalidAddress { addr: String, message: String },

    /// Binding the local listener failed.
    #[error("listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Connecting to the SSH server or performing the handshake failed.
    #[error("connect to ssh server {addr}: {source}")]
    TransportDial {
        addr: String,
        #[source]
        source: russh::Error,
    },

    /// Every configured authentication method was rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A live SSH session terminated.
    #[error("ssh session closed: {0}")]
    TransportClosed(String),

    /// The server rejected a forwarding channel open.
    #[error("open {channel_type:?} channel to {target}: {source}")]
    ChannelOpen {
        channel_type: &'static str,
        target: String,
        #[source]
        source: russh::Error,
    },

    /// The cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Retries were exhausted; carries the last underlying error.
    #[error("gave up after {attempts} attempts: {source}")]
    BackoffExhausted {
        attempts: u32,
        #[source]
        source: Box<TunnelError>,
    },

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol error
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),
}

/// Result type alias for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

impl From<BackoffError<TunnelError>> for TunnelError {
    fn from(err: BackoffError<TunnelError>) -> Self {
        match err {
            BackoffError::Exhausted { attempts, source } => TunnelError::BackoffExhausted {
                attempts,
                source: Box::new(source),
            },
            BackoffError::Cancelled => TunnelError::Cancelled,
        }
    }
}

impl TunnelError {
    pub(crate) fn invalid_address(addr: &str, message: impl Into<String>) -> Self {
        Self::InvalidAddress {
            addr: addr.to_string(),
            message: message.into(),
        }
    }
}
