use thiserror::Error;
use tunnel_core::TunnelError;
use tunnel_core::backoff::BackoffError;

/// Errors raised while tunneling through an external SSH client.
#[derive(Error, Debug)]
pub enum ExecError {
    /// Shell tokenization of the rendered command failed.
    #[error("tokenize command {command:?}: {message}")]
    Tokenize { command: String, message: String },

    /// The rendered command contained no tokens.
    #[error("empty command: {0:?}")]
    EmptyCommand(String),

    /// Starting the client process failed.
    #[error("spawn ssh client {name:?}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The client process exited while the tunnel was still wanted.
    #[error("ssh client exited: {0}")]
    ClientExited(String),

    /// The cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Retries were exhausted; carries the last underlying error.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<ExecError>,
    },

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the core tunnel plumbing.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Result type alias for external-client tunnel operations.
pub type ExecResult<T> = Result<T, ExecError>;

impl From<BackoffError<ExecError>> for ExecError {
    fn from(err: BackoffError<ExecError>) -> Self {
        match err {
            BackoffError::Exhausted { attempts, source } => ExecError::Exhausted {
                attempts,
                source: Box::new(source),
            },
            BackoffError::Cancelled => ExecError::Cancelled,
        }
    }
}
