//! SSH tunnels driven by an external `ssh`/`plink` client process.
//!
//! Instead of speaking SSH in-process, this crate renders a client command
//! from a template, spawns it, and connects to the local forwarding port the
//! client opens. Useful where an OpenSSH or PuTTY installation must be the
//! one doing the authenticating.

pub mod command;
pub mod config;
pub mod dial;
pub mod error;
pub mod listen;

pub use command::{CommandTemplate, OPENSSH_TEMPLATE, PUTTY_TEMPLATE};
pub use config::ExecConfig;
pub use dial::dial;
pub use error::{ExecError, ExecResult};
pub use listen::listen;
