//! Configuration for the external-client tunnel.

use std::net::IpAddr;

use tunnel_core::backoff::BackoffConfig;

use crate::command::CommandTemplate;

/// Configuration of an SSH tunnel carried by an external client command.
#[derive(Clone)]
pub struct ExecConfig {
    /// SSH user.
    pub user: String,
    /// SSH server host.
    pub ssh_host: String,
    /// SSH server port.
    pub ssh_port: String,
    /// Client command template; its rendered output is shell-split and
    /// executed.
    pub command_template: CommandTemplate,
    /// Value substituted for the template's `{ExtraArgs}` placeholder.
    pub command_extra_args: String,
    /// Back-off used while connecting to the client's forwarding port.
    pub backoff: BackoffConfig,
    /// Local IP address to forward from (default 127.0.0.1).
    pub local_ip: Option<IpAddr>,
}
