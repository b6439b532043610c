//! Rendering and tokenizing external SSH client command lines.

use crate::error::{ExecError, ExecResult};

/// Command template text for the OpenSSH `ssh` client binary.
pub const OPENSSH_TEMPLATE: &str =
    r#"ssh -nNT -L "{LocalIP}:{LocalPort}:{RemoteAddr}" -p "{SSHPort}" "{User}@{SSHHost}" {ExtraArgs}"#;

/// Command template text for the PuTTY client.
pub const PUTTY_TEMPLATE: &str =
    r#"putty -ssh -NT "{User}@{SSHHost}" -P "{SSHPort}" -L "{LocalIP}:{LocalPort}:{RemoteAddr}" {ExtraArgs}"#;

/// An SSH client command template.
///
/// Recognized placeholders: `{LocalIP}`, `{LocalPort}`, `{RemoteAddr}`,
/// `{User}`, `{SSHHost}`, `{SSHPort}`, `{ExtraArgs}`. The rendered text is
/// split according to POSIX shell rules and executed.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    text: String,
}

pub(crate) struct TemplateData {
    pub local_ip: String,
    pub local_port: String,
    pub remote_addr: String,
    pub user: String,
    pub ssh_host: String,
    pub ssh_port: String,
    pub extra_args: String,
}

impl CommandTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Template for the OpenSSH `ssh` client binary.
    pub fn openssh() -> Self {
        Self::new(OPENSSH_TEMPLATE)
    }

    /// Template for the PuTTY client.
    pub fn putty() -> Self {
        Self::new(PUTTY_TEMPLATE)
    }

    fn render(&self, data: &TemplateData) -> String {
        self.text
            .replace("{LocalIP}", &data.local_ip)
            .replace("{LocalPort}", &data.local_port)
            .replace("{RemoteAddr}", &data.remote_addr)
            .replace("{User}", &data.user)
            .replace("{SSHHost}", &data.ssh_host)
            .replace("{SSHPort}", &data.ssh_port)
            .replace("{ExtraArgs}", &data.extra_args)
    }

    /// Render the template and split it into an executable name plus
    /// arguments.
    pub(crate) fn command_line(&self, data: &TemplateData) -> ExecResult<(String, Vec<String>)> {
        let text = self.render(data);
        let tokens = shlex::split(&text).ok_or_else(|| ExecError::Tokenize {
            command: text.clone(),
            message: "unbalanced quoting".into(),
        })?;
        let mut tokens = tokens.into_iter();
        let name = tokens.next().ok_or_else(|| ExecError::EmptyCommand(text.clone()))?;
        Ok((name, tokens.collect()))
    }
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self::openssh()
    }
}
