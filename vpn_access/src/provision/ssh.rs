//! SSH-backed provisioner driving the add/remove scripts on each server.
//!
//! Every call spawns its own `ssh` process, so one session per logical
//! operation. Key authentication only; `BatchMode` keeps ssh from ever
//! prompting.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::{CredentialProvisioner, ProvisionError, ProvisionResult, validate_name};
use crate::entitlement::models::Server;

/// Placeholder replaced by the credential name in the removal marker
const NAME_PLACEHOLDER: &str = "{name}";

/// Longest slice of remote output kept in error messages
const MAX_ERROR_OUTPUT: usize = 512;

/// SSH provisioner configuration
#[derive(Debug, Clone)]
pub struct SshProvisionerConfig {
    /// Remote login
    pub username: String,
    /// Connect here instead of the server's own host
    pub host_override: Option<String>,
    /// Connect on this port instead of the server's own port
    pub port_override: Option<u16>,
    /// Private key passed with `-i`
    pub key_path: Option<PathBuf>,
    /// Bound on each remote command, connection included
    pub command_timeout: Duration,
    pub add_script: String,
    pub remove_script: String,
    /// Text preceding the generated file path in the add script's output
    pub created_marker: String,
    /// Text the remove script prints on success; `{name}` is substituted
    pub removed_marker: String,
    /// Directory holding `{name}.ovpn` when the add script names no path
    pub fallback_dir: String,
    /// Local ssh binary
    pub ssh_binary: String,
}

impl Default for SshProvisionerConfig {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            host_override: None,
            port_override: None,
            key_path: None,
            command_timeout: Duration::from_secs(30),
            add_script: "./adduser.sh".to_string(),
            remove_script: "./removeuser.sh".to_string(),
            created_marker: "Configuration file created:".to_string(),
            removed_marker: "User {name} removed successfully".to_string(),
            fallback_dir: "/root".to_string(),
            ssh_binary: "ssh".to_string(),
        }
    }
}

/// Output of one remote command
#[derive(Debug)]
struct RemoteOutput {
    status: i32,
    stdout: String,
    stderr: String,
}

impl RemoteOutput {
    fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    fn into_failure(self) -> ProvisionError {
        let mut output = self.combined();
        if output.len() > MAX_ERROR_OUTPUT {
            let mut end = MAX_ERROR_OUTPUT;
            while !output.is_char_boundary(end) {
                end -= 1;
            }
            output.truncate(end);
        }
        ProvisionError::CommandFailed {
            status: self.status,
            output,
        }
    }
}

/// Provisioner that runs shell scripts on the server over `ssh`
pub struct SshProvisioner {
    config: SshProvisionerConfig,
}

impl SshProvisioner {
    pub fn new(config: SshProvisionerConfig) -> Self {
        Self { config }
    }

    fn ssh_args(&self, server: &Server, remote_command: &str) -> Vec<String> {
        let host = self
            .config
            .host_override
            .as_deref()
            .unwrap_or(&server.host);
        let port = self.config.port_override.unwrap_or(server.port);
        let connect_timeout = self.config.command_timeout.as_secs().max(1);

        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={connect_timeout}"),
            "-p".to_string(),
            port.to_string(),
        ];
        if let Some(key) = &self.config.key_path {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", self.config.username, host));
        args.push("--".to_string());
        args.push(remote_command.to_string());
        args
    }

    async fn run(&self, server: &Server, remote_command: &str) -> ProvisionResult<RemoteOutput> {
        let mut command = Command::new(&self.config.ssh_binary);
        command
            .args(self.ssh_args(server, remote_command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn()?;
        let output = tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| ProvisionError::Timeout(self.config.command_timeout))??;

        Ok(RemoteOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn credential_path(&self, name: &str, add_output: &str) -> String {
        parse_created_path(add_output, &self.config.created_marker)
            .unwrap_or_else(|| format!("{}/{name}.ovpn", self.config.fallback_dir))
    }
}

/// Find the generated `.ovpn` path announced after `marker`.
///
/// Paths with characters that would need quoting on the remote side are
/// ignored.
fn parse_created_path(output: &str, marker: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(marker)?;
        let path = rest.trim();
        let safe = path.ends_with(".ovpn")
            && path
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'));
        safe.then(|| path.to_string())
    })
}

/// Whether the remove script's output confirms removal of `name`.
fn removal_confirmed(output: &str, marker_template: &str, name: &str) -> bool {
    output.contains(&marker_template.replace(NAME_PLACEHOLDER, name))
}

#[async_trait]
impl CredentialProvisioner for SshProvisioner {
    async fn provision(&self, server: &Server, name: &str) -> ProvisionResult<String> {
        validate_name(name)?;

        let added = self
            .run(server, &format!("{} {name}", self.config.add_script))
            .await?;
        if added.status != 0 {
            return Err(added.into_failure());
        }

        let path = self.credential_path(name, &added.combined());
        log::debug!("Reading credential for '{}' from {}:{}", name, server.name, path);

        let file = self.run(server, &format!("cat {path}")).await?;
        if file.status != 0 {
            return Err(file.into_failure());
        }
        if file.stdout.trim().is_empty() {
            return Err(ProvisionError::MissingOutput);
        }

        log::info!("Provisioned credential '{}' on server {}", name, server.name);
        Ok(file.stdout)
    }

    async fn revoke(&self, server: &Server, name: &str) -> ProvisionResult<bool> {
        validate_name(name)?;

        let removed = self
            .run(server, &format!("{} {name}", self.config.remove_script))
            .await?;
        let confirmed = removal_confirmed(&removed.combined(), &self.config.removed_marker, name);

        if confirmed {
            log::info!("Revoked credential '{}' on server {}", name, server.name);
        } else {
            log::warn!(
                "Removal of '{}' on server {} not confirmed (status {})",
                name,
                server.name,
                removed.status
            );
        }
        Ok(confirmed)
    }
}
