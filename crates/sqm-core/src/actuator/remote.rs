//! Remote command channel
//!
//! The pipeline treats the gateway as an opaque command target. The
//! default transport shells out to the system `ssh` client in batch mode.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::RemoteError;

/// Exit status the OpenSSH client reserves for its own failures
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Result of a command that reached the gateway
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `host`. `Err` means the command never ran (or its
    /// outcome is unknown); a non-zero exit code is returned as `Ok`.
    async fn execute(&self, host: &str, command: &str, timeout: Duration) -> RemoteResult<CommandOutput>;

    /// Write `content` to `remote_path` on `host`, replacing any previous file
    async fn upload_content(
        &self,
        host: &str,
        content: &str,
        remote_path: &str,
        timeout: Duration,
    ) -> RemoteResult<CommandOutput>;
}

/// Accepts hostnames, IPv4/IPv6 literals and `user@host`
pub fn validate_host(host: &str) -> RemoteResult<()> {
    if host.is_empty() || host.len() > 253 {
        return Err(RemoteError::InvalidTarget(format!(
            "host '{}' must be 1-253 characters",
            host
        )));
    }
    if host.starts_with('-') {
        return Err(RemoteError::InvalidTarget(format!(
            "host '{}' must not start with '-'",
            host
        )));
    }
    if let Some(bad) = host
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '@')))
    {
        return Err(RemoteError::InvalidTarget(format!(
            "host '{}' contains '{}'",
            host, bad
        )));
    }
    Ok(())
}

/// Absolute path made of `[A-Za-z0-9_./-]` without parent components
pub fn validate_remote_path(path: &str) -> RemoteResult<()> {
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(RemoteError::InvalidTarget(format!(
            "remote path '{}' must be an absolute file path",
            path
        )));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(RemoteError::InvalidTarget(format!(
            "remote path '{}' must not contain '..'",
            path
        )));
    }
    if let Some(bad) = path
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-')))
    {
        return Err(RemoteError::InvalidTarget(format!(
            "remote path '{}' contains '{}'",
            path, bad
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: Option<String>,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: None,
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
        }
    }
}

/// [`RemoteExecutor`] backed by the OpenSSH client
#[derive(Debug, Clone, Default)]
pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn destination(&self, host: &str) -> RemoteResult<String> {
        validate_host(host)?;
        match &self.config.user {
            Some(user) if !host.contains('@') => {
                validate_host(user)?;
                Ok(format!("{}@{}", user, host))
            }
            _ => Ok(host.to_string()),
        }
    }

    fn command(&self, host: &str, remote_command: &str) -> RemoteResult<Command> {
        let destination = self.destination(host)?;
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg("-p")
            .arg(self.config.port.to_string());
        if let Some(identity) = &self.config.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg("--")
            .arg(destination)
            .arg(remote_command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    fn finish(output: std::process::Output) -> RemoteResult<CommandOutput> {
        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if result.exit_code == SSH_TRANSPORT_FAILURE {
            return Err(RemoteError::Unreachable(result.stderr.trim().to_string()));
        }
        Ok(result)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, host: &str, command: &str, timeout: Duration) -> RemoteResult<CommandOutput> {
        let mut cmd = self.command(host, command)?;
        cmd.stdin(Stdio::null());
        debug!(host, command, "Executing remote command");

        let child = cmd.spawn()?;
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout(timeout))??;
        Self::finish(output)
    }

    async fn upload_content(
        &self,
        host: &str,
        content: &str,
        remote_path: &str,
        timeout: Duration,
    ) -> RemoteResult<CommandOutput> {
        validate_remote_path(remote_path)?;
        let dir = remote_path
            .rsplit_once('/')
            .map(|(dir, _)| if dir.is_empty() { "/" } else { dir })
            .unwrap_or("/");
        let script = format!(
            "mkdir -p '{dir}' && cat > '{path}.tmp' && mv '{path}.tmp' '{path}'",
            dir = dir,
            path = remote_path
        );

        let mut cmd = self.command(host, &script)?;
        cmd.stdin(Stdio::piped());
        debug!(host, remote_path, bytes = content.len(), "Uploading content");

        let mut child = cmd.spawn()?;
        let upload = async move {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(content.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(timeout, upload)
            .await
            .map_err(|_| RemoteError::Timeout(timeout))??;
        Self::finish(output)
    }
}
