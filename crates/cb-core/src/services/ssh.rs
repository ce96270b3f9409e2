use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{BootstrapError, Result};
use crate::models::step::shell_quote;
use crate::models::Host;

use super::remote::{CommandOutput, RemoteChannel};

/// ssh reserves this exit status for its own connection errors.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Remote channel driving the system `ssh` binary in batch mode.
#[derive(Debug, Clone)]
pub struct SshChannel {
    /// Fallback login user for hosts that do not set one.
    pub default_user: Option<String>,
    /// Fallback identity for hosts that do not set one.
    pub default_identity: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for SshChannel {
    fn default() -> Self {
        Self {
            default_user: None,
            default_identity: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SshChannel {
    pub fn new(default_user: Option<String>, default_identity: Option<PathBuf>) -> Self {
        Self {
            default_user,
            default_identity,
            ..Default::default()
        }
    }

    fn ssh_args(&self, host: &Host) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            host.connection.port.to_string(),
        ];
        if let Some(identity) = host
            .connection
            .identity_file
            .as_ref()
            .or(self.default_identity.as_ref())
        {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        for option in &host.connection.ssh_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        let destination = match (&host.connection.user, &self.default_user) {
            (None, Some(user)) => format!("{user}@{}", host.address),
            _ => host.destination(),
        };
        args.push(destination);
        args.push("--".to_string());
        args
    }

    /// Wrap a command so it runs under `sh`, escalated when the host asks for it.
    pub fn remote_command(host: &Host, command: &str) -> String {
        let quoted = shell_quote(command);
        if host.connection.sudo {
            format!("sudo -n sh -c {quoted}")
        } else {
            format!("sh -c {quoted}")
        }
    }

    async fn run_ssh(
        &self,
        host: &Host,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(host));
        cmd.arg(Self::remote_command(host, command));
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BootstrapError::Remote(format!("failed to start ssh: {e}")))?;

        let exchange = async {
            if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(data)
                    .await
                    .map_err(|e| BootstrapError::Remote(format!("writing to ssh stdin: {e}")))?;
                pipe.shutdown().await.ok();
            }
            child
                .wait_with_output()
                .await
                .map_err(|e| BootstrapError::Remote(format!("waiting for ssh: {e}")))
        };

        let output = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| BootstrapError::Timeout(timeout))??;

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };
        if result.exit_code == SSH_CONNECTION_FAILURE {
            return Err(BootstrapError::Remote(format!(
                "ssh to {} failed: {}",
                host.address,
                result.stderr.lines().last().unwrap_or("connection error")
            )));
        }
        Ok(result)
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn run(&self, host: &Host, command: &str, timeout: Duration) -> Result<CommandOutput> {
        tracing::debug!(host = %host.id(), %command, "ssh_run");
        self.run_ssh(host, command, None, timeout).await
    }

    async fn upload(
        &self,
        host: &Host,
        contents: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> Result<()> {
        tracing::debug!(host = %host.id(), remote_path, bytes = contents.len(), "ssh_upload");
        let command = format!("cat > {}", shell_quote(remote_path));
        let output = self
            .run_ssh(host, &command, Some(contents), timeout)
            .await?;
        if !output.success() {
            return Err(BootstrapError::Remote(format!(
                "upload to {}:{remote_path} failed (exit {}): {}",
                host.address, output.exit_code, output.stderr
            )));
        }
        Ok(())
    }
}
