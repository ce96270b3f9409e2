use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::Result;
use crate::models::{Host, PostCondition};

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
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

/// The only boundary to the hosts being provisioned.
///
/// Implementations must return `BootstrapError::Timeout` when `timeout`
/// elapses and `BootstrapError::Remote` when the channel itself fails
/// (as opposed to the command exiting non-zero).
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn run(&self, host: &Host, command: &str, timeout: Duration) -> Result<CommandOutput>;

    async fn upload(
        &self,
        host: &Host,
        contents: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> Result<()>;

    async fn check(
        &self,
        host: &Host,
        condition: &PostCondition,
        timeout: Duration,
    ) -> Result<bool> {
        let output = self.run(host, &condition.probe_command(), timeout).await?;
        Ok(output.success())
    }

    /// TCP connect probe from the orchestrating machine.
    async fn probe(&self, address: &str, port: u16, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect((address, port))).await,
            Ok(Ok(_))
        )
    }
}
