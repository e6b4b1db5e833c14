//! Command executor trait

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::CommandResult;

/// Runs shell commands on some host
///
/// Implementations must be safe to share between tasks targeting different
/// machines.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command, bounded by the executor's default timeout
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError>;

    /// Run a command with an explicit timeout
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Short name for logs
    fn executor_type(&self) -> &'static str;
}
