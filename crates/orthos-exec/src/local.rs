//! Commands run on the orthos host itself

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ExecError;
use crate::result::CommandResult;
use crate::traits::RemoteExecutor;

/// Runs `sh -c <cmd>` as a child process
///
/// BMC tooling (`ipmitool`) and probes run this way. Variables added with
/// [`LocalExecutor::with_env`] go to the child only; `ipmitool -E` reads the
/// BMC password from `IPMI_PASSWORD` so it never shows up in `ps`.
/// A child still running at its deadline is killed.
#[derive(Clone)]
pub struct LocalExecutor {
    env: BTreeMap<String, String>,
    default_timeout: Duration,
}

impl LocalExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            env: BTreeMap::new(),
            default_timeout: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn command(&self, cmd: &str) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.run_with_timeout(cmd, self.default_timeout).await
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        let started = Instant::now();
        let child = self
            .command(cmd)
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        // dropping the wait future on timeout drops the child, which kills it
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!(command = %cmd, ?timeout, "Local command timed out");
                ExecError::Timeout { timeout }
            })?
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let result = CommandResult::from_bytes(
            output.status.code().unwrap_or(-1),
            &output.stdout,
            &output.stderr,
            started.elapsed(),
        );
        debug!(
            command = %cmd,
            status = result.status,
            duration = ?result.duration,
            "Local command finished"
        );
        Ok(result)
    }

    fn executor_type(&self) -> &'static str {
        "local"
    }
}
