//! Serial console sessions on the console concentrator

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orthos_exec::{CommandResult, RemoteExecutor};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::error::RemoteError;
use crate::template::render;
use crate::traits::{RemoteControl, checkpoint};
use crate::types::{Channel, Outcome, RemoteAction, Target};

/// Command templates run on the concentrator
///
/// Placeholders: `{fqdn}`, `{machine}`, `{arch}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleCommands {
    /// Exits 0 when a session for the machine is already running
    #[serde(default = "default_check")]
    pub check: String,
    /// Starts a detached session attached to the machine's serial line
    #[serde(default = "default_attach")]
    pub attach: String,
}

fn default_check() -> String {
    "screen -S {fqdn} -Q select .".to_string()
}

fn default_attach() -> String {
    "screen -dmS {fqdn} console -f {fqdn}".to_string()
}

impl Default for ConsoleCommands {
    fn default() -> Self {
        Self {
            check: default_check(),
            attach: default_attach(),
        }
    }
}

/// Console adapter driving a serial console concentrator over SSH
pub struct SerialConsoleAdapter {
    executor: Arc<dyn RemoteExecutor>,
    commands: ConsoleCommands,
    command_timeout: Duration,
}

impl SerialConsoleAdapter {
    pub fn new(executor: Arc<dyn RemoteExecutor>, commands: ConsoleCommands) -> Self {
        Self {
            executor,
            commands,
            command_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn session_active(&self, vars: &[(&str, &str)]) -> Result<bool, RemoteError> {
        let result = self
            .executor
            .run_with_timeout(&render(&self.commands.check, vars), self.command_timeout)
            .await?;
        Ok(result.success())
    }

    async fn run(
        &self,
        target: &Target,
        action: &RemoteAction,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, RemoteError> {
        if *action != RemoteAction::ConsoleAttach {
            return Err(RemoteError::Unsupported {
                channel: Channel::Console,
                action: action.name(),
            });
        }

        let vars = [
            ("fqdn", target.fqdn.as_str()),
            ("machine", target.machine_id.as_str()),
            ("arch", target.architecture.as_str()),
        ];

        checkpoint(cancel, "console session lookup")?;
        if self.session_active(&vars).await? {
            return Ok(Some("console session already active".to_string()));
        }

        checkpoint(cancel, "console attach")?;
        let result = self
            .executor
            .run_with_timeout(&render(&self.commands.attach, &vars), self.command_timeout)
            .await?;
        check_attach(&result)?;

        checkpoint(cancel, "console session verification")?;
        if !self.session_active(&vars).await? {
            // the line is usually held by another client or the port is resetting
            return Err(RemoteError::Busy(
                "console session did not come up".to_string(),
            ));
        }

        info!(machine = %target.machine_id, "console session attached");
        Ok(Some("console session attached".to_string()))
    }
}

fn check_attach(result: &CommandResult) -> Result<(), RemoteError> {
    if result.success() {
        return Ok(());
    }
    let message = result.combined_output().trim().to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("not allowed") {
        return Err(RemoteError::Rejected(message));
    }
    if lower.contains("unknown") || lower.contains("no such console") {
        return Err(RemoteError::InvalidState(message));
    }
    Err(RemoteError::Busy(message))
}

#[async_trait]
impl RemoteControl for SerialConsoleAdapter {
    #[instrument(skip(self, cancel), fields(machine = %target.machine_id))]
    async fn execute(
        &self,
        target: &Target,
        action: &RemoteAction,
        cancel: &CancellationToken,
    ) -> Outcome {
        match self.run(target, action, cancel).await {
            Ok(detail) => Outcome::Success { detail },
            Err(e) => e.into(),
        }
    }

    fn channel(&self) -> Channel {
        Channel::Console
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedExecutor, failed, ok};

    fn target() -> Target {
        Target::new("m1", "m1.lab.example.com").with_architecture("x86_64")
    }

    #[tokio::test]
    async fn test_existing_session_is_reused() {
        let exec = Arc::new(ScriptedExecutor::new().on("-Q select", Ok(ok(""))));
        let adapter = SerialConsoleAdapter::new(exec.clone(), ConsoleCommands::default());

        let outcome = adapter
            .execute(&target(), &RemoteAction::ConsoleAttach, &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::success_with("console session already active"));
        assert_eq!(exec.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_console_is_permanent() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("-Q select", Ok(failed(1, "No screen session found.")))
                .on("-dmS", Ok(failed(1, "console: unknown host m1.lab.example.com"))),
        );
        let adapter = SerialConsoleAdapter::new(exec, ConsoleCommands::default());

        let outcome = adapter
            .execute(&target(), &RemoteAction::ConsoleAttach, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, Outcome::PermanentFailure { .. }));
    }

    #[tokio::test]
    async fn test_session_that_never_appears_is_transient() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("-Q select", Ok(failed(1, "No screen session found.")))
                .on("-dmS", Ok(ok(""))),
        );
        let adapter = SerialConsoleAdapter::new(exec.clone(), ConsoleCommands::default());

        let outcome = adapter
            .execute(&target(), &RemoteAction::ConsoleAttach, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, Outcome::TransientFailure { .. }));
        assert_eq!(exec.commands().len(), 3);
    }
}
