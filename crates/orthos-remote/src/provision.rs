//! Network-boot provisioning through the provisioning (cobbler) server
//!
//! Provisioning runs in three stages with a cancellation checkpoint before
//! each: look the machine up on the server, point it at the requested
//! install profile with netboot enabled, then power-cycle it so it boots into
//! the installer. Every stage is idempotent, so a transient failure can
//! safely restart from the top.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orthos_exec::{CommandResult, RemoteExecutor};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::RemoteError;
use crate::template::render;
use crate::traits::{RemoteControl, checkpoint};
use crate::types::{Channel, Outcome, RemoteAction, Target};

/// Command templates run on the provisioning server
///
/// Placeholders: `{fqdn}`, `{machine}`, `{arch}`, `{choice}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionCommands {
    /// Prints the system name when the machine is known to the server
    #[serde(default = "default_lookup")]
    pub lookup: String,
    /// Assigns the install profile and enables netboot
    #[serde(default = "default_setup")]
    pub setup: String,
}

fn default_lookup() -> String {
    "cobbler system find --name={fqdn}".to_string()
}

fn default_setup() -> String {
    "cobbler system edit --name={fqdn} --profile={choice} --netboot-enabled=true".to_string()
}

impl Default for ProvisionCommands {
    fn default() -> Self {
        Self {
            lookup: default_lookup(),
            setup: default_setup(),
        }
    }
}

/// Provisioning adapter
pub struct ProvisionAdapter {
    executor: Arc<dyn RemoteExecutor>,
    commands: ProvisionCommands,
    /// Power channel used for the final reboot, if any
    power: Option<Arc<dyn RemoteControl>>,
    command_timeout: Duration,
}

impl ProvisionAdapter {
    pub fn new(executor: Arc<dyn RemoteExecutor>, commands: ProvisionCommands) -> Self {
        Self {
            executor,
            commands,
            power: None,
            command_timeout: Duration::from_secs(120),
        }
    }

    /// Reboot machines through `power` once setup is done
    #[must_use]
    pub fn with_power(mut self, power: Arc<dyn RemoteControl>) -> Self {
        self.power = Some(power);
        self
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn run_cmd(
        &self,
        template: &str,
        vars: &[(&str, &str)],
    ) -> Result<CommandResult, RemoteError> {
        Ok(self
            .executor
            .run_with_timeout(&render(template, vars), self.command_timeout)
            .await?)
    }

    async fn run(
        &self,
        target: &Target,
        action: &RemoteAction,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, RemoteError> {
        let RemoteAction::Provision { choice } = action else {
            return Err(RemoteError::Unsupported {
                channel: Channel::Provision,
                action: action.name(),
            });
        };

        let vars = [
            ("fqdn", target.fqdn.as_str()),
            ("machine", target.machine_id.as_str()),
            ("arch", target.architecture.as_str()),
            ("choice", choice.as_str()),
        ];

        checkpoint(cancel, "provisioning record lookup")?;
        let lookup = self.run_cmd(&self.commands.lookup, &vars).await?;
        if !lookup.success() {
            return Err(RemoteError::Busy(format!(
                "provisioning server lookup failed: {}",
                lookup.combined_output().trim()
            )));
        }
        if lookup.stdout.trim().is_empty() {
            return Err(RemoteError::InvalidState(format!(
                "{} is not registered on the provisioning server",
                target.fqdn
            )));
        }

        checkpoint(cancel, "install profile assignment")?;
        let setup = self.run_cmd(&self.commands.setup, &vars).await?;
        check_setup(&setup)?;
        info!(machine = %target.machine_id, choice = %choice, "install profile assigned");

        let Some(power) = &self.power else {
            return Ok(Some(format!("setup {choice} prepared, manual reboot required")));
        };

        checkpoint(cancel, "reboot into installer")?;
        match power.execute(target, &RemoteAction::PowerCycle, cancel).await {
            Outcome::Success { .. } => Ok(Some(format!("setup {choice} initialized"))),
            Outcome::PermanentFailure { reason } if target.bmc.is_none() => {
                warn!(machine = %target.machine_id, reason = %reason, "no remote power for reboot");
                Ok(Some(format!("setup {choice} prepared, manual reboot required")))
            }
            Outcome::TransientFailure { reason } => Err(RemoteError::Busy(reason)),
            Outcome::PermanentFailure { reason } => Err(RemoteError::InvalidState(reason)),
        }
    }
}

fn check_setup(result: &CommandResult) -> Result<(), RemoteError> {
    if result.success() {
        return Ok(());
    }
    let message = result.combined_output().trim().to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("profile") && (lower.contains("not found") || lower.contains("invalid")) {
        return Err(RemoteError::InvalidState(message));
    }
    if lower.contains("permission denied") || lower.contains("login failed") {
        return Err(RemoteError::Rejected(message));
    }
    Err(RemoteError::Busy(message))
}

#[async_trait]
impl RemoteControl for ProvisionAdapter {
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
        Channel::Provision
    }
}
