//! BMC power control through `ipmitool`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orthos_exec::{CommandResult, RemoteExecutor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::RemoteError;
use crate::template::shell_quote;
use crate::traits::{RemoteControl, checkpoint};
use crate::types::{Channel, Outcome, RemoteAction, Target};

/// Power adapter speaking IPMI to each machine's BMC
///
/// The executor is expected to carry `IPMI_PASSWORD` in its environment;
/// commands use `-E` so the password never appears in a process listing.
pub struct IpmiPowerAdapter {
    executor: Arc<dyn RemoteExecutor>,
    user: String,
    interface: String,
    command_timeout: Duration,
}

impl IpmiPowerAdapter {
    pub fn new(executor: Arc<dyn RemoteExecutor>, user: impl Into<String>) -> Self {
        Self {
            executor,
            user: user.into(),
            interface: "lanplus".to_string(),
            command_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn chassis_cmd(&self, bmc: &str, op: &str) -> String {
        format!(
            "ipmitool -I {} -H {} -U {} -E chassis power {op}",
            shell_quote(&self.interface),
            shell_quote(bmc),
            shell_quote(&self.user),
        )
    }

    async fn chassis(&self, bmc: &str, op: &str) -> Result<String, RemoteError> {
        let result = self
            .executor
            .run_with_timeout(&self.chassis_cmd(bmc, op), self.command_timeout)
            .await?;
        check_ipmi(&result)?;
        Ok(result.stdout.trim().to_string())
    }

    /// Query current chassis power state
    async fn is_on(&self, bmc: &str) -> Result<bool, RemoteError> {
        let status = self.chassis(bmc, "status").await?;
        debug!(bmc = %bmc, status = %status, "chassis power status");
        // "Chassis Power is on" / "Chassis Power is off"
        Ok(status.to_ascii_lowercase().ends_with(" on"))
    }

    async fn run(
        &self,
        target: &Target,
        action: &RemoteAction,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, RemoteError> {
        let bmc = target.bmc.as_deref().ok_or(RemoteError::NoRemotePower)?;

        let op = match action {
            RemoteAction::PowerOn => "on",
            RemoteAction::PowerOff => "off",
            RemoteAction::PowerCycle => {
                checkpoint(cancel, "power status query")?;
                // cycling a powered-off chassis is rejected by most BMCs
                if self.is_on(bmc).await? {
                    "cycle"
                } else {
                    info!(
                        machine = %target.machine_id,
                        "chassis is off, powering on instead of cycling"
                    );
                    "on"
                }
            }
            other => {
                return Err(RemoteError::Unsupported {
                    channel: Channel::Power,
                    action: other.name(),
                });
            }
        };

        checkpoint(cancel, &format!("chassis power {op}"))?;
        let output = self.chassis(bmc, op).await?;
        info!(machine = %target.machine_id, op, "chassis power command accepted");
        Ok((!output.is_empty()).then_some(output))
    }
}

/// Map `ipmitool` failures onto the error taxonomy
fn check_ipmi(result: &CommandResult) -> Result<(), RemoteError> {
    if result.success() {
        return Ok(());
    }

    let message = result.combined_output().trim().to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("rakp")
        || lower.contains("authentication")
        || lower.contains("password")
        || lower.contains("privilege")
        || lower.contains("unauthorized")
    {
        return Err(RemoteError::Rejected(message));
    }
    if lower.contains("not supported in present state")
        || lower.contains("invalid command")
        || lower.contains("invalid data field")
    {
        return Err(RemoteError::InvalidState(message));
    }

    // session setup trouble or "node busy": worth another attempt
    warn!(status = result.status, error = %message, "ipmitool failed");
    Err(RemoteError::Busy(message))
}

#[async_trait]
impl RemoteControl for IpmiPowerAdapter {
    #[instrument(skip(self, cancel), fields(machine = %target.machine_id, action = action.name()))]
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
        Channel::Power
    }
}
