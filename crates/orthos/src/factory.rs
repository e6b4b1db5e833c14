//! Builds executors, adapters and the prober from configuration

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use orthos_exec::{ConnectionInfo, KeySource, LocalExecutor, RemoteExecutor, SshExecutor};
use orthos_remote::{
    AdapterRegistry, IpmiPowerAdapter, PingProber, Prober, ProvisionAdapter, RemoteControl,
    SerialConsoleAdapter, TcpProber,
};

use crate::config::{BmcConfig, Config, ManagementHost, ProbeMethod};

/// Executor for a management host: local shell for localhost, SSH otherwise
fn create_executor(host: &ManagementHost) -> Result<Arc<dyn RemoteExecutor>> {
    if host.is_local() {
        return Ok(Arc::new(
            LocalExecutor::new().with_default_timeout(host.command_timeout()),
        ));
    }

    let key_source = match (&host.ssh_key, &host.ssh_key_env) {
        (Some(path), _) => KeySource::Path(path.clone()),
        (None, Some(var)) => KeySource::Env(var.clone()),
        (None, None) => KeySource::Agent,
    };

    let conn_info = ConnectionInfo::new(&host.host, &host.user).with_port(host.port);
    let executor = SshExecutor::new(conn_info, &key_source)
        .map_err(|e| eyre::eyre!("failed to create SSH executor for {}: {e}", host.host))?;
    Ok(Arc::new(executor.with_default_timeout(host.command_timeout())))
}

/// `ipmitool` runs locally with the password passed through the environment
fn create_power(bmc: &BmcConfig) -> Arc<dyn RemoteControl> {
    let mut executor = LocalExecutor::new().with_default_timeout(bmc.command_timeout());
    match std::env::var(&bmc.password_env) {
        Ok(password) => executor = executor.with_env("IPMI_PASSWORD", password),
        Err(_) => tracing::warn!(
            var = %bmc.password_env,
            "BMC password variable not set, IPMI calls will likely be rejected"
        ),
    }

    Arc::new(
        IpmiPowerAdapter::new(Arc::new(executor), &bmc.user)
            .with_interface(&bmc.interface)
            .with_command_timeout(bmc.command_timeout()),
    )
}

/// One adapter per configured channel
///
/// # Errors
/// Returns an error if an SSH key cannot be resolved
pub fn build_adapters(config: &Config) -> Result<AdapterRegistry> {
    let power = create_power(&config.bmc);
    let mut registry = AdapterRegistry::new().with(power.clone());

    if let Some(console) = &config.console {
        let executor = create_executor(&console.host)?;
        registry = registry.with(Arc::new(
            SerialConsoleAdapter::new(executor, console.commands.clone())
                .with_command_timeout(console.host.command_timeout()),
        ));
    }

    if let Some(provisioning) = &config.provisioning {
        let executor = create_executor(&provisioning.host)?;
        let mut adapter = ProvisionAdapter::new(executor, provisioning.commands.clone())
            .with_command_timeout(provisioning.host.command_timeout());
        if provisioning.reboot_after_setup {
            adapter = adapter.with_power(power);
        }
        registry = registry.with(Arc::new(adapter));
    }

    tracing::info!(channels = ?registry.channels(), "Remote control adapters ready");
    Ok(registry)
}

#[must_use]
pub fn build_prober(config: &Config) -> Arc<dyn Prober> {
    let timeout = Duration::from_secs(config.engine.probe_timeout_secs.max(1));
    match config.probe.method {
        ProbeMethod::Ping => Arc::new(PingProber::new(Arc::new(LocalExecutor::new()), timeout)),
        ProbeMethod::Tcp => Arc::new(TcpProber::new(config.probe.tcp_port, timeout)),
    }
}
