//! Configuration loading and types

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use orthos_core::{Architecture, EngineConfig, Machine, SystemClass};
use orthos_remote::{ConsoleCommands, ProvisionCommands};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the orthos daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub bmc: BmcConfig,
    /// Serial console concentrator; console actions fail without it
    #[serde(default)]
    pub console: Option<ConsoleConfig>,
    /// Provisioning server; provision actions fail without it
    #[serde(default)]
    pub provisioning: Option<ProvisioningConfig>,
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Inventory registered at startup
    #[serde(default)]
    pub machine: Vec<MachineEntry>,
}

/// Which halves of the process run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// HTTP surface only; every request goes to `taskmanager_url`
    Web,
    /// Owns the store and queue, dispatches and reconciles, and serves the
    /// API the web role forwards to
    Taskmanager,
    #[default]
    All,
}

impl Mode {
    /// Owns the store and queue and runs an engine
    #[must_use]
    pub fn runs_tasks(self) -> bool {
        matches!(self, Mode::Taskmanager | Mode::All)
    }

    /// Serves the interactive API docs at `/docs`
    #[must_use]
    pub fn serves_docs(self) -> bool {
        matches!(self, Mode::Web | Mode::All)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Web => "web",
            Mode::Taskmanager => "taskmanager",
            Mode::All => "all",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(Mode::Web),
            "taskmanager" => Ok(Mode::Taskmanager),
            "all" => Ok(Mode::All),
            other => eyre::bail!("unknown mode {other:?} (expected web, taskmanager or all)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Daemon server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub mode: Mode,
    /// Address and port to bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Snapshot file; no persistence when unset
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u64,
    /// Base URL of the taskmanager; required in web mode
    #[serde(default)]
    pub taskmanager_url: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            bind: default_bind(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            state_path: None,
            persist_interval_secs: default_persist_interval(),
            taskmanager_url: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_persist_interval() -> u64 {
    60
}

/// IPMI settings shared by every BMC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmcConfig {
    #[serde(default = "default_bmc_user")]
    pub user: String,
    /// Environment variable holding the BMC password
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for BmcConfig {
    fn default() -> Self {
        Self {
            user: default_bmc_user(),
            password_env: default_password_env(),
            interface: default_interface(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl BmcConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn default_bmc_user() -> String {
    "ADMIN".to_string()
}

fn default_password_env() -> String {
    "ORTHOS_BMC_PASSWORD".to_string()
}

fn default_interface() -> String {
    "lanplus".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

/// A management host reached over SSH
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementHost {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Private key file
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    /// Environment variable holding a base64-encoded private key
    #[serde(default)]
    pub ssh_key_env: Option<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl ManagementHost {
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.host == "localhost" || self.host == "127.0.0.1"
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(flatten)]
    pub host: ManagementHost,
    #[serde(default)]
    pub commands: ConsoleCommands,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(flatten)]
    pub host: ManagementHost,
    #[serde(default)]
    pub commands: ProvisionCommands,
    /// Power-cycle into the installer once the profile is set
    #[serde(default = "default_true")]
    pub reboot_after_setup: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    #[default]
    Ping,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub method: ProbeMethod,
    #[serde(default = "default_ssh_port")]
    pub tcp_port: u16,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            method: ProbeMethod::default(),
            tcp_port: default_ssh_port(),
        }
    }
}

/// `[[machine]]` inventory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineEntry {
    pub id: String,
    pub fqdn: String,
    pub architecture: String,
    pub system: String,
    #[serde(default)]
    pub bmc: Option<String>,
    #[serde(default)]
    pub maintenance: bool,
}

impl MachineEntry {
    /// # Errors
    /// Returns an error for unknown names or an incompatible pair
    pub fn to_machine(&self) -> eyre::Result<Machine> {
        let architecture: Architecture = self.architecture.parse()?;
        let system: SystemClass = self.system.parse()?;
        let mut machine = Machine::new(&self.id, &self.fqdn, architecture, system)?
            .with_maintenance(self.maintenance);
        if let Some(bmc) = &self.bmc {
            machine = machine.with_bmc(bmc);
        }
        Ok(machine)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// First config file that exists, `ORTHOS_CONFIG` taking precedence
    #[must_use]
    pub fn locate() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("ORTHOS_CONFIG") {
            return Some(PathBuf::from(path));
        }

        let mut paths = vec![
            PathBuf::from("orthos.toml"),
            PathBuf::from("/etc/orthos/orthos.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("orthos/orthos.toml"));
        }
        paths.into_iter().find(|p| p.exists())
    }

    /// Apply `ORTHOS_MODE`, `ORTHOS_BIND`, `ORTHOS_STATE_PATH` and
    /// `ORTHOS_TASKMANAGER_URL`
    ///
    /// # Errors
    /// Returns an error for an unknown mode
    pub fn apply_env(&mut self) -> eyre::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> eyre::Result<()> {
        if let Some(mode) = lookup("ORTHOS_MODE") {
            self.daemon.mode = mode.parse()?;
        }
        if let Some(bind) = lookup("ORTHOS_BIND") {
            self.daemon.bind = bind;
        }
        if let Some(path) = lookup("ORTHOS_STATE_PATH") {
            self.daemon.state_path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("ORTHOS_TASKMANAGER_URL") {
            self.daemon.taskmanager_url = Some(url);
        }
        Ok(())
    }

    /// Where the web role sends its requests
    ///
    /// # Errors
    /// Returns an error if `taskmanager_url` is unset
    pub fn taskmanager_url(&self) -> eyre::Result<&str> {
        self.daemon
            .taskmanager_url
            .as_deref()
            .ok_or_else(|| eyre::eyre!("mode = \"web\" needs daemon.taskmanager_url"))
    }

    /// Engine settings with the role switches set from the mode
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = self.engine.clone();
        engine.dispatch_enabled = self.daemon.mode.runs_tasks();
        engine.reconcile_enabled = self.daemon.mode.runs_tasks();
        engine
    }

    #[must_use]
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.persist_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SAMPLE: &str = r#"
[daemon]
mode = "web"
bind = "0.0.0.0:9000"
log_format = "json"
state_path = "/var/lib/orthos/state.json"

[engine]
worker_pool_size = 2
max_attempts = 3

[engine.setup_choices]
x86_64 = ["sles-16", "tumbleweed"]

[bmc]
user = "operator"
password_env = "LAB_IPMI_PASSWORD"

[console]
host = "console.lab.example.com"
ssh_key_env = "CONSOLE_KEY"

[provisioning]
host = "cobbler.lab.example.com"
reboot_after_setup = false

[provisioning.commands]
lookup = "cobbler system find --name={fqdn}"
setup = "cobbler system edit --name={fqdn} --profile={choice}"

[probe]
method = "tcp"
tcp_port = 2222

[[machine]]
id = "lab-001"
fqdn = "lab-001.example.com"
architecture = "s390x"
system = "lpar_zseries"

[[machine]]
id = "lab-002"
fqdn = "lab-002.example.com"
architecture = "x86_64"
system = "BareMetal"
bmc = "lab-002-sp.example.com"
maintenance = true
"#;

    #[test]
    fn test_full_config_parses() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.daemon.mode, Mode::Web);
        assert_eq!(config.daemon.log_format, LogFormat::Json);
        assert_eq!(config.daemon.persist_interval_secs, 60);
        assert_eq!(config.engine.worker_pool_size, 2);
        assert_eq!(config.engine.initial_backoff_ms, 500);
        assert!(config.engine.allows_setup_choice(Architecture::X86_64, "sles-16"));
        assert!(!config.engine.allows_setup_choice(Architecture::X86_64, "windows"));
        assert_eq!(config.bmc.user, "operator");
        assert_eq!(config.bmc.interface, "lanplus");

        let console = config.console.unwrap();
        assert_eq!(console.host.port, 22);
        assert_eq!(console.host.ssh_key_env.as_deref(), Some("CONSOLE_KEY"));

        let provisioning = config.provisioning.unwrap();
        assert!(!provisioning.reboot_after_setup);
        assert!(!provisioning.commands.setup.contains("netboot"));

        assert_eq!(config.probe.method, ProbeMethod::Tcp);
        assert_eq!(config.probe.tcp_port, 2222);
        assert_eq!(config.machine.len(), 2);
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.daemon.mode, Mode::All);
        assert_eq!(config.daemon.bind, "127.0.0.1:8080");
        assert!(config.daemon.state_path.is_none());
        assert!(config.console.is_none());
        assert!(config.provisioning.is_none());
        assert_eq!(config.probe.method, ProbeMethod::Ping);
        assert_eq!(config.engine.max_attempts, 5);
    }

    #[test]
    fn test_machine_entries_are_validated() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let zseries = config.machine[0].to_machine().unwrap();
        assert_eq!(zseries.system, SystemClass::LparZSeries);
        let x86 = config.machine[1].to_machine().unwrap();
        assert!(x86.maintenance);
        assert!(x86.has_remote_power());

        let bad = MachineEntry {
            id: "m".to_string(),
            fqdn: "m.example.com".to_string(),
            architecture: "embedded".to_string(),
            system: "KVM".to_string(),
            bmc: None,
            maintenance: false,
        };
        assert!(bad.to_machine().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("ORTHOS_MODE", "taskmanager"),
            ("ORTHOS_BIND", "[::]:8081"),
            ("ORTHOS_STATE_PATH", "/tmp/orthos.json"),
            ("ORTHOS_TASKMANAGER_URL", "http://tm.lab:8081"),
        ]
        .into_iter()
        .collect();
        config
            .apply_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.daemon.mode, Mode::Taskmanager);
        assert_eq!(config.daemon.bind, "[::]:8081");
        assert_eq!(
            config.daemon.state_path.as_deref(),
            Some(Path::new("/tmp/orthos.json"))
        );
        assert_eq!(config.taskmanager_url().unwrap(), "http://tm.lab:8081");

        let mut config = Config::default();
        assert!(
            config
                .apply_overrides(|key| (key == "ORTHOS_MODE").then(|| "both".to_string()))
                .is_err()
        );
    }

    #[test]
    fn test_mode_drives_engine_roles() {
        let mut config = Config::default();
        config.daemon.mode = Mode::Web;
        let engine = config.engine_config();
        assert!(!engine.dispatch_enabled);
        assert!(!engine.reconcile_enabled);

        config.daemon.mode = Mode::Taskmanager;
        assert!(config.engine_config().dispatch_enabled);
        assert!(!Mode::Taskmanager.serves_docs());
        assert!(Mode::All.serves_docs() && Mode::All.runs_tasks());
        assert!(!Mode::Web.runs_tasks());
    }

    #[test]
    fn test_web_mode_needs_taskmanager_url() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.daemon.mode, Mode::Web);
        assert!(config.taskmanager_url().is_err());

        let config: Config = toml::from_str(
            r#"
[daemon]
mode = "web"
taskmanager_url = "http://tm.lab:8081"
"#,
        )
        .unwrap();
        assert_eq!(config.taskmanager_url().unwrap(), "http://tm.lab:8081");
    }
}
