//! Engine tuning

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compat::Architecture;
use crate::retry::{Backoff, RetryPolicy};

/// Scheduler and reconciler settings, the `[engine]` config section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tasks running at once across the fleet
    pub worker_pool_size: usize,
    /// Total attempts for a task that keeps failing transiently
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound on a single adapter call
    pub operation_timeout_secs: u64,
    pub dispatch_tick_ms: u64,
    pub reconcile_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_concurrency: usize,
    pub event_channel_capacity: usize,
    /// Finished tasks kept for inspection
    pub task_retention: usize,
    /// Allowed provisioning profiles per architecture; architectures without
    /// an entry accept any profile
    pub setup_choices: HashMap<Architecture, Vec<String>>,
    /// Dispatch queued tasks (off for the web role)
    #[serde(skip)]
    pub dispatch_enabled: bool,
    /// Run periodic sweeps (off for the web role)
    #[serde(skip)]
    pub reconcile_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            operation_timeout_secs: 300,
            dispatch_tick_ms: 1000,
            reconcile_interval_secs: 300,
            probe_timeout_secs: 5,
            probe_concurrency: 32,
            event_channel_capacity: 1024,
            task_retention: 10_000,
            setup_choices: HashMap::new(),
            dispatch_enabled: true,
            reconcile_enabled: true,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Backoff::Exponential {
                initial: Duration::from_millis(self.initial_backoff_ms),
                max: Duration::from_millis(self.max_backoff_ms),
            },
        )
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    #[must_use]
    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms.max(1))
    }

    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Whether `choice` may be provisioned on `architecture`
    #[must_use]
    pub fn allows_setup_choice(&self, architecture: Architecture, choice: &str) -> bool {
        self.setup_choices
            .get(&architecture)
            .is_none_or(|choices| choices.iter().any(|c| c == choice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.operation_timeout(), Duration::from_secs(300));
        assert!(config.dispatch_enabled);
    }

    #[test]
    fn test_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            max_attempts = 3

            [setup_choices]
            x86_64 = ["sles-16", "tumbleweed"]
            "#,
        )
        .unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.probe_concurrency, 32);
        assert!(config.allows_setup_choice(Architecture::X86_64, "tumbleweed"));
        assert!(!config.allows_setup_choice(Architecture::X86_64, "windows"));
        assert!(config.allows_setup_choice(Architecture::S390x, "anything"));
        assert!(config.dispatch_enabled);
    }
}
