//! What adapters are asked to do and what they report back

use std::fmt;

use serde::{Deserialize, Serialize};

/// Out-of-band channel an action travels over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Power,
    Console,
    Provision,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Power => "power",
            Channel::Console => "console",
            Channel::Provision => "provision",
        };
        f.write_str(name)
    }
}

/// Operation performed by an adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAction {
    PowerOn,
    PowerOff,
    PowerCycle,
    ConsoleAttach,
    Provision { choice: String },
}

impl RemoteAction {
    #[must_use]
    pub fn channel(&self) -> Channel {
        match self {
            RemoteAction::PowerOn | RemoteAction::PowerOff | RemoteAction::PowerCycle => {
                Channel::Power
            }
            RemoteAction::ConsoleAttach => Channel::Console,
            RemoteAction::Provision { .. } => Channel::Provision,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RemoteAction::PowerOn => "power_on",
            RemoteAction::PowerOff => "power_off",
            RemoteAction::PowerCycle => "power_cycle",
            RemoteAction::ConsoleAttach => "console_attach",
            RemoteAction::Provision { .. } => "provision",
        }
    }
}

/// What an adapter needs to know about the machine it acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub machine_id: String,
    pub fqdn: String,
    pub architecture: String,
    /// BMC hostname, `None` when the machine has no remote power
    pub bmc: Option<String>,
}

impl Target {
    pub fn new(machine_id: impl Into<String>, fqdn: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            fqdn: fqdn.into(),
            architecture: String::new(),
            bmc: None,
        }
    }

    #[must_use]
    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    #[must_use]
    pub fn with_bmc(mut self, bmc: impl Into<String>) -> Self {
        self.bmc = Some(bmc.into());
        self
    }
}

/// Classified result of one adapter call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { detail: Option<String> },
    /// Retrying later may succeed (timeout, device busy, boot in progress)
    TransientFailure { reason: String },
    /// Retrying will not help (auth rejected, unsupported, invalid state)
    PermanentFailure { reason: String },
}

impl Outcome {
    #[must_use]
    pub fn success() -> Self {
        Outcome::Success { detail: None }
    }

    pub fn success_with(detail: impl Into<String>) -> Self {
        Outcome::Success {
            detail: Some(detail.into()),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Outcome::TransientFailure {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Outcome::PermanentFailure {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Failure reason, if any
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::TransientFailure { reason } | Outcome::PermanentFailure { reason } => {
                Some(reason)
            }
        }
    }
}

/// Result of a single reachability probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub detail: Option<String>,
}

impl ProbeOutcome {
    #[must_use]
    pub fn reachable() -> Self {
        Self {
            reachable: true,
            detail: None,
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            detail: Some(detail.into()),
        }
    }
}
