//! Machine records, reservations and probe results

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use orthos_remote::Target;
use serde::{Deserialize, Serialize};

use crate::compat::{Architecture, SystemClass, ensure_compatible};
use crate::error::CoreError;

/// Machine status as reported to collaborators
///
/// Only `Unknown`, `Reachable` and `Unreachable` are stored; `Reserved` and
/// `InMaintenance` are derived from the reservation and maintenance fields in
/// [`Machine::effective_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
    Reserved,
    InMaintenance,
}

impl MachineStatus {
    /// Whether the Reconciler may write this value
    #[must_use]
    pub fn is_probe_status(&self) -> bool {
        matches!(
            self,
            MachineStatus::Unknown | MachineStatus::Reachable | MachineStatus::Unreachable
        )
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineStatus::Unknown => "unknown",
            MachineStatus::Reachable => "reachable",
            MachineStatus::Unreachable => "unreachable",
            MachineStatus::Reserved => "reserved",
            MachineStatus::InMaintenance => "in_maintenance",
        };
        f.write_str(name)
    }
}

impl FromStr for MachineStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => Ok(MachineStatus::Unknown),
            "reachable" => Ok(MachineStatus::Reachable),
            "unreachable" => Ok(MachineStatus::Unreachable),
            "reserved" => Ok(MachineStatus::Reserved),
            "in_maintenance" | "maintenance" => Ok(MachineStatus::InMaintenance),
            other => Err(CoreError::validation(format!(
                "unknown machine status: {other}"
            ))),
        }
    }
}

/// Exclusive claim by a user over a machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub owner: String,
    pub reason: String,
    pub reserved_at: DateTime<Utc>,
    /// `None` means reserved without expiry
    pub until: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn new(owner: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            reason: reason.into(),
            reserved_at: Utc::now(),
            until: None,
        }
    }

    #[must_use]
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.until.is_none_or(|until| until > now)
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_active(now)
    }
}

/// Archived reservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub owner: String,
    pub reason: String,
    pub reserved_at: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
    pub released_at: DateTime<Utc>,
}

impl ReservationRecord {
    #[must_use]
    pub fn released(reservation: Reservation, released_at: DateTime<Utc>) -> Self {
        Self {
            owner: reservation.owner,
            reason: reservation.reason,
            reserved_at: reservation.reserved_at,
            until: reservation.until,
            released_at,
        }
    }
}

/// Latest reachability probe of a machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub machine_id: String,
    pub reachable: bool,
    pub probed_at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl ProbeResult {
    #[must_use]
    pub fn status(&self) -> MachineStatus {
        if self.reachable {
            MachineStatus::Reachable
        } else {
            MachineStatus::Unreachable
        }
    }
}

/// A managed machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub fqdn: String,
    pub architecture: Architecture,
    pub system: SystemClass,
    /// BMC address; `None` means no remote power
    #[serde(default)]
    pub bmc: Option<String>,
    #[serde(default)]
    pub status: MachineStatus,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default)]
    pub reservation: Option<Reservation>,
    #[serde(default)]
    pub last_probed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_probe_detail: Option<String>,
    #[serde(default)]
    pub last_successful_action: Option<DateTime<Utc>>,
}

impl Machine {
    /// Create a machine record
    ///
    /// # Errors
    /// Returns `CoreError::Validation` if the system class is not allowed on
    /// the architecture or the identity is empty
    pub fn new(
        id: impl Into<String>,
        fqdn: impl Into<String>,
        architecture: Architecture,
        system: SystemClass,
    ) -> Result<Self, CoreError> {
        let machine = Self {
            id: id.into(),
            fqdn: fqdn.into(),
            architecture,
            system,
            bmc: None,
            status: MachineStatus::Unknown,
            maintenance: false,
            reservation: None,
            last_probed: None,
            last_probe_detail: None,
            last_successful_action: None,
        };
        machine.validate()?;
        Ok(machine)
    }

    #[must_use]
    pub fn with_bmc(mut self, bmc: impl Into<String>) -> Self {
        self.bmc = Some(bmc.into());
        self
    }

    #[must_use]
    pub fn with_maintenance(mut self, maintenance: bool) -> Self {
        self.maintenance = maintenance;
        self
    }

    /// Check the record invariants
    ///
    /// # Errors
    /// Returns `CoreError::Validation` describing the first violation
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.trim().is_empty() {
            return Err(CoreError::validation("machine id must not be empty"));
        }
        if self.fqdn.trim().is_empty() {
            return Err(CoreError::validation("machine fqdn must not be empty"));
        }
        if !self.status.is_probe_status() {
            return Err(CoreError::validation(format!(
                "stored status must come from a probe, got {}",
                self.status
            )));
        }
        ensure_compatible(self.architecture, self.system)
    }

    #[must_use]
    pub fn has_remote_power(&self) -> bool {
        self.bmc.is_some()
    }

    /// Reservation that has not expired at `now`
    #[must_use]
    pub fn active_reservation(&self, now: DateTime<Utc>) -> Option<&Reservation> {
        self.reservation.as_ref().filter(|r| r.is_active(now))
    }

    #[must_use]
    pub fn is_reserved_by_other(&self, user: &str, now: DateTime<Utc>) -> bool {
        self.active_reservation(now).is_some_and(|r| r.owner != user)
    }

    /// Neither reserved nor in maintenance
    #[must_use]
    pub fn is_free(&self, now: DateTime<Utc>) -> bool {
        !self.maintenance && self.active_reservation(now).is_none()
    }

    /// Status with maintenance and reservation folded in
    #[must_use]
    pub fn effective_status(&self, now: DateTime<Utc>) -> MachineStatus {
        if self.maintenance {
            MachineStatus::InMaintenance
        } else if self.active_reservation(now).is_some() {
            MachineStatus::Reserved
        } else {
            self.status
        }
    }

    #[must_use]
    pub fn target(&self) -> Target {
        let target =
            Target::new(&self.id, &self.fqdn).with_architecture(self.architecture.as_str());
        match &self.bmc {
            Some(bmc) => target.with_bmc(bmc),
            None => target,
        }
    }
}

/// Criteria for `MachineStore::list`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineFilter {
    pub architecture: Option<Architecture>,
    /// Compared against the effective status
    pub status: Option<MachineStatus>,
    pub reserved_by: Option<String>,
    pub free_only: bool,
    /// Case-insensitive fqdn substring
    pub query: Option<String>,
}

impl MachineFilter {
    #[must_use]
    pub fn matches(&self, machine: &Machine, now: DateTime<Utc>) -> bool {
        if self.architecture.is_some_and(|arch| arch != machine.architecture) {
            return false;
        }
        if self
            .status
            .is_some_and(|status| status != machine.effective_status(now))
        {
            return false;
        }
        if let Some(owner) = &self.reserved_by
            && machine.active_reservation(now).is_none_or(|r| &r.owner != owner)
        {
            return false;
        }
        if self.free_only && !machine.is_free(now) {
            return false;
        }
        if let Some(query) = &self.query
            && !machine
                .fqdn
                .to_ascii_lowercase()
                .contains(&query.to_ascii_lowercase())
        {
            return false;
        }
        true
    }
}
