//! Enqueue-time checks
//!
//! Everything here runs before a task touches the queue, so a rejected
//! request leaves no trace.

use chrono::{DateTime, Utc};

use crate::compat::ensure_compatible;
use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::machine::Machine;
use crate::task::{SYSTEM_REQUESTER, TaskAction};

/// Decide whether `requested_by` may queue `action` against `machine`
///
/// # Errors
/// `Validation` for requests incompatible with the machine's configuration or
/// current status, `Conflict` for reservation races
pub fn admit(
    machine: &Machine,
    action: &TaskAction,
    requested_by: &str,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    if requested_by.trim().is_empty() {
        return Err(CoreError::validation("requested_by must not be empty"));
    }
    let is_system = requested_by == SYSTEM_REQUESTER;

    if action.is_remote() {
        if machine.maintenance {
            return Err(CoreError::validation(format!(
                "machine {} is in maintenance",
                machine.id
            )));
        }
        if !is_system
            && let Some(reservation) = machine.active_reservation(now)
            && reservation.owner != requested_by
        {
            return Err(CoreError::validation(format!(
                "machine {} is reserved by {}",
                machine.id, reservation.owner
            )));
        }
    }

    match action {
        TaskAction::Provision { choice, system } => {
            if choice.trim().is_empty() {
                return Err(CoreError::validation("setup choice must not be empty"));
            }
            if !config.allows_setup_choice(machine.architecture, choice) {
                return Err(CoreError::validation(format!(
                    "setup choice {choice} is not available for {}",
                    machine.architecture
                )));
            }
            ensure_compatible(machine.architecture, system.unwrap_or(machine.system))
        }
        TaskAction::Reserve { until, .. } => {
            if until.is_some_and(|until| until <= now) {
                return Err(CoreError::validation("reservation end lies in the past"));
            }
            match machine.active_reservation(now) {
                Some(current) if current.owner != requested_by => Err(CoreError::conflict(
                    format!("machine {} is reserved by {}", machine.id, current.owner),
                )),
                _ => Ok(()),
            }
        }
        TaskAction::Release => match &machine.reservation {
            None => Err(CoreError::validation(format!(
                "machine {} is not reserved",
                machine.id
            ))),
            Some(current) if !is_system && current.owner != requested_by => {
                Err(CoreError::conflict(format!(
                    "machine {} is reserved by {}",
                    machine.id, current.owner
                )))
            }
            Some(_) => Ok(()),
        },
        TaskAction::Rescan if machine.maintenance => Err(CoreError::validation(format!(
            "machine {} is in maintenance",
            machine.id
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::compat::{Architecture, SystemClass};
    use crate::machine::Reservation;

    fn x86() -> Machine {
        Machine::new("m1", "m1.example.com", Architecture::X86_64, SystemClass::BareMetal).unwrap()
    }

    fn provision(choice: &str, system: Option<SystemClass>) -> TaskAction {
        TaskAction::Provision {
            choice: choice.into(),
            system,
        }
    }

    #[test]
    fn test_provision_on_embedded_as_kvm_is_rejected() {
        let switch = Machine::new(
            "sw1",
            "sw1.example.com",
            Architecture::Embedded,
            SystemClass::NetworkSwitch,
        )
        .unwrap();
        let err = admit(
            &switch,
            &provision("sles-16", Some(SystemClass::Kvm)),
            "alice",
            &EngineConfig::default(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_provision_setup_choices() {
        let mut config = EngineConfig::default();
        config
            .setup_choices
            .insert(Architecture::X86_64, vec!["sles-16".into()]);
        let now = Utc::now();
        assert!(admit(&x86(), &provision("sles-16", None), "alice", &config, now).is_ok());
        assert!(admit(&x86(), &provision("windows", None), "alice", &config, now).is_err());
        assert!(admit(&x86(), &provision("", None), "alice", &config, now).is_err());
        assert!(
            admit(&x86(), &provision("sles-16", Some(SystemClass::Xen)), "alice", &config, now)
                .is_ok()
        );
    }

    #[test]
    fn test_remote_action_on_machine_reserved_by_other() {
        let now = Utc::now();
        let mut m = x86();
        m.reservation = Some(Reservation::new("alice", ""));
        let config = EngineConfig::default();

        let err = admit(&m, &provision("sles-16", None), "bob", &config, now).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(admit(&m, &TaskAction::PowerCycle, "alice", &config, now).is_ok());
        assert!(admit(&m, &TaskAction::PowerCycle, SYSTEM_REQUESTER, &config, now).is_ok());
    }

    #[test]
    fn test_maintenance_blocks_remote_actions() {
        let m = x86().with_maintenance(true);
        let config = EngineConfig::default();
        assert!(admit(&m, &TaskAction::PowerOn, "alice", &config, Utc::now()).is_err());
        assert!(admit(&m, &TaskAction::Rescan, "alice", &config, Utc::now()).is_err());
        assert!(
            admit(
                &m,
                &TaskAction::SetMaintenance { enabled: false },
                "alice",
                &config,
                Utc::now()
            )
            .is_ok()
        );
    }

    #[test]
    fn test_reserve_rules() {
        let now = Utc::now();
        let config = EngineConfig::default();
        let reserve = |until| TaskAction::Reserve {
            reason: "bisect".into(),
            until,
        };

        assert!(admit(&x86(), &reserve(None), "bob", &config, now).is_ok());
        assert!(matches!(
            admit(&x86(), &reserve(Some(now - Duration::minutes(1))), "bob", &config, now),
            Err(CoreError::Validation(_))
        ));

        let mut m = x86();
        m.reservation = Some(Reservation::new("alice", ""));
        assert!(matches!(
            admit(&m, &reserve(None), "bob", &config, now),
            Err(CoreError::Conflict(_))
        ));
        assert!(admit(&m, &reserve(None), "alice", &config, now).is_ok());
    }

    #[test]
    fn test_release_rules() {
        let now = Utc::now();
        let config = EngineConfig::default();
        assert!(matches!(
            admit(&x86(), &TaskAction::Release, "alice", &config, now),
            Err(CoreError::Validation(_))
        ));

        let mut m = x86();
        m.reservation = Some(Reservation::new("alice", ""));
        assert!(matches!(
            admit(&m, &TaskAction::Release, "bob", &config, now),
            Err(CoreError::Conflict(_))
        ));
        assert!(admit(&m, &TaskAction::Release, "alice", &config, now).is_ok());
        assert!(admit(&m, &TaskAction::Release, SYSTEM_REQUESTER, &config, now).is_ok());
    }

    #[test]
    fn test_empty_requester() {
        assert!(
            admit(&x86(), &TaskAction::PowerOn, " ", &EngineConfig::default(), Utc::now())
                .is_err()
        );
    }
}
