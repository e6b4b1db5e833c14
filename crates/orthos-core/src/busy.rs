//! Per-machine exclusion between task workers and reachability checks
//!
//! The scheduler claims a machine for the whole life of a running task and
//! the reconciler claims it for each reachability check. Claims are
//! exclusive, so a check never overlaps an operation on the same machine and
//! a task never starts while its machine is being checked.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Machines currently claimed
#[derive(Debug, Default)]
pub struct BusyMachines {
    claimed: Mutex<HashSet<String>>,
}

impl BusyMachines {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `machine_id`; `None` if someone else holds it
    #[must_use]
    pub fn try_claim(self: &Arc<Self>, machine_id: &str) -> Option<MachineClaim> {
        self.lock().insert(machine_id.to_string()).then(|| MachineClaim {
            owner: Arc::clone(self),
            machine_id: machine_id.to_string(),
        })
    }

    #[must_use]
    pub fn is_busy(&self, machine_id: &str) -> bool {
        self.lock().contains(machine_id)
    }

    #[must_use]
    pub fn snapshot(&self) -> HashSet<String> {
        self.lock().clone()
    }
}

/// Exclusive hold on one machine, released on drop
#[derive(Debug)]
pub struct MachineClaim {
    owner: Arc<BusyMachines>,
    machine_id: String,
}

impl MachineClaim {
    #[must_use]
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }
}

impl Drop for MachineClaim {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.machine_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_are_exclusive() {
        let busy = BusyMachines::new();
        let claim = busy.try_claim("m1").unwrap();
        assert_eq!(claim.machine_id(), "m1");
        assert!(busy.try_claim("m1").is_none());
        assert!(busy.try_claim("m2").is_some());
        assert!(busy.is_busy("m1"));
    }

    #[test]
    fn test_drop_releases() {
        let busy = BusyMachines::new();
        let claim = busy.try_claim("m1").unwrap();
        let other = busy.try_claim("m2").unwrap();
        assert_eq!(busy.snapshot().len(), 2);

        drop(claim);
        assert!(!busy.is_busy("m1"));
        assert!(busy.try_claim("m1").is_some());
        drop(other);
        assert!(busy.snapshot().is_empty());
    }
}
