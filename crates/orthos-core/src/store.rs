//! Machine State Store
//!
//! The single source of truth for machine records. Each record sits behind
//! its own mutex, so mutations of different machines never contend and a
//! reader never observes a half-applied update: every mutation is validated
//! before the first field changes, and all fields change under the record's
//! lock. No lock is held across adapter I/O.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use orthos_api::events::FleetEvent;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info};

use crate::compat::{Architecture, SystemClass, ensure_compatible};
use crate::error::CoreError;
use crate::machine::{
    Machine, MachineFilter, MachineStatus, ProbeResult, Reservation, ReservationRecord,
};

/// Per-architecture counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchitectureCounts {
    pub total: u64,
    pub free: u64,
    pub reachable: u64,
    /// Reserved without an expiry date
    pub reserved_unlimited: u64,
}

impl ArchitectureCounts {
    fn count(&mut self, machine: &Machine, now: DateTime<Utc>) {
        self.total += 1;
        if machine.is_free(now) {
            self.free += 1;
        }
        if machine.status == MachineStatus::Reachable {
            self.reachable += 1;
        }
        if machine
            .active_reservation(now)
            .is_some_and(|r| r.until.is_none())
        {
            self.reserved_unlimited += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetStatistics {
    /// Sorted by architecture
    pub per_architecture: Vec<(Architecture, ArchitectureCounts)>,
    pub total: ArchitectureCounts,
}

pub struct MachineStore {
    machines: RwLock<HashMap<String, Arc<Mutex<Machine>>>>,
    history: Mutex<HashMap<String, Vec<ReservationRecord>>>,
    events: broadcast::Sender<FleetEvent>,
}

impl std::fmt::Debug for MachineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineStore")
            .field("subscribers", &self.events.receiver_count())
            .finish_non_exhaustive()
    }
}

impl MachineStore {
    #[must_use]
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            machines: RwLock::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Rebuild from persisted records
    ///
    /// # Errors
    /// Returns `CoreError::Validation` if any record breaks the machine
    /// invariants, or `MachineExists` on duplicate ids
    pub fn restore(
        machines: Vec<Machine>,
        history: HashMap<String, Vec<ReservationRecord>>,
        event_capacity: usize,
    ) -> Result<Self, CoreError> {
        let mut map = HashMap::new();
        for machine in machines {
            machine.validate()?;
            if map.contains_key(&machine.id) {
                return Err(CoreError::MachineExists(machine.id));
            }
            map.insert(machine.id.clone(), Arc::new(Mutex::new(machine)));
        }
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Ok(Self {
            machines: RwLock::new(map),
            history: Mutex::new(history),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Sender shared with the scheduler for task events
    #[must_use]
    pub fn event_sender(&self) -> broadcast::Sender<FleetEvent> {
        self.events.clone()
    }

    /// Add a machine from inventory
    ///
    /// # Errors
    /// `Validation` if the record is invalid, `MachineExists` if the id is taken
    pub async fn register(&self, machine: Machine) -> Result<(), CoreError> {
        machine.validate()?;
        let mut machines = self.machines.write().await;
        if machines.contains_key(&machine.id) {
            return Err(CoreError::MachineExists(machine.id));
        }
        info!(
            machine = %machine.id,
            arch = %machine.architecture,
            system = %machine.system,
            "Registered machine"
        );
        machines.insert(machine.id.clone(), Arc::new(Mutex::new(machine)));
        Ok(())
    }

    /// Snapshot of one machine
    ///
    /// # Errors
    /// `MachineNotFound`
    pub async fn get(&self, id: &str) -> Result<Machine, CoreError> {
        let entry = self.entry(id).await?;
        let machine = entry.lock().await;
        Ok(machine.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.machines.read().await.contains_key(id)
    }

    /// Matching machines sorted by id
    pub async fn list(&self, filter: &MachineFilter) -> Vec<Machine> {
        let now = Utc::now();
        let mut out = Vec::new();
        for entry in self.entries().await {
            let machine = entry.lock().await;
            if filter.matches(&machine, now) {
                out.push(machine.clone());
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Record a reachability status observed at `probed_at`
    ///
    /// Last writer wins by probe time: a result older than the one already
    /// recorded is discarded. Machines in maintenance keep their status.
    /// Returns whether the update was applied.
    ///
    /// # Errors
    /// `MachineNotFound`, or `Validation` for a status a probe cannot report
    pub async fn update_status(
        &self,
        id: &str,
        status: MachineStatus,
        probed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.apply_probe(id, status, probed_at, None).await
    }

    /// [`update_status`](Self::update_status) carrying the probe detail
    ///
    /// # Errors
    /// `MachineNotFound`
    pub async fn record_probe(&self, probe: &ProbeResult) -> Result<bool, CoreError> {
        self.apply_probe(
            &probe.machine_id,
            probe.status(),
            probe.probed_at,
            probe.detail.clone(),
        )
        .await
    }

    async fn apply_probe(
        &self,
        id: &str,
        status: MachineStatus,
        probed_at: DateTime<Utc>,
        detail: Option<String>,
    ) -> Result<bool, CoreError> {
        if !status.is_probe_status() {
            return Err(CoreError::validation(format!(
                "{status} cannot be set from a probe"
            )));
        }
        let entry = self.entry(id).await?;
        let mut machine = entry.lock().await;
        if machine.maintenance {
            debug!(machine = %id, "Ignoring probe for machine in maintenance");
            return Ok(false);
        }
        if machine.last_probed.is_some_and(|last| last > probed_at) {
            debug!(machine = %id, %probed_at, "Discarding stale probe result");
            return Ok(false);
        }
        let previous = machine.status;
        machine.status = status;
        machine.last_probed = Some(probed_at);
        machine.last_probe_detail = detail;
        drop(machine);

        if previous != status {
            info!(machine = %id, from = %previous, to = %status, "Machine status changed");
            self.emit(FleetEvent::MachineStatusChanged {
                machine: id.to_string(),
                from: previous.to_string(),
                to: status.to_string(),
            });
        }
        Ok(true)
    }

    /// Set or clear the reservation holder
    ///
    /// Setting fails with `Conflict` while a different user holds an active
    /// reservation; an expired one is archived and replaced. Clearing archives
    /// the current reservation to the machine's history.
    ///
    /// # Errors
    /// `MachineNotFound` or `Conflict`
    pub async fn set_reservation(
        &self,
        id: &str,
        reservation: Option<Reservation>,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        let entry = self.entry(id).await?;
        let mut machine = entry.lock().await;

        if let Some(new) = &reservation
            && let Some(current) = machine.active_reservation(now)
            && current.owner != new.owner
        {
            return Err(CoreError::conflict(format!(
                "machine {id} is reserved by {}",
                current.owner
            )));
        }

        let owner = reservation.as_ref().map(|r| r.owner.clone());
        let replaced = std::mem::replace(&mut machine.reservation, reservation);
        // Archive under the record lock
        if let Some(old) = replaced
            && owner.as_deref() != Some(old.owner.as_str())
        {
            self.history
                .lock()
                .await
                .entry(id.to_string())
                .or_default()
                .push(ReservationRecord::released(old, now));
        }
        drop(machine);

        info!(machine = %id, owner = ?owner, "Reservation changed");
        self.emit(FleetEvent::ReservationChanged {
            machine: id.to_string(),
            owner,
        });
        Ok(())
    }

    /// Enter or leave maintenance
    ///
    /// # Errors
    /// `MachineNotFound`
    pub async fn set_maintenance(&self, id: &str, enabled: bool) -> Result<(), CoreError> {
        let now = Utc::now();
        let entry = self.entry(id).await?;
        let mut machine = entry.lock().await;
        let previous = machine.effective_status(now);
        machine.maintenance = enabled;
        if !enabled {
            // Reachability is unknown until the next probe
            machine.status = MachineStatus::Unknown;
        }
        let current = machine.effective_status(now);
        drop(machine);

        if previous != current {
            self.emit(FleetEvent::MachineStatusChanged {
                machine: id.to_string(),
                from: previous.to_string(),
                to: current.to_string(),
            });
        }
        Ok(())
    }

    /// Change the system class, validated against the architecture
    ///
    /// # Errors
    /// `MachineNotFound` or `Validation`
    pub async fn update_system(&self, id: &str, system: SystemClass) -> Result<(), CoreError> {
        let entry = self.entry(id).await?;
        let mut machine = entry.lock().await;
        ensure_compatible(machine.architecture, system)?;
        info!(machine = %id, from = %machine.system, to = %system, "System class changed");
        machine.system = system;
        Ok(())
    }

    /// Stamp a successful remote action
    ///
    /// # Errors
    /// `MachineNotFound`
    pub async fn record_action_success(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let entry = self.entry(id).await?;
        entry.lock().await.last_successful_action = Some(at);
        Ok(())
    }

    /// Past reservations, oldest first
    ///
    /// # Errors
    /// `MachineNotFound`
    pub async fn reservation_history(&self, id: &str) -> Result<Vec<ReservationRecord>, CoreError> {
        if !self.contains(id).await {
            return Err(CoreError::MachineNotFound(id.to_string()));
        }
        Ok(self
            .history
            .lock()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    /// Machines whose reservation ran out before `now`
    pub async fn expired_reservations(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired = Vec::new();
        for entry in self.entries().await {
            let machine = entry.lock().await;
            if machine.reservation.as_ref().is_some_and(|r| r.is_expired(now)) {
                expired.push(machine.id.clone());
            }
        }
        expired.sort();
        expired
    }

    pub async fn statistics(&self) -> FleetStatistics {
        let now = Utc::now();
        let mut per_arch: HashMap<Architecture, ArchitectureCounts> = HashMap::new();
        let mut total = ArchitectureCounts::default();
        for entry in self.entries().await {
            let machine = entry.lock().await;
            per_arch
                .entry(machine.architecture)
                .or_default()
                .count(&machine, now);
            total.count(&machine, now);
        }
        let mut per_architecture: Vec<_> = per_arch.into_iter().collect();
        per_architecture.sort_by_key(|(arch, _)| *arch);
        FleetStatistics {
            per_architecture,
            total,
        }
    }

    /// All records and history, for persistence
    pub async fn snapshot(&self) -> (Vec<Machine>, HashMap<String, Vec<ReservationRecord>>) {
        let machines = self.list(&MachineFilter::default()).await;
        let history = self.history.lock().await.clone();
        (machines, history)
    }

    fn emit(&self, event: FleetEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn entry(&self, id: &str) -> Result<Arc<Mutex<Machine>>, CoreError> {
        self.machines
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::MachineNotFound(id.to_string()))
    }

    async fn entries(&self) -> Vec<Arc<Mutex<Machine>>> {
        self.machines.read().await.values().cloned().collect()
    }
}
