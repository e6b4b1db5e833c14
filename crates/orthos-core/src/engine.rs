//! Collaborator-facing engine surface
//!
//! Wires the store, the scheduler and the reconciler together and exposes the
//! operations the web layer needs: enqueue, status lookup, cancellation and
//! configuration validation, plus listing and snapshot helpers.

use std::sync::Arc;

use kameo::actor::ActorRef;
use kameo::prelude::*;
use orthos_api::events::FleetEvent;
use orthos_remote::{AdapterRegistry, Prober};
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::actor::flatten_send_error;
use crate::actor::reconciler::{ReconcilerActor, ReconcilerArgs};
use crate::actor::scheduler::{SchedulerActor, SchedulerArgs};
use crate::busy::BusyMachines;
use crate::compat::{self, SystemClass};
use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::machine::{Machine, MachineFilter, ProbeResult, ReservationRecord};
use crate::message::{
    CancelOutcome, CancelTask, EnqueueTask, GetTask, ListTasks, ProbeMachine, SnapshotTasks,
    Sweep, SweepReport,
};
use crate::persist::EngineSnapshot;
use crate::store::{FleetStatistics, MachineStore};
use crate::task::{Task, TaskAction, TaskFilter, TaskId};

/// Everything the engine needs to start
pub struct EngineArgs {
    pub config: EngineConfig,
    pub store: Arc<MachineStore>,
    pub adapters: AdapterRegistry,
    pub prober: Arc<dyn Prober>,
    /// Queue contents from a snapshot
    pub restored_tasks: Vec<Task>,
}

/// Handle to a running engine; cheap to clone
#[derive(Clone)]
pub struct Engine {
    store: Arc<MachineStore>,
    scheduler: ActorRef<SchedulerActor>,
    reconciler: ActorRef<ReconcilerActor>,
    config: Arc<EngineConfig>,
}

impl Engine {
    /// Spawn the scheduler and reconciler actors
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(args: EngineArgs) -> Self {
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        let busy = BusyMachines::new();

        let scheduler = SchedulerActor::spawn(SchedulerArgs {
            store: args.store.clone(),
            adapters: args.adapters,
            config: args.config.clone(),
            busy: busy.clone(),
            probes: Some(probe_tx),
            restored: args.restored_tasks,
        });

        let reconciler = ReconcilerActor::spawn(ReconcilerArgs {
            store: args.store.clone(),
            prober: args.prober,
            scheduler: scheduler.clone(),
            busy,
            probe_requests: Some(probe_rx),
            interval: args.config.reconcile_interval(),
            probe_timeout: args.config.probe_timeout(),
            probe_concurrency: args.config.probe_concurrency,
            periodic: args.config.reconcile_enabled,
        });

        info!(
            dispatch = args.config.dispatch_enabled,
            reconcile = args.config.reconcile_enabled,
            "Engine started"
        );

        Self {
            store: args.store,
            scheduler,
            reconciler,
            config: Arc::new(args.config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MachineStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.store.subscribe()
    }

    /// `IsCompatible` on free-form names, for form-level pre-checks
    #[must_use]
    pub fn validate_configuration(architecture: &str, system: &str) -> bool {
        compat::validate_configuration(architecture, system)
    }

    /// # Errors
    /// `Validation` or `MachineExists`
    pub async fn register_machine(&self, machine: Machine) -> Result<(), CoreError> {
        self.store.register(machine).await
    }

    /// # Errors
    /// `MachineNotFound` or `Validation`
    pub async fn update_system(
        &self,
        machine_id: &str,
        system: SystemClass,
    ) -> Result<(), CoreError> {
        self.store.update_system(machine_id, system).await
    }

    /// Queue an action; rejected requests never reach the queue
    ///
    /// # Errors
    /// `MachineNotFound`, `Validation` or `Conflict`
    pub async fn enqueue_task(
        &self,
        machine_id: &str,
        action: TaskAction,
        requested_by: &str,
    ) -> Result<TaskId, CoreError> {
        self.scheduler
            .ask(EnqueueTask {
                machine_id: machine_id.to_string(),
                action,
                requested_by: requested_by.to_string(),
            })
            .await
            .map_err(flatten_send_error)
    }

    /// Read-only machine snapshot
    ///
    /// # Errors
    /// `MachineNotFound`
    pub async fn get_machine_status(&self, machine_id: &str) -> Result<Machine, CoreError> {
        self.store.get(machine_id).await
    }

    /// Best-effort cancellation
    ///
    /// # Errors
    /// `TaskNotFound`
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<CancelOutcome, CoreError> {
        self.scheduler
            .ask(CancelTask { task_id })
            .await
            .map_err(flatten_send_error)
    }

    /// # Errors
    /// `TaskNotFound`
    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, CoreError> {
        self.scheduler
            .ask(GetTask { task_id })
            .await
            .map_err(flatten_send_error)
    }

    /// # Errors
    /// `ActorError` if the scheduler is gone
    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, CoreError> {
        self.scheduler
            .ask(ListTasks { filter })
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }

    pub async fn list_machines(&self, filter: &MachineFilter) -> Vec<Machine> {
        self.store.list(filter).await
    }

    /// # Errors
    /// `MachineNotFound`
    pub async fn reservation_history(
        &self,
        machine_id: &str,
    ) -> Result<Vec<ReservationRecord>, CoreError> {
        self.store.reservation_history(machine_id).await
    }

    pub async fn statistics(&self) -> FleetStatistics {
        self.store.statistics().await
    }

    /// Run a reconciliation sweep now
    ///
    /// # Errors
    /// `ActorError` if the reconciler is gone
    pub async fn sweep_now(&self) -> Result<SweepReport, CoreError> {
        self.reconciler
            .ask(Sweep)
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))
    }

    /// Probe one machine now, bypassing the queue
    ///
    /// # Errors
    /// `MachineNotFound`, or `Conflict` while a task holds the machine
    pub async fn probe_machine(&self, machine_id: &str) -> Result<ProbeResult, CoreError> {
        self.reconciler
            .ask(ProbeMachine {
                machine_id: machine_id.to_string(),
            })
            .await
            .map_err(flatten_send_error)
    }

    /// Consistent-enough view for persistence
    ///
    /// # Errors
    /// `ActorError` if the scheduler is gone
    pub async fn snapshot(&self) -> Result<EngineSnapshot, CoreError> {
        let tasks = self
            .scheduler
            .ask(SnapshotTasks)
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))?;
        let (machines, history) = self.store.snapshot().await;
        Ok(EngineSnapshot::new(machines, history, tasks))
    }

    /// Stop both actors and wait for them
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.reconciler.stop_gracefully().await.ok();
        self.reconciler.wait_for_shutdown().await;
        self.scheduler.stop_gracefully().await.ok();
        self.scheduler.wait_for_shutdown().await;
    }
}
