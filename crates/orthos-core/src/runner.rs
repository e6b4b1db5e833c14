//! Task execution
//!
//! A worker runs exactly one task: remote actions go through the adapter
//! registry under the operation timeout, everything else is applied to the
//! store directly. The runner never touches the queue; the scheduler turns the
//! returned [`Outcome`] into a state transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orthos_remote::{AdapterRegistry, Outcome};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::busy::MachineClaim;
use crate::error::CoreError;
use crate::machine::{ProbeResult, Reservation};
use crate::store::MachineStore;
use crate::task::{SYSTEM_REQUESTER, Task, TaskAction};

/// Why the reconciler is asked for an out-of-cycle probe
#[derive(Debug)]
pub enum ProbeCause {
    /// A `Rescan` task; its own claim covers the check
    Rescan(oneshot::Sender<Result<ProbeResult, CoreError>>),
    /// A remote task failed for good; the machine stays claimed until the
    /// reachability check is recorded so its next task cannot start first
    AfterFailure(MachineClaim),
}

#[derive(Debug)]
pub struct ProbeRequest {
    pub machine_id: String,
    pub cause: ProbeCause,
}

pub type ProbeSender = mpsc::UnboundedSender<ProbeRequest>;

#[derive(Debug)]
pub struct TaskRunner {
    store: Arc<MachineStore>,
    adapters: AdapterRegistry,
    probes: Option<ProbeSender>,
    operation_timeout: Duration,
}

impl TaskRunner {
    #[must_use]
    pub fn new(
        store: Arc<MachineStore>,
        adapters: AdapterRegistry,
        probes: Option<ProbeSender>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            adapters,
            probes,
            operation_timeout,
        }
    }

    /// Hand a failed task's claim to the reconciler for a follow-up probe
    ///
    /// The claim is released when the probe is done, or right away when no
    /// reconciler listens.
    pub fn request_probe(&self, claim: MachineClaim) {
        let Some(probes) = &self.probes else {
            return;
        };
        let request = ProbeRequest {
            machine_id: claim.machine_id().to_string(),
            cause: ProbeCause::AfterFailure(claim),
        };
        if let Err(rejected) = probes.send(request) {
            warn!(machine = %rejected.0.machine_id, "Reconciler gone, probe request dropped");
        }
    }

    #[instrument(
        skip(self, task, cancel),
        fields(
            task = %task.id,
            machine = %task.machine_id,
            action = task.action.kind(),
            attempt = task.attempts,
        )
    )]
    pub async fn run(&self, task: &Task, cancel: &CancellationToken) -> Outcome {
        let outcome = match &task.action {
            TaskAction::Reserve { reason, until } => {
                let mut reservation = Reservation::new(&task.requested_by, reason);
                reservation.until = *until;
                self.store
                    .set_reservation(&task.machine_id, Some(reservation))
                    .await
                    .map_or_else(permanent, |()| Outcome::success())
            }
            TaskAction::Release => self.release(task).await,
            TaskAction::SetMaintenance { enabled } => self
                .store
                .set_maintenance(&task.machine_id, *enabled)
                .await
                .map_or_else(permanent, |()| Outcome::success()),
            TaskAction::Rescan => self.rescan(&task.machine_id).await,
            _ => self.run_remote(task, cancel).await,
        };
        match &outcome {
            Outcome::Success { detail } => info!(detail = ?detail, "Task operation succeeded"),
            Outcome::TransientFailure { reason } => {
                warn!(%reason, "Task operation failed transiently");
            }
            Outcome::PermanentFailure { reason } => warn!(%reason, "Task operation failed"),
        }
        outcome
    }

    async fn run_remote(&self, task: &Task, cancel: &CancellationToken) -> Outcome {
        let Some(action) = task.action.remote_action() else {
            return Outcome::permanent(format!("{} is not a remote action", task.action));
        };
        let machine = match self.store.get(&task.machine_id).await {
            Ok(machine) => machine,
            Err(e) => return permanent(e),
        };

        let target = machine.target();
        let outcome = match tokio::time::timeout(
            self.operation_timeout,
            self.adapters.execute(&target, &action, cancel),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Outcome::transient(format!(
                "{} timed out after {:?}",
                action.name(),
                self.operation_timeout
            )),
        };
        if !outcome.is_success() {
            return outcome;
        }

        if let Err(e) = self
            .store
            .record_action_success(&task.machine_id, Utc::now())
            .await
        {
            return permanent(e);
        }
        if let TaskAction::Provision {
            system: Some(system),
            ..
        } = &task.action
            && let Err(e) = self.store.update_system(&task.machine_id, *system).await
        {
            return Outcome::permanent(format!("provisioned but system change refused: {e}"));
        }
        outcome
    }

    async fn release(&self, task: &Task) -> Outcome {
        let machine = match self.store.get(&task.machine_id).await {
            Ok(machine) => machine,
            Err(e) => return permanent(e),
        };
        match &machine.reservation {
            None => Outcome::success_with("machine was not reserved"),
            Some(current)
                if task.requested_by != SYSTEM_REQUESTER && current.owner != task.requested_by =>
            {
                Outcome::permanent(format!("machine is reserved by {}", current.owner))
            }
            Some(_) => self
                .store
                .set_reservation(&task.machine_id, None)
                .await
                .map_or_else(permanent, |()| Outcome::success()),
        }
    }

    async fn rescan(&self, machine_id: &str) -> Outcome {
        let Some(probes) = &self.probes else {
            return Outcome::permanent("reconciler is not running in this process");
        };
        let (tx, rx) = oneshot::channel();
        let request = ProbeRequest {
            machine_id: machine_id.to_string(),
            cause: ProbeCause::Rescan(tx),
        };
        if probes.send(request).is_err() {
            return Outcome::transient("reconciler unavailable");
        }
        match tokio::time::timeout(self.operation_timeout, rx).await {
            Ok(Ok(Ok(probe))) => Outcome::success_with(if probe.reachable {
                "machine is reachable".to_string()
            } else {
                format!(
                    "machine is unreachable: {}",
                    probe.detail.as_deref().unwrap_or("no detail")
                )
            }),
            Ok(Ok(Err(e))) => permanent(e),
            Ok(Err(_)) => Outcome::transient("reconciler dropped the probe request"),
            Err(_) => Outcome::transient("probe timed out"),
        }
    }
}

fn permanent(error: CoreError) -> Outcome {
    Outcome::permanent(error.to_string())
}
