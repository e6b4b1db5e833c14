//! `ReconcilerActor`: Periodic reachability sweep
//!
//! Probes every machine that is neither in maintenance nor held by a running
//! task, records the results through the store's last-writer-wins
//! rule, and queues system releases for expired reservations. A failed probe
//! is only ever a status; the next sweep is the retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use orthos_remote::{ProbeOutcome, Prober};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::actor::flatten_send_error;
use crate::actor::scheduler::SchedulerActor;
use crate::busy::BusyMachines;
use crate::error::CoreError;
use crate::machine::{MachineFilter, ProbeResult};
use crate::message::{Dispatch, EnqueueTask, ListTasks, ProbeMachine, Sweep, SweepReport};
use crate::runner::{ProbeCause, ProbeRequest};
use crate::store::MachineStore;
use crate::task::{SYSTEM_REQUESTER, TaskAction, TaskFilter};

/// Arguments for spawning a `ReconcilerActor`
pub struct ReconcilerArgs {
    pub store: Arc<MachineStore>,
    pub prober: Arc<dyn Prober>,
    pub scheduler: ActorRef<SchedulerActor>,
    /// Shared with the scheduler
    pub busy: Arc<BusyMachines>,
    /// Out-of-cycle probe requests from task workers
    pub probe_requests: Option<mpsc::UnboundedReceiver<ProbeRequest>>,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub probe_concurrency: usize,
    /// Run sweeps on `interval`; when off, sweeps happen only on request
    pub periodic: bool,
}

pub struct ReconcilerActor {
    store: Arc<MachineStore>,
    prober: Arc<dyn Prober>,
    scheduler: ActorRef<SchedulerActor>,
    busy: Arc<BusyMachines>,
    probe_timeout: Duration,
    probe_concurrency: usize,
    background: Vec<JoinHandle<()>>,
}

/// Probe one machine and record the result
async fn probe_machine(
    store: &MachineStore,
    prober: &dyn Prober,
    machine_id: &str,
    timeout: Duration,
) -> Result<(ProbeResult, bool), CoreError> {
    let target = store.get(machine_id).await?.target();
    let outcome = match tokio::time::timeout(timeout, prober.probe(&target)).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::unreachable(format!("{} probe timed out", prober.method())),
    };
    let result = ProbeResult {
        machine_id: machine_id.to_string(),
        reachable: outcome.reachable,
        probed_at: Utc::now(),
        detail: outcome.detail,
    };
    let applied = store.record_probe(&result).await?;
    debug!(machine = %machine_id, reachable = result.reachable, applied, "Probe recorded");
    Ok((result, applied))
}

impl ReconcilerActor {
    async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let mut candidates = Vec::new();
        for machine in self.store.list(&MachineFilter::default()).await {
            if machine.maintenance {
                report.skipped_maintenance += 1;
            } else {
                candidates.push(machine.id);
            }
        }

        // claimed one at a time: a task may start or finish while others are checked
        let results: Vec<_> = stream::iter(candidates)
            .map(|id| {
                let store = self.store.clone();
                let prober = self.prober.clone();
                let busy = self.busy.clone();
                let timeout = self.probe_timeout;
                async move {
                    let Some(_claim) = busy.try_claim(&id) else {
                        return (id, None);
                    };
                    let result = probe_machine(&store, prober.as_ref(), &id, timeout).await;
                    (id, Some(result))
                }
            })
            .buffer_unordered(self.probe_concurrency.max(1))
            .collect()
            .await;

        for (id, result) in results {
            match result {
                None => report.skipped_running += 1,
                Some(Ok((probe, applied))) => {
                    report.probed += 1;
                    if !applied {
                        report.stale += 1;
                    } else if probe.reachable {
                        report.reachable += 1;
                    } else {
                        report.unreachable += 1;
                    }
                }
                Some(Err(e)) => warn!(machine = %id, error = %e, "Probe could not be recorded"),
            }
        }

        report.releases_enqueued = self.release_expired().await;
        report
    }

    /// Queue a system release for each expired reservation not already pending
    async fn release_expired(&self) -> usize {
        let mut enqueued = 0;
        for machine_id in self.store.expired_reservations(Utc::now()).await {
            let pending = match self
                .scheduler
                .ask(ListTasks {
                    filter: TaskFilter::for_machine(&machine_id).pending(),
                })
                .await
            {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(machine = %machine_id, error = %e, "Could not list pending tasks");
                    continue;
                }
            };
            if pending.iter().any(|t| t.action == TaskAction::Release) {
                continue;
            }

            let request = EnqueueTask {
                machine_id: machine_id.clone(),
                action: TaskAction::Release,
                requested_by: SYSTEM_REQUESTER.to_string(),
            };
            match self.scheduler.ask(request).await.map_err(flatten_send_error) {
                Ok(task_id) => {
                    info!(
                        machine = %machine_id,
                        task = %task_id,
                        "Reservation expired, release queued"
                    );
                    enqueued += 1;
                }
                Err(e) => warn!(machine = %machine_id, error = %e, "Could not queue release"),
            }
        }
        enqueued
    }
}

fn spawn_sweeper(actor: WeakActorRef<ReconcilerActor>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(actor) = actor.upgrade() else {
                break;
            };
            // ask, not tell: a slow sweep must not pile up behind itself
            if actor.ask(Sweep).await.is_err() {
                break;
            }
        }
    })
}

/// Serve out-of-cycle probes one at a time
///
/// Rescans run under their task's claim. A failed task's claim is released
/// after its check and the scheduler is woken to start the machine's next
/// task.
fn spawn_probe_listener(
    mut requests: mpsc::UnboundedReceiver<ProbeRequest>,
    store: Arc<MachineStore>,
    prober: Arc<dyn Prober>,
    scheduler: WeakActorRef<SchedulerActor>,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(ProbeRequest { machine_id, cause }) = requests.recv().await {
            let result = probe_machine(&store, prober.as_ref(), &machine_id, timeout)
                .await
                .map(|(probe, _)| probe);
            if let Err(e) = &result {
                warn!(machine = %machine_id, error = %e, "Out-of-cycle probe failed");
            }
            match cause {
                ProbeCause::Rescan(reply) => {
                    let _ = reply.send(result);
                }
                ProbeCause::AfterFailure(claim) => {
                    drop(claim);
                    if let Some(scheduler) = scheduler.upgrade() {
                        let _ = scheduler.tell(Dispatch).await;
                    }
                }
            }
        }
    })
}

impl Actor for ReconcilerActor {
    type Args = ReconcilerArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let mut background = Vec::new();
        if args.periodic {
            background.push(spawn_sweeper(actor_ref.downgrade(), args.interval));
        }
        if let Some(requests) = args.probe_requests {
            background.push(spawn_probe_listener(
                requests,
                args.store.clone(),
                args.prober.clone(),
                args.scheduler.downgrade(),
                args.probe_timeout,
            ));
        }

        info!(
            id = %actor_ref.id(),
            method = args.prober.method(),
            interval_secs = args.interval.as_secs(),
            periodic = args.periodic,
            "ReconcilerActor starting"
        );

        Ok(Self {
            store: args.store,
            prober: args.prober,
            scheduler: args.scheduler,
            busy: args.busy,
            probe_timeout: args.probe_timeout,
            probe_concurrency: args.probe_concurrency,
            background,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, "ReconcilerActor stopping");
        for handle in self.background.drain(..) {
            handle.abort();
        }
        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<Sweep> for ReconcilerActor {
    type Reply = SweepReport;

    async fn handle(&mut self, _msg: Sweep, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let started = std::time::Instant::now();
        let report = self.sweep().await;
        info!(
            probed = report.probed,
            reachable = report.reachable,
            unreachable = report.unreachable,
            stale = report.stale,
            skipped_running = report.skipped_running,
            releases = report.releases_enqueued,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sweep finished"
        );
        report
    }
}

impl Message<ProbeMachine> for ReconcilerActor {
    type Reply = Result<ProbeResult, CoreError>;

    async fn handle(
        &mut self,
        msg: ProbeMachine,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let Some(_claim) = self.busy.try_claim(&msg.machine_id) else {
            return Err(CoreError::conflict(format!(
                "{} has a task running, probe skipped",
                msg.machine_id
            )));
        };
        probe_machine(
            &self.store,
            self.prober.as_ref(),
            &msg.machine_id,
            self.probe_timeout,
        )
        .await
        .map(|(probe, _)| probe)
    }
}
