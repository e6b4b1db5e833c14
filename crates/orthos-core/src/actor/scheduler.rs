//! `SchedulerActor`: Task queue owner and dispatcher
//!
//! Every queue mutation happens inside this actor's handlers, so the queue
//! needs no lock. Workers run on their own tokio tasks and report back with
//! `TaskFinished`. A task starts only after claiming its machine in the
//! shared [`BusyMachines`] set and the claim lives until the task settles, so
//! at most one task per machine is in `Running` and no probe overlaps it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use orthos_api::events::FleetEvent;
use orthos_remote::{AdapterRegistry, Outcome};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::admit;
use crate::busy::{BusyMachines, MachineClaim};
use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::message::{
    CancelOutcome, CancelTask, Dispatch, EnqueueTask, GetTask, ListTasks, SnapshotTasks,
    TaskFinished,
};
use crate::queue::TaskQueue;
use crate::retry::RetryPolicy;
use crate::runner::{ProbeSender, TaskRunner};
use crate::store::MachineStore;
use crate::task::{Task, TaskId, TaskState};

/// Arguments for spawning a `SchedulerActor`
pub struct SchedulerArgs {
    pub store: Arc<MachineStore>,
    pub adapters: AdapterRegistry,
    pub config: EngineConfig,
    /// Shared with the reconciler
    pub busy: Arc<BusyMachines>,
    /// Out-of-cycle probe requests to the reconciler
    pub probes: Option<ProbeSender>,
    /// Tasks restored from a snapshot
    pub restored: Vec<Task>,
}

struct RunningTask {
    task_id: TaskId,
    cancel: CancellationToken,
    claim: MachineClaim,
}

pub struct SchedulerActor {
    store: Arc<MachineStore>,
    runner: Arc<TaskRunner>,
    queue: TaskQueue,
    /// Running task per machine
    running: HashMap<String, RunningTask>,
    busy: Arc<BusyMachines>,
    retry: RetryPolicy,
    config: EngineConfig,
    event_tx: broadcast::Sender<FleetEvent>,
    self_ref: WeakActorRef<Self>,
    ticker: Option<JoinHandle<()>>,
}

impl SchedulerActor {
    /// Start every task that may run now
    fn dispatch(&mut self) {
        if !self.config.dispatch_enabled {
            return;
        }
        let free = self
            .config
            .worker_pool_size
            .max(1)
            .saturating_sub(self.running.len());
        if free == 0 {
            return;
        }
        let now = Utc::now();
        let busy = self.busy.snapshot();
        for task_id in self.queue.dispatchable(&busy, now, free) {
            if let Err(e) = self.start(task_id, now) {
                error!(task = %task_id, error = %e, "Failed to start task");
            }
        }
    }

    fn start(&mut self, task_id: TaskId, now: DateTime<Utc>) -> Result<(), CoreError> {
        let machine_id = self
            .queue
            .get(&task_id)
            .map(|task| task.machine_id.clone())
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        let Some(claim) = self.busy.try_claim(&machine_id) else {
            debug!(task = %task_id, machine = %machine_id, "Machine busy, task stays queued");
            return Ok(());
        };

        let task = self.queue.start(&task_id, now)?;
        self.emit_state(&task, TaskState::Queued);
        info!(
            task = %task_id,
            machine = %task.machine_id,
            action = %task.action,
            attempt = task.attempts,
            "Dispatching task"
        );

        let cancel = CancellationToken::new();
        self.running.insert(
            task.machine_id.clone(),
            RunningTask {
                task_id,
                cancel: cancel.clone(),
                claim,
            },
        );

        let runner = self.runner.clone();
        let actor = self.self_ref.clone();
        tokio::spawn(async move {
            // A panicking adapter must still free its machine
            let work = tokio::spawn(async move { runner.run(&task, &cancel).await });
            let outcome = match work.await {
                Ok(outcome) => outcome,
                Err(e) => Outcome::permanent(format!("worker aborted: {e}")),
            };
            match actor.upgrade() {
                Some(actor) => {
                    if let Err(e) = actor.tell(TaskFinished { task_id, outcome }).await {
                        warn!(task = %task_id, error = %e, "Scheduler gone, task result dropped");
                    }
                }
                None => debug!(task = %task_id, "Scheduler stopped before task finished"),
            }
        });
        Ok(())
    }

    /// Dispatch again once `delay` has passed
    fn wake_after(&self, delay: Duration) {
        let actor = self.self_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(actor) = actor.upgrade() {
                let _ = actor.tell(Dispatch).await;
            }
        });
    }

    fn emit_state(&self, task: &Task, from: TaskState) {
        let error = match task.state {
            TaskState::Queued | TaskState::Failed | TaskState::Cancelled => task.last_error.clone(),
            TaskState::Running | TaskState::Succeeded => None,
        };
        let _ = self.event_tx.send(FleetEvent::TaskStateChanged {
            task_id: task.id,
            machine: task.machine_id.clone(),
            from: from.to_string(),
            to: task.state.to_string(),
            error,
        });
    }

    /// Apply a worker's outcome to the task
    ///
    /// `claim` is released on return unless a follow-up probe takes it over.
    fn settle(
        &mut self,
        task: &Task,
        outcome: Outcome,
        cancelled: bool,
        claim: Option<MachineClaim>,
        now: DateTime<Utc>,
    ) -> Result<Task, CoreError> {
        match outcome {
            Outcome::Success { .. } => self.queue.finish(&task.id, TaskState::Succeeded, None, now),
            other if cancelled => {
                let reason = other.reason().unwrap_or("cancelled").to_string();
                info!(task = %task.id, %reason, "Task cancelled");
                self.queue
                    .finish(&task.id, TaskState::Cancelled, Some(reason), now)
            }
            Outcome::TransientFailure { reason } if self.retry.should_retry(task.attempts) => {
                let delay = self.retry.delay_after(task.attempts);
                let not_before =
                    now + TimeDelta::from_std(delay).unwrap_or_else(|_| TimeDelta::zero());
                warn!(
                    task = %task.id,
                    attempt = task.attempts,
                    max_attempts = self.retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "Transient failure, will retry"
                );
                let requeued = self.queue.requeue(&task.id, reason, not_before, now)?;
                self.wake_after(delay);
                Ok(requeued)
            }
            Outcome::TransientFailure { reason } | Outcome::PermanentFailure { reason } => {
                warn!(task = %task.id, attempts = task.attempts, %reason, "Task failed");
                let failed = self
                    .queue
                    .finish(&task.id, TaskState::Failed, Some(reason), now)?;
                if task.action.is_remote()
                    && let Some(claim) = claim
                {
                    self.runner.request_probe(claim);
                }
                Ok(failed)
            }
        }
    }
}

fn spawn_ticker(actor: WeakActorRef<SchedulerActor>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(actor) = actor.upgrade() else {
                break;
            };
            if actor.tell(Dispatch).await.is_err() {
                break;
            }
        }
    })
}

impl Actor for SchedulerActor {
    type Args = SchedulerArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let config = args.config;
        let retry = config.retry_policy();
        let queue = TaskQueue::restore(
            args.restored,
            config.task_retention,
            retry.max_attempts,
            Utc::now(),
        );
        let runner = TaskRunner::new(
            args.store.clone(),
            args.adapters,
            args.probes,
            config.operation_timeout(),
        );
        let ticker = config
            .dispatch_enabled
            .then(|| spawn_ticker(actor_ref.downgrade(), config.dispatch_tick()));

        info!(
            id = %actor_ref.id(),
            pool = config.worker_pool_size,
            pending = queue.pending_len(),
            dispatch = config.dispatch_enabled,
            "SchedulerActor starting"
        );

        Ok(Self {
            event_tx: args.store.event_sender(),
            store: args.store,
            runner: Arc::new(runner),
            queue,
            running: HashMap::new(),
            busy: args.busy,
            retry,
            config,
            self_ref: actor_ref.downgrade(),
            ticker,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, running = self.running.len(), "SchedulerActor stopping");
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        for running in self.running.values() {
            running.cancel.cancel();
        }
        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<EnqueueTask> for SchedulerActor {
    type Reply = Result<TaskId, CoreError>;

    async fn handle(
        &mut self,
        msg: EnqueueTask,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let machine = self.store.get(&msg.machine_id).await?;
        admit(
            &machine,
            &msg.action,
            &msg.requested_by,
            &self.config,
            Utc::now(),
        )?;

        let task = Task::new(msg.machine_id, msg.action, msg.requested_by);
        let (machine, action) = (task.machine_id.clone(), task.action.kind().to_string());
        let task_id = self.queue.push(task);
        info!(task = %task_id, %machine, %action, "Task queued");
        let _ = self.event_tx.send(FleetEvent::TaskQueued {
            task_id,
            machine,
            action,
        });

        self.dispatch();
        Ok(task_id)
    }
}

impl Message<CancelTask> for SchedulerActor {
    type Reply = Result<CancelOutcome, CoreError>;

    async fn handle(
        &mut self,
        msg: CancelTask,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let task = self
            .queue
            .get(&msg.task_id)
            .cloned()
            .ok_or_else(|| CoreError::TaskNotFound(msg.task_id.to_string()))?;

        match task.state {
            TaskState::Queued => {
                let cancelled = self.queue.finish(
                    &task.id,
                    TaskState::Cancelled,
                    None,
                    Utc::now(),
                )?;
                info!(task = %task.id, "Queued task cancelled");
                self.emit_state(&cancelled, TaskState::Queued);
                // The machine's next task may now be at the head
                self.dispatch();
                Ok(CancelOutcome::Cancelled)
            }
            TaskState::Running => {
                if let Some(running) = self.running.get(&task.machine_id)
                    && running.task_id == task.id
                {
                    running.cancel.cancel();
                }
                self.queue.mark_cancel_requested(&task.id)?;
                info!(task = %task.id, "Cancellation requested for running task");
                Ok(CancelOutcome::CancellationRequested)
            }
            state => Ok(CancelOutcome::AlreadyFinished(state)),
        }
    }
}

impl Message<GetTask> for SchedulerActor {
    type Reply = Result<Task, CoreError>;

    async fn handle(&mut self, msg: GetTask, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.queue
            .get(&msg.task_id)
            .cloned()
            .ok_or_else(|| CoreError::TaskNotFound(msg.task_id.to_string()))
    }
}

impl Message<ListTasks> for SchedulerActor {
    type Reply = Vec<Task>;

    async fn handle(
        &mut self,
        msg: ListTasks,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.queue.list(&msg.filter)
    }
}

impl Message<SnapshotTasks> for SchedulerActor {
    type Reply = Vec<Task>;

    async fn handle(
        &mut self,
        _msg: SnapshotTasks,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.queue.snapshot()
    }
}

impl Message<Dispatch> for SchedulerActor {
    type Reply = ();

    async fn handle(&mut self, _msg: Dispatch, _ctx: &mut Context<Self, Self::Reply>) {
        self.dispatch();
    }
}

impl Message<TaskFinished> for SchedulerActor {
    type Reply = ();

    async fn handle(&mut self, msg: TaskFinished, _ctx: &mut Context<Self, Self::Reply>) {
        let Some(task) = self.queue.get(&msg.task_id).cloned() else {
            warn!(task = %msg.task_id, "Finished task is no longer known");
            return;
        };

        let (cancelled, claim) = match self.running.remove(&task.machine_id) {
            Some(running) if running.task_id == task.id => {
                (running.cancel.is_cancelled(), Some(running.claim))
            }
            Some(other) => {
                error!(
                    task = %task.id,
                    machine = %task.machine_id,
                    "Finished task was not the running one"
                );
                self.running.insert(task.machine_id.clone(), other);
                return;
            }
            None => (task.cancel_requested, None),
        };

        match self.settle(&task, msg.outcome, cancelled, claim, Utc::now()) {
            Ok(updated) => self.emit_state(&updated, TaskState::Running),
            Err(e) => error!(task = %task.id, error = %e, "Failed to record task outcome"),
        }

        self.dispatch();
    }
}
