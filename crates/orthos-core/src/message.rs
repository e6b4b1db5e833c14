//! Message types for actor communication
//!
//! Message handlers are implemented in their respective actor modules.

use kameo_macros::Reply;
use orthos_remote::Outcome;
use serde::Serialize;

use crate::task::{TaskAction, TaskFilter, TaskId, TaskState};

// ============================================================================
// SchedulerActor Messages
// ============================================================================

/// Validate and queue an action against a machine
#[derive(Debug)]
pub struct EnqueueTask {
    pub machine_id: String,
    pub action: TaskAction,
    pub requested_by: String,
}

/// Cancel a queued or running task
#[derive(Debug)]
pub struct CancelTask {
    pub task_id: TaskId,
}

/// Acknowledgement of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Was queued, now `Cancelled`
    Cancelled,
    /// Running; the adapter stops at its next safe checkpoint
    CancellationRequested,
    /// Already terminal, nothing changed
    AlreadyFinished(TaskState),
}

impl CancelOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::CancellationRequested => "cancellation_requested",
            CancelOutcome::AlreadyFinished(_) => "already_finished",
        }
    }
}

#[derive(Debug)]
pub struct GetTask {
    pub task_id: TaskId,
}

#[derive(Debug)]
pub struct ListTasks {
    pub filter: TaskFilter,
}

/// Full queue contents for persistence
#[derive(Debug)]
pub struct SnapshotTasks;

/// Start whatever is dispatchable now (internal)
#[derive(Debug)]
pub struct Dispatch;

/// A worker finished its adapter call (internal)
#[derive(Debug)]
pub struct TaskFinished {
    pub task_id: TaskId,
    pub outcome: Outcome,
}

// ============================================================================
// ReconcilerActor Messages
// ============================================================================

/// Probe every eligible machine once
#[derive(Debug)]
pub struct Sweep;

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Reply)]
pub struct SweepReport {
    pub probed: usize,
    pub reachable: usize,
    pub unreachable: usize,
    /// Results discarded because a newer one was already recorded
    pub stale: usize,
    /// Skipped because a task held them when their turn came
    pub skipped_running: usize,
    pub skipped_maintenance: usize,
    pub releases_enqueued: usize,
}

/// Out-of-cycle probe of one machine
#[derive(Debug)]
pub struct ProbeMachine {
    pub machine_id: String,
}
