//! Task model and state machine

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use orthos_remote::RemoteAction;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compat::SystemClass;
use crate::error::CoreError;

pub type TaskId = Uuid;

/// Requester name used for engine-initiated tasks
pub const SYSTEM_REQUESTER: &str = "system";

/// What a task does to its machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskAction {
    PowerOn,
    PowerOff,
    PowerCycle,
    ConsoleAttach,
    /// Reinstall with an install profile, optionally as a different system class
    Provision {
        choice: String,
        #[serde(default)]
        system: Option<SystemClass>,
    },
    Reserve {
        reason: String,
        #[serde(default)]
        until: Option<DateTime<Utc>>,
    },
    Release,
    Rescan,
    SetMaintenance {
        enabled: bool,
    },
}

impl TaskAction {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            TaskAction::PowerOn => "power_on",
            TaskAction::PowerOff => "power_off",
            TaskAction::PowerCycle => "power_cycle",
            TaskAction::ConsoleAttach => "console_attach",
            TaskAction::Provision { .. } => "provision",
            TaskAction::Reserve { .. } => "reserve",
            TaskAction::Release => "release",
            TaskAction::Rescan => "rescan",
            TaskAction::SetMaintenance { .. } => "set_maintenance",
        }
    }

    /// Adapter operation, `None` for actions the engine performs itself
    #[must_use]
    pub fn remote_action(&self) -> Option<RemoteAction> {
        match self {
            TaskAction::PowerOn => Some(RemoteAction::PowerOn),
            TaskAction::PowerOff => Some(RemoteAction::PowerOff),
            TaskAction::PowerCycle => Some(RemoteAction::PowerCycle),
            TaskAction::ConsoleAttach => Some(RemoteAction::ConsoleAttach),
            TaskAction::Provision { choice, .. } => Some(RemoteAction::Provision {
                choice: choice.clone(),
            }),
            TaskAction::Reserve { .. }
            | TaskAction::Release
            | TaskAction::Rescan
            | TaskAction::SetMaintenance { .. } => None,
        }
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.remote_action().is_some()
    }

    #[must_use]
    pub fn is_power(&self) -> bool {
        matches!(
            self,
            TaskAction::PowerOn | TaskAction::PowerOff | TaskAction::PowerCycle
        )
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    #[must_use]
    pub fn can_transition_to(&self, to: TaskState) -> bool {
        matches!(
            (self, to),
            (TaskState::Queued, TaskState::Running)
                | (TaskState::Queued, TaskState::Cancelled)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Running, TaskState::Cancelled)
                // transient failure with attempts left
                | (TaskState::Running, TaskState::Queued)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "cancelled" => Ok(TaskState::Cancelled),
            other => Err(CoreError::validation(format!("unknown task state: {other}"))),
        }
    }
}

/// An action requested against one machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub machine_id: String,
    pub action: TaskAction,
    pub requested_by: String,
    pub enqueued_at: DateTime<Utc>,
    /// Position in the global queue, kept across retries
    pub seq: u64,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Backoff: not dispatched before this instant
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Task {
    pub fn new(
        machine_id: impl Into<String>,
        action: TaskAction,
        requested_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            machine_id: machine_id.into(),
            action,
            requested_by: requested_by.into(),
            enqueued_at: Utc::now(),
            seq: 0,
            state: TaskState::Queued,
            attempts: 0,
            last_error: None,
            not_before: None,
            started_at: None,
            finished_at: None,
            cancel_requested: false,
        }
    }

    /// Move to `to`, stamping start/finish times
    ///
    /// # Errors
    /// Returns `CoreError::InvalidTransition` if the state machine forbids it
    pub fn transition_to(&mut self, to: TaskState, now: DateTime<Utc>) -> Result<(), CoreError> {
        if !self.state.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        match to {
            TaskState::Running => {
                self.attempts += 1;
                self.started_at = Some(now);
                self.not_before = None;
            }
            TaskState::Queued => {}
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled => {
                self.finished_at = Some(now);
                self.not_before = None;
            }
        }
        self.state = to;
        Ok(())
    }

    /// Whether backoff still holds this task back at `now`
    #[must_use]
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_some_and(|at| at > now)
    }
}

/// Criteria for listing tasks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub machine_id: Option<String>,
    /// Empty matches every state
    pub states: Vec<TaskState>,
}

impl TaskFilter {
    #[must_use]
    pub fn for_machine(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: Some(machine_id.into()),
            states: Vec::new(),
        }
    }

    #[must_use]
    pub fn pending(mut self) -> Self {
        self.states = vec![TaskState::Queued, TaskState::Running];
        self
    }

    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        self.machine_id
            .as_ref()
            .is_none_or(|id| *id == task.machine_id)
            && (self.states.is_empty() || self.states.contains(&task.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let now = Utc::now();
        let mut task = Task::new("m1", TaskAction::PowerOn, "alice");
        task.transition_to(TaskState::Running, now).unwrap();
        assert_eq!(task.attempts, 1);
        assert_eq!(task.started_at, Some(now));
        task.transition_to(TaskState::Succeeded, now).unwrap();
        assert!(task.state.is_terminal());
        assert_eq!(task.finished_at, Some(now));
    }

    #[test]
    fn test_retry_transition_counts_attempts() {
        let now = Utc::now();
        let mut task = Task::new("m1", TaskAction::PowerCycle, "alice");
        task.transition_to(TaskState::Running, now).unwrap();
        task.transition_to(TaskState::Queued, now).unwrap();
        task.transition_to(TaskState::Running, now).unwrap();
        assert_eq!(task.attempts, 2);
    }

    #[test]
    fn test_invalid_transitions() {
        let now = Utc::now();
        let mut task = Task::new("m1", TaskAction::PowerOn, "alice");
        let err = task.transition_to(TaskState::Succeeded, now).unwrap_err();
        assert_eq!(
            err,
            CoreError::InvalidTransition {
                from: TaskState::Queued,
                to: TaskState::Succeeded
            }
        );

        task.transition_to(TaskState::Cancelled, now).unwrap();
        assert!(task.transition_to(TaskState::Running, now).is_err());
        assert!(task.transition_to(TaskState::Queued, now).is_err());
    }

    #[test]
    fn test_action_classification() {
        assert!(TaskAction::PowerOff.is_power());
        assert!(TaskAction::ConsoleAttach.is_remote());
        assert!(!TaskAction::Release.is_remote());
        assert_eq!(
            TaskAction::Provision {
                choice: "sles-16".into(),
                system: None
            }
            .remote_action(),
            Some(RemoteAction::Provision {
                choice: "sles-16".into()
            })
        );
    }

    #[test]
    fn test_filter() {
        let task = Task::new("m1", TaskAction::Rescan, "alice");
        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter::for_machine("m1").pending().matches(&task));
        assert!(!TaskFilter::for_machine("m2").matches(&task));
    }
}
