//! Ordered task queue
//!
//! Owned exclusively by the `SchedulerActor`, which serializes every access
//! through its mailbox. Pending tasks are indexed by their global sequence
//! number so dispatch walks them in enqueue order; a retried task goes back to
//! its original position.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::task::{Task, TaskFilter, TaskId, TaskState};

#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: HashMap<TaskId, Task>,
    /// Queued tasks by sequence number
    pending: BTreeMap<u64, TaskId>,
    /// Terminal tasks, oldest first
    finished: VecDeque<TaskId>,
    next_seq: u64,
    retention: usize,
}

impl TaskQueue {
    #[must_use]
    pub fn new(retention: usize) -> Self {
        Self {
            retention,
            ..Self::default()
        }
    }

    /// Rebuild from a snapshot
    ///
    /// Tasks caught `Running` go back to `Queued` unless they were on their
    /// last attempt; those fail, since running them again would exceed
    /// `max_attempts`.
    #[must_use]
    pub fn restore(
        tasks: Vec<Task>,
        retention: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let mut queue = Self::new(retention);
        let mut tasks = tasks;
        tasks.sort_by_key(|task| task.seq);
        for mut task in tasks {
            if task.state == TaskState::Running {
                task.state = TaskState::Queued;
                task.started_at = None;
                task.cancel_requested = false;
            }
            if task.state == TaskState::Queued && task.attempts >= max_attempts {
                let note = format!("interrupted by restart after {} attempts", task.attempts);
                task.last_error = Some(match task.last_error.take() {
                    Some(error) => format!("{error}; {note}"),
                    None => note,
                });
                task.state = TaskState::Failed;
                task.not_before = None;
                task.finished_at = Some(now);
            }
            queue.next_seq = queue.next_seq.max(task.seq + 1);
            if task.state == TaskState::Queued {
                queue.pending.insert(task.seq, task.id);
            } else {
                queue.finished.push_back(task.id);
            }
            queue.tasks.insert(task.id, task);
        }
        queue
    }

    /// Append a task, assigning its sequence number
    pub fn push(&mut self, mut task: Task) -> TaskId {
        task.seq = self.next_seq;
        task.state = TaskState::Queued;
        self.next_seq += 1;
        let id = task.id;
        self.pending.insert(task.seq, id);
        self.tasks.insert(id, task);
        id
    }

    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Tasks to start now, in enqueue order
    ///
    /// Only the oldest queued task of each machine is a candidate, and only
    /// if that machine has nothing running and the task is not backing off.
    #[must_use]
    pub fn dispatchable(
        &self,
        busy_machines: &HashSet<String>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<TaskId> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut ready = Vec::new();
        for id in self.pending.values() {
            if ready.len() >= limit {
                break;
            }
            let Some(task) = self.tasks.get(id) else {
                continue;
            };
            if !seen.insert(task.machine_id.as_str()) {
                continue;
            }
            if busy_machines.contains(&task.machine_id) || task.is_backing_off(now) {
                continue;
            }
            ready.push(*id);
        }
        ready
    }

    /// Queued → Running
    ///
    /// # Errors
    /// `TaskNotFound` or `InvalidTransition`
    pub fn start(&mut self, id: &TaskId, now: DateTime<Utc>) -> Result<Task, CoreError> {
        let task = self.task_mut(id)?;
        task.transition_to(TaskState::Running, now)?;
        let seq = task.seq;
        let snapshot = task.clone();
        self.pending.remove(&seq);
        Ok(snapshot)
    }

    /// Running → Queued after a transient failure, held back until `not_before`
    ///
    /// # Errors
    /// `TaskNotFound` or `InvalidTransition`
    pub fn requeue(
        &mut self,
        id: &TaskId,
        error: String,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Task, CoreError> {
        let task = self.task_mut(id)?;
        task.transition_to(TaskState::Queued, now)?;
        task.last_error = Some(error);
        task.not_before = Some(not_before);
        let seq = task.seq;
        let snapshot = task.clone();
        self.pending.insert(seq, *id);
        Ok(snapshot)
    }

    /// Move to a terminal state, keeping `error` when given
    ///
    /// # Errors
    /// `TaskNotFound` or `InvalidTransition`
    pub fn finish(
        &mut self,
        id: &TaskId,
        state: TaskState,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Task, CoreError> {
        if !state.is_terminal() {
            return Err(CoreError::validation(format!(
                "{state} is not a terminal state"
            )));
        }
        let task = self.task_mut(id)?;
        let from = task.state;
        task.transition_to(state, now)?;
        if error.is_some() {
            task.last_error = error;
        }
        let seq = task.seq;
        let snapshot = task.clone();
        if from == TaskState::Queued {
            self.pending.remove(&seq);
        }
        self.finished.push_back(*id);
        self.prune();
        Ok(snapshot)
    }

    pub fn mark_cancel_requested(&mut self, id: &TaskId) -> Result<(), CoreError> {
        self.task_mut(id)?.cancel_requested = true;
        Ok(())
    }

    /// Matching tasks in enqueue order
    #[must_use]
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.seq);
        tasks
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Task> {
        self.list(&TaskFilter::default())
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task, CoreError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))
    }

    fn prune(&mut self) {
        while self.finished.len() > self.retention {
            if let Some(old) = self.finished.pop_front() {
                self.tasks.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::task::TaskAction;

    fn queue_with(specs: &[(&str, TaskAction)]) -> (TaskQueue, Vec<TaskId>) {
        let mut queue = TaskQueue::new(100);
        let ids = specs
            .iter()
            .map(|(machine, action)| queue.push(Task::new(*machine, action.clone(), "alice")))
            .collect();
        (queue, ids)
    }

    #[test]
    fn test_only_head_of_each_machine_dispatches() {
        let (queue, ids) = queue_with(&[
            ("m1", TaskAction::PowerOn),
            ("m1", TaskAction::ConsoleAttach),
            ("m2", TaskAction::PowerOff),
        ]);
        let ready = queue.dispatchable(&HashSet::new(), Utc::now(), 10);
        assert_eq!(ready, vec![ids[0], ids[2]]);
    }

    #[test]
    fn test_busy_machine_is_skipped() {
        let (queue, ids) = queue_with(&[("m1", TaskAction::PowerOn), ("m2", TaskAction::PowerOn)]);
        let busy = HashSet::from(["m1".to_string()]);
        assert_eq!(queue.dispatchable(&busy, Utc::now(), 10), vec![ids[1]]);
    }

    #[test]
    fn test_limit() {
        let (queue, ids) = queue_with(&[
            ("m1", TaskAction::PowerOn),
            ("m2", TaskAction::PowerOn),
            ("m3", TaskAction::PowerOn),
        ]);
        assert_eq!(
            queue.dispatchable(&HashSet::new(), Utc::now(), 2),
            vec![ids[0], ids[1]]
        );
    }

    #[test]
    fn test_backing_off_head_blocks_its_machine() {
        let (mut queue, ids) =
            queue_with(&[("m1", TaskAction::PowerOn), ("m1", TaskAction::PowerOff)]);
        let now = Utc::now();
        queue.start(&ids[0], now).unwrap();
        queue
            .requeue(&ids[0], "busy".into(), now + Duration::seconds(30), now)
            .unwrap();

        assert!(queue.dispatchable(&HashSet::new(), now, 10).is_empty());
        let later = now + Duration::seconds(31);
        assert_eq!(queue.dispatchable(&HashSet::new(), later, 10), vec![ids[0]]);
    }

    #[test]
    fn test_requeue_keeps_position_and_error() {
        let (mut queue, ids) =
            queue_with(&[("m1", TaskAction::PowerOn), ("m2", TaskAction::PowerOn)]);
        let now = Utc::now();
        queue.start(&ids[0], now).unwrap();
        let task = queue.requeue(&ids[0], "timeout".into(), now, now).unwrap();
        assert_eq!(task.seq, 0);
        assert_eq!(task.last_error.as_deref(), Some("timeout"));
        assert_eq!(
            queue.dispatchable(&HashSet::new(), now, 10),
            vec![ids[0], ids[1]]
        );
    }

    #[test]
    fn test_finish_queued_task_leaves_pending() {
        let (mut queue, ids) = queue_with(&[("m1", TaskAction::PowerOn)]);
        queue
            .finish(&ids[0], TaskState::Cancelled, None, Utc::now())
            .unwrap();
        assert_eq!(queue.pending_len(), 0);
        assert!(queue.finish(&ids[0], TaskState::Failed, None, Utc::now()).is_err());
    }

    #[test]
    fn test_retention_prunes_oldest_finished() {
        let mut queue = TaskQueue::new(1);
        let a = queue.push(Task::new("m1", TaskAction::PowerOn, "alice"));
        let b = queue.push(Task::new("m1", TaskAction::PowerOff, "alice"));
        queue.finish(&a, TaskState::Cancelled, None, Utc::now()).unwrap();
        queue.finish(&b, TaskState::Cancelled, None, Utc::now()).unwrap();
        assert!(queue.get(&a).is_none());
        assert!(queue.get(&b).is_some());
    }

    #[test]
    fn test_restore_requeues_running() {
        let (mut queue, ids) =
            queue_with(&[("m1", TaskAction::PowerOn), ("m2", TaskAction::PowerOn)]);
        queue.start(&ids[0], Utc::now()).unwrap();

        let restored = TaskQueue::restore(queue.snapshot(), 100, 5, Utc::now());
        let task = restored.get(&ids[0]).unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.attempts, 1);
        assert_eq!(restored.pending_len(), 2);

        let mut restored = restored;
        let next = restored.push(Task::new("m3", TaskAction::Rescan, "alice"));
        assert_eq!(restored.get(&next).unwrap().seq, 2);
    }

    #[test]
    fn test_restore_fails_task_interrupted_on_last_attempt() {
        let (queue, ids) = queue_with(&[
            ("m1", TaskAction::PowerCycle),
            ("m2", TaskAction::PowerCycle),
        ]);
        let mut tasks = queue.snapshot();
        tasks[0].state = TaskState::Running;
        tasks[0].attempts = 3;
        tasks[0].last_error = Some("device busy".to_string());
        tasks[1].state = TaskState::Running;
        tasks[1].attempts = 2;

        let now = Utc::now();
        let restored = TaskQueue::restore(tasks, 100, 3, now);

        let exhausted = restored.get(&ids[0]).unwrap();
        assert_eq!(exhausted.state, TaskState::Failed);
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(
            exhausted.last_error.as_deref(),
            Some("device busy; interrupted by restart after 3 attempts")
        );
        assert_eq!(exhausted.finished_at, Some(now));

        assert_eq!(restored.get(&ids[1]).unwrap().state, TaskState::Queued);
        assert_eq!(restored.pending_len(), 1);
        assert_eq!(restored.dispatchable(&HashSet::new(), now, 10), vec![ids[1]]);
    }
}
