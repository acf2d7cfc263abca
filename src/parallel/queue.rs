//! Work Queue for Parallel Execution
//!
//! Priority + dependency aware queue over task identifiers. Readiness is
//! recomputed from scratch over an arena of task records on every query,
//! which keeps it correct while tasks are added mid-run.
//!
//! A dependency on an identifier the queue has never seen is ignored:
//! dependency metadata comes from task files and is not trusted. Dependency
//! cycles are not detected; their members simply never become ready.

use crate::models::state_machine::{transition_state, StateTransitionError};
use crate::models::{Task, TaskId, TaskStatus};
use crate::utils::lock_mutex_recover;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task not found in queue: {0}")]
    UnknownTask(TaskId),

    #[error("Task {task_id}: {source}")]
    Transition {
        task_id: TaskId,
        #[source]
        source: StateTransitionError,
    },
}

/// A task in the arena, with its queue bookkeeping
#[derive(Debug, Clone)]
struct TaskRecord {
    task: Task,
    status: TaskStatus,
    /// Pending but held back (deferred on a file overlap)
    held: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    /// Insertion-ordered arena; the index doubles as the FIFO tie-break
    records: Vec<TaskRecord>,
    index: HashMap<TaskId, usize>,
}

impl QueueInner {
    fn record(&self, id: &str) -> Option<&TaskRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    fn record_mut(&mut self, id: &str) -> Result<&mut TaskRecord, QueueError> {
        match self.index.get(id) {
            Some(&i) => Ok(&mut self.records[i]),
            None => Err(QueueError::UnknownTask(id.to_string())),
        }
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| match self.record(dep) {
            Some(record) => record.status == TaskStatus::Completed,
            None => true,
        })
    }

    fn is_ready(&self, record: &TaskRecord) -> bool {
        record.status == TaskStatus::Pending && !record.held && self.dependencies_met(&record.task)
    }

    /// Index of the most urgent ready task (lowest tier, then insertion order)
    fn best_ready(&self) -> Option<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, record)| self.is_ready(record))
            .min_by_key(|(i, record)| (record.task.priority, *i))
            .map(|(i, _)| i)
    }

    fn transition(&mut self, id: &str, target: TaskStatus) -> Result<(), QueueError> {
        let record = self.record_mut(id)?;
        record.status =
            transition_state(record.status, target).map_err(|source| QueueError::Transition {
                task_id: id.to_string(),
                source,
            })?;
        record.held = false;
        Ok(())
    }

    fn ids_with(&self, status: TaskStatus) -> Vec<TaskId> {
        self.records
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.task.id.clone())
            .collect()
    }

    fn insert(&mut self, task: Task, status: TaskStatus) -> bool {
        if self.index.contains_key(&task.id) {
            return false;
        }
        self.index.insert(task.id.clone(), self.records.len());
        self.records.push(TaskRecord {
            task,
            status,
            held: false,
        });
        true
    }
}

/// Point-in-time copy of the queue's id sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Includes deferred and parked tasks: both are unresolved
    pub pending: Vec<TaskId>,
    pub in_progress: Vec<TaskId>,
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub held: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub parked: usize,
}

/// Thread-safe priority + dependency queue
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    /// Woken on every state change so blocked `next_ready` callers re-check
    changed: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            changed: Notify::new(),
        }
    }

    /// Add new pending tasks, ignoring identifiers already known.
    /// Returns how many were actually added.
    pub fn enqueue<I>(&self, tasks: I) -> usize
    where
        I: IntoIterator<Item = Task>,
    {
        let added = {
            let mut inner = lock_mutex_recover(&self.inner);
            tasks
                .into_iter()
                .filter(|task| inner.insert(task.clone(), TaskStatus::Pending))
                .count()
        };
        if added > 0 {
            log::debug!("[WorkQueue] Enqueued {} new task(s)", added);
            self.changed.notify_waiters();
        }
        added
    }

    /// Take the most urgent ready task, moving it to in-progress.
    ///
    /// With `block` set, waits until one becomes ready; otherwise returns
    /// `None` immediately when nothing is ready.
    pub async fn next_ready(&self, block: bool) -> Option<Task> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a change between the check and the
            // await isn't lost
            notified.as_mut().enable();

            if let Some(task) = self.try_next_ready() {
                return Some(task);
            }
            if !block {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking form of [`WorkQueue::next_ready`]
    pub fn try_next_ready(&self) -> Option<Task> {
        let mut inner = lock_mutex_recover(&self.inner);
        let idx = inner.best_ready()?;
        let record = &mut inner.records[idx];
        record.status = TaskStatus::InProgress;
        Some(record.task.clone())
    }

    /// Move a specific pending task (held or not) to in-progress, bypassing
    /// priority and dependency order
    pub fn claim(&self, id: &str) -> Result<Task, QueueError> {
        let mut inner = lock_mutex_recover(&self.inner);
        inner.transition(id, TaskStatus::InProgress)?;
        Ok(inner.record_mut(id)?.task.clone())
    }

    /// Whether any task could be dispatched right now
    pub fn has_ready(&self) -> bool {
        lock_mutex_recover(&self.inner).best_ready().is_some()
    }

    pub fn mark_completed(&self, id: &str) -> Result<(), QueueError> {
        self.apply(id, TaskStatus::Completed)
    }

    pub fn mark_failed(&self, id: &str) -> Result<(), QueueError> {
        self.apply(id, TaskStatus::Failed)
    }

    /// Leave an in-progress task unresolved for the rest of the run
    /// (interrupted, or failed for a transient reason)
    pub fn park(&self, id: &str) -> Result<(), QueueError> {
        self.apply(id, TaskStatus::Parked)
    }

    /// Return an in-progress task to pending, held until [`WorkQueue::release`]
    pub fn defer(&self, id: &str) -> Result<(), QueueError> {
        let mut inner = lock_mutex_recover(&self.inner);
        inner.transition(id, TaskStatus::Pending)?;
        inner.record_mut(id)?.held = true;
        Ok(())
    }

    /// Make a deferred task dispatchable again
    pub fn release(&self, id: &str) -> Result<(), QueueError> {
        {
            let mut inner = lock_mutex_recover(&self.inner);
            inner.record_mut(id)?.held = false;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Explicitly reset a task back to pending, including an in-progress one
    /// whose claim is given up
    pub fn reset(&self, id: &str) -> Result<(), QueueError> {
        self.apply(id, TaskStatus::Pending)
    }

    fn apply(&self, id: &str, target: TaskStatus) -> Result<(), QueueError> {
        lock_mutex_recover(&self.inner).transition(id, target)?;
        self.changed.notify_waiters();
        Ok(())
    }

    /// Apply terminal sets from a previous run.
    ///
    /// Identifiers not currently known are recorded as placeholders so that
    /// dependents still see them as completed/failed and later enqueues of the
    /// same id are ignored.
    pub fn restore(&self, completed: &[TaskId], failed: &[TaskId]) {
        {
            let mut inner = lock_mutex_recover(&self.inner);
            for (ids, status) in [(completed, TaskStatus::Completed), (failed, TaskStatus::Failed)] {
                for id in ids {
                    let existing = inner.index.get(id.as_str()).copied();
                    match existing {
                        Some(i) => {
                            let record = &mut inner.records[i];
                            if record.status == TaskStatus::Pending {
                                record.status = status;
                                record.held = false;
                            }
                        }
                        None => {
                            inner.insert(Task::new(id.clone()), status);
                        }
                    }
                }
            }
        }
        self.changed.notify_waiters();
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        lock_mutex_recover(&self.inner).record(id).map(|r| r.status)
    }

    pub fn is_held(&self, id: &str) -> bool {
        lock_mutex_recover(&self.inner)
            .record(id)
            .map(|r| r.held)
            .unwrap_or(false)
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        lock_mutex_recover(&self.inner)
            .record(id)
            .map(|r| r.task.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        lock_mutex_recover(&self.inner).index.contains_key(id)
    }

    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        lock_mutex_recover(&self.inner).ids_with(status)
    }

    /// Pending, unheld tasks that are waiting on dependencies
    pub fn blocked_tasks(&self) -> Vec<TaskId> {
        let inner = lock_mutex_recover(&self.inner);
        inner
            .records
            .iter()
            .filter(|r| r.status == TaskStatus::Pending && !r.held)
            .filter(|r| !inner.dependencies_met(&r.task))
            .map(|r| r.task.id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = lock_mutex_recover(&self.inner);
        let mut pending = inner.ids_with(TaskStatus::Pending);
        pending.extend(inner.ids_with(TaskStatus::Parked));
        QueueSnapshot {
            pending,
            in_progress: inner.ids_with(TaskStatus::InProgress),
            completed: inner.ids_with(TaskStatus::Completed),
            failed: inner.ids_with(TaskStatus::Failed),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = lock_mutex_recover(&self.inner);
        let mut stats = QueueStats::default();
        for record in &inner.records {
            match record.status {
                TaskStatus::Pending if record.held => stats.held += 1,
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Parked => stats.parked += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        lock_mutex_recover(&self.inner).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(id: &str, priority: u32, deps: &[&str]) -> Task {
        Task::new(id)
            .with_priority(priority)
            .with_dependencies(deps.iter().copied())
    }

    fn assert_disjoint(queue: &WorkQueue) {
        let snap = queue.snapshot();
        let mut seen = HashSet::new();
        for id in snap
            .pending
            .iter()
            .chain(&snap.in_progress)
            .chain(&snap.completed)
            .chain(&snap.failed)
        {
            assert!(seen.insert(id.clone()), "{} appears in two sets", id);
        }
    }

    #[test]
    fn test_priority_order_with_fifo_tie_break() {
        let queue = WorkQueue::new();
        queue.enqueue(vec![
            task("low", 3, &[]),
            task("first-urgent", 1, &[]),
            task("second-urgent", 1, &[]),
        ]);

        assert_eq!(queue.try_next_ready().unwrap().id, "first-urgent");
        assert_eq!(queue.try_next_ready().unwrap().id, "second-urgent");
        assert_eq!(queue.try_next_ready().unwrap().id, "low");
        assert!(queue.try_next_ready().is_none());
    }

    #[test]
    fn test_duplicates_ignored() {
        let queue = WorkQueue::new();
        assert_eq!(queue.enqueue(vec![task("a", 1, &[])]), 1);
        assert_eq!(queue.enqueue(vec![task("a", 0, &[]), task("b", 1, &[])]), 1);
        assert_eq!(queue.len(), 2);
        // The original record wins
        assert_eq!(queue.task("a").unwrap().priority, 1);
    }

    #[test]
    fn test_dependency_gating() {
        let queue = WorkQueue::new();
        queue.enqueue(vec![task("child", 0, &["parent"]), task("parent", 5, &[])]);

        let first = queue.try_next_ready().unwrap();
        assert_eq!(first.id, "parent");
        // Child is more urgent but its dependency is only in progress
        assert!(queue.try_next_ready().is_none());
        assert_eq!(queue.blocked_tasks(), vec!["child".to_string()]);

        queue.mark_completed("parent").unwrap();
        assert_eq!(queue.try_next_ready().unwrap().id, "child");
    }

    #[test]
    fn test_failed_dependency_keeps_dependent_blocked() {
        let queue = WorkQueue::new();
        queue.enqueue(vec![task("parent", 1, &[]), task("child", 1, &["parent"])]);
        queue.try_next_ready().unwrap();
        queue.mark_failed("parent").unwrap();
        assert!(queue.try_next_ready().is_none());
        assert!(!queue.has_ready());
    }

    #[test]
    fn test_unknown_dependency_is_ignored() {
        let queue = WorkQueue::new();
        queue.enqueue(vec![task("a", 1, &["never-seen"])]);
        assert_eq!(queue.try_next_ready().unwrap().id, "a");
    }

    #[test]
    fn test_cycle_never_ready() {
        let queue = WorkQueue::new();
        queue.enqueue(vec![task("a", 1, &["b"]), task("b", 1, &["a"])]);
        assert!(queue.try_next_ready().is_none());
        assert_eq!(queue.blocked_tasks().len(), 2);
    }

    #[test]
    fn test_defer_and_release() {
        let queue = WorkQueue::new();
        queue.enqueue(vec![task("a", 1, &[]), task("b", 2, &[])]);

        let a = queue.try_next_ready().unwrap();
        queue.defer(&a.id).unwrap();
        assert_eq!(queue.status("a"), Some(TaskStatus::Pending));
        assert!(queue.is_held("a"));

        // Held task is skipped even though it is more urgent
        assert_eq!(queue.try_next_ready().unwrap().id, "b");
        assert!(queue.try_next_ready().is_none());

        queue.release("a").unwrap();
        assert_eq!(queue.try_next_ready().unwrap().id, "a");
    }

    #[test]
    fn test_claim_bypasses_order() {
        let queue = WorkQueue::new();
        queue.enqueue(vec![task("a", 0, &[]), task("b", 5, &["a"])]);

        assert_eq!(queue.claim("b").unwrap().id, "b");
        assert_eq!(queue.status("b"), Some(TaskStatus::InProgress));
        assert_eq!(queue.try_next_ready().unwrap().id, "a");

        queue.mark_completed("b").unwrap();
        assert!(matches!(
            queue.claim("b"),
            Err(QueueError::Transition { .. })
        ));
    }

    #[test]
    fn test_parked_not_redispatched_until_reset() {
        let queue = WorkQueue::new();
        queue.enqueue(vec![task("a", 1, &[])]);
        queue.try_next_ready().unwrap();
        queue.park("a").unwrap();

        assert!(queue.try_next_ready().is_none());
        let snap = queue.snapshot();
        assert_eq!(snap.pending, vec!["a".to_string()]);
        assert!(snap.failed.is_empty());
        assert!(snap.completed.is_empty());

        queue.reset("a").unwrap();
        assert_eq!(queue.try_next_ready().unwrap().id, "a");
    }

    #[test]
    fn test_terminal_tasks_never_redispatched() {
        let queue = WorkQueue::new();
        queue.enqueue(vec![task("a", 1, &[]), task("b", 1, &[])]);
        queue.try_next_ready().unwrap();
        queue.try_next_ready().unwrap();
        queue.mark_completed("a").unwrap();
        queue.mark_failed("b").unwrap();

        // Re-enqueueing does nothing
        queue.enqueue(vec![task("a", 1, &[]), task("b", 1, &[])]);
        assert!(queue.try_next_ready().is_none());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let queue = WorkQueue::new();
        queue.enqueue(vec![task("a", 1, &[])]);
        assert!(matches!(
            queue.mark_completed("a"),
            Err(QueueError::Transition { .. })
        ));
        assert!(matches!(
            queue.mark_failed("missing"),
            Err(QueueError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_restore_applies_terminal_sets() {
        let queue = WorkQueue::new();
        queue.enqueue(vec![
            task("done", 1, &[]),
            task("broken", 1, &[]),
            task("next", 1, &["done", "archived"]),
        ]);

        queue.restore(
            &["done".to_string(), "archived".to_string()],
            &["broken".to_string()],
        );

        assert_eq!(queue.status("done"), Some(TaskStatus::Completed));
        assert_eq!(queue.status("broken"), Some(TaskStatus::Failed));
        assert_eq!(queue.status("archived"), Some(TaskStatus::Completed));
        assert_eq!(queue.try_next_ready().unwrap().id, "next");
        assert!(queue.try_next_ready().is_none());
    }

    #[test]
    fn test_sets_stay_disjoint() {
        let queue = WorkQueue::new();
        queue.enqueue((0..6).map(|i| task(&format!("t{}", i), i % 3, &[])));
        assert_disjoint(&queue);

        let t = queue.try_next_ready().unwrap();
        queue.mark_completed(&t.id).unwrap();
        assert_disjoint(&queue);
        let t = queue.try_next_ready().unwrap();
        queue.mark_failed(&t.id).unwrap();
        assert_disjoint(&queue);
        let t = queue.try_next_ready().unwrap();
        queue.defer(&t.id).unwrap();
        assert_disjoint(&queue);
        let t = queue.try_next_ready().unwrap();
        queue.park(&t.id).unwrap();
        assert_disjoint(&queue);
        queue.try_next_ready().unwrap();
        assert_disjoint(&queue);

        let stats = queue.stats();
        assert_eq!(
            stats.pending
                + stats.held
                + stats.in_progress
                + stats.completed
                + stats.failed
                + stats.parked,
            6
        );
    }

    #[tokio::test]
    async fn test_next_ready_non_blocking_returns_none() {
        let queue = WorkQueue::new();
        assert!(queue.next_ready(false).await.is_none());
    }

    #[tokio::test]
    async fn test_next_ready_blocks_until_dependency_completes() {
        let queue = Arc::new(WorkQueue::new());
        queue.enqueue(vec![task("parent", 1, &[]), task("child", 1, &["parent"])]);
        let parent = queue.next_ready(false).await.unwrap();
        assert_eq!(parent.id, "parent");

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_ready(true).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.mark_completed("parent").unwrap();
        let child = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(child.id, "child");
    }
}
