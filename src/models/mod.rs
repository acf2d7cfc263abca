// Data models shared by the queue, pool, merge coordinator and orchestrator

pub mod state_machine;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Stable, unique task identifier
pub type TaskId = String;

/// Default priority tier for tasks that don't declare one
pub const DEFAULT_PRIORITY: u32 = 2;

/// Queue status of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Interrupted or transiently failed during this run; left unresolved
    Parked,
}

/// A unit of backlog work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Lower tier = more urgent
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(rename = "type", alias = "task_type", default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Paths the task is expected to touch
    #[serde(default)]
    pub files: BTreeSet<String>,
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

fn default_task_type() -> String {
    "task".to_string()
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            description: String::new(),
            priority: DEFAULT_PRIORITY,
            task_type: default_task_type(),
            dependencies: BTreeSet::new(),
            files: BTreeSet::new(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }
}

/// How a dispatched task ended.
///
/// Interruption is never a failure: the task wasn't given the chance to finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure { reason: String },
    Interrupted,
    /// Interrupted after the runner had already asked for the task to be closed
    InterruptedButClose,
}

/// Result of a single dispatched task, produced exactly once per dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkResult {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    /// Empty when no workspace could be allocated
    pub branch_name: String,
    pub workspace_path: PathBuf,
    /// Tail of the runner's output, for diagnostics
    pub output: String,
    pub duration_secs: f64,
}

impl WorkResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Success)
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(
            self.outcome,
            TaskOutcome::Interrupted | TaskOutcome::InterruptedButClose
        )
    }

    pub fn close_verdict(&self) -> bool {
        matches!(self.outcome, TaskOutcome::InterruptedButClose)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            TaskOutcome::Failure { reason } => Some(reason),
            _ => None,
        }
    }

    /// Whether a workspace was actually allocated for this result
    pub fn has_workspace(&self) -> bool {
        !self.branch_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: TaskOutcome) -> WorkResult {
        WorkResult {
            task_id: "t1".to_string(),
            outcome,
            branch_name: "ralph-parallel/t1".to_string(),
            workspace_path: PathBuf::from("/tmp/t1"),
            output: String::new(),
            duration_secs: 0.0,
        }
    }

    #[test]
    fn test_task_deserializes_with_defaults() {
        let task: Task = serde_json::from_str(r#"{"id": "fix-login"}"#).unwrap();
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.task_type, "task");
        assert!(task.dependencies.is_empty());
        assert!(task.files.is_empty());
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new("a")
            .with_priority(0)
            .with_dependencies(["b", "c"])
            .with_files(["src/lib.rs"]);
        assert_eq!(task.title, "a");
        assert_eq!(task.priority, 0);
        assert_eq!(task.dependencies.len(), 2);
        assert!(task.files.contains("src/lib.rs"));
    }

    #[test]
    fn test_outcome_flags() {
        assert!(result(TaskOutcome::Success).is_success());
        assert!(!result(TaskOutcome::Success).is_interrupted());

        let interrupted = result(TaskOutcome::Interrupted);
        assert!(interrupted.is_interrupted());
        assert!(!interrupted.close_verdict());
        assert!(interrupted.error().is_none());

        let close = result(TaskOutcome::InterruptedButClose);
        assert!(close.is_interrupted());
        assert!(close.close_verdict());

        let failed = result(TaskOutcome::Failure {
            reason: "boom".to_string(),
        });
        assert_eq!(failed.error(), Some("boom"));
        assert!(!failed.is_interrupted());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&TaskOutcome::Failure {
            reason: "x".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"failure","reason":"x"}"#);
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
