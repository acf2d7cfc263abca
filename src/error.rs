// Top-level error for an orchestrator run

use crate::config::ConfigError;
use crate::file_storage::StateError;
use crate::git::GitError;
use crate::lifecycle::LifecycleError;
use crate::parallel::merge_coordinator::MergeError;
use crate::parallel::pool::PoolError;
use crate::parallel::queue::QueueError;
use crate::parallel::workspace::WorkspaceError;
use crate::runner::RunnerError;
use crate::source::SourceError;
use thiserror::Error;

/// Anything that ends a run early. Per-task problems never end up here:
/// they are routed to the task's outcome instead.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Mainline checkout is on '{actual}', expected '{expected}'")]
    WrongBranch { expected: String, actual: String },
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
