//! Task runners
//!
//! What a task actually does once dispatched is up to the runner. The pool
//! only needs a future that resolves to a [`RunOutput`], honours the
//! cancellation token, and may raise the [`VerdictFlag`] at any point to say
//! "this task should be closed even if I'm cut off".

pub mod command;

pub use command::CommandRunner;

use crate::models::Task;
use crate::parallel::workspace::Workspace;
use futures_util::future::BoxFuture;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Runner program not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Runner I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run was cancelled")]
    Cancelled,
}

/// Shared flag a runner raises to request that its task be closed
#[derive(Debug, Clone, Default)]
pub struct VerdictFlag(Arc<AtomicBool>);

impl VerdictFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a runner gets for one invocation
#[derive(Debug, Clone)]
pub struct RunContext {
    pub task: Task,
    pub workspace: Workspace,
    /// Cancelled when the pool terminates in-flight work
    pub cancel: CancellationToken,
    pub verdict: VerdictFlag,
}

/// What a finished invocation reports
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub success: bool,
    /// Failure description, used for transient/real classification
    pub reason: Option<String>,
    /// Tail of the captured output
    pub output: String,
    pub exit_code: Option<i32>,
}

impl RunOutput {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: None,
            output: output.into(),
            exit_code: Some(0),
        }
    }

    pub fn failed(reason: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            output: output.into(),
            exit_code: None,
        }
    }
}

/// Executes a task inside its workspace
pub trait TaskRunner: Send + Sync {
    fn run(&self, ctx: RunContext) -> BoxFuture<'_, Result<RunOutput, RunnerError>>;
}
