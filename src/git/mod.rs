//! Git operations
//!
//! Two layers, used for different jobs:
//! - `command` - the `git` executable, driven as a subprocess with a timeout.
//!   Every mutation of the mainline or of worktree registrations goes here.
//! - `manager` - git2-rs, for read-only inspection (ahead counts, status),
//!   index staging and branch deletion.
//! - `types` - Shared data structures

mod command;
mod manager;
mod types;

pub use command::{GitCli, GitOutput};
pub use manager::GitManager;
pub use types::{FileStatus, StagedEntry, WorktreeInfo};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git {command} timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("git {command} failed (exit {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Repository error: {0}")]
    Repository(#[from] git2::Error),
}
