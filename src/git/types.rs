//! Git data types and structures

use serde::{Deserialize, Serialize};

/// Represents a git worktree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub name: String,
    pub path: String,
    pub branch: Option<String>,
    pub is_locked: bool,
}

/// Represents a file status in git
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: String,
    pub status: String,
}

/// One line of `git diff --cached --name-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedEntry {
    /// Status letter (A, M, D, ...)
    pub status: char,
    pub path: String,
}

impl StagedEntry {
    /// Parse `<status>\t<path>` lines; anything else is skipped
    pub fn parse_name_status(output: &str) -> Vec<StagedEntry> {
        output
            .lines()
            .filter_map(|line| {
                let (status, path) = line.split_once('\t')?;
                let status = status.trim().chars().next()?;
                let path = path.trim();
                if path.is_empty() {
                    return None;
                }
                Some(StagedEntry {
                    status,
                    path: path.to_string(),
                })
            })
            .collect()
    }
}
