//! Durable record of real task failures (`failures.jsonl`)
//!
//! One JSON object per line, appended. Transient failures never land here:
//! they say nothing about the task and are simply retried by a later run.

use super::{ensure_dir, StateError, StateResult};
use crate::models::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const FAILURES_FILE: &str = "failures.jsonl";

/// Where in the pipeline a task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// The runner reported a failure
    Task,
    /// The branch could not be merged cleanly
    MergeConflict,
    /// The merge could not be attempted or git failed
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub reason: String,
    pub kind: FailureStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(task_id: impl Into<TaskId>, kind: FailureStage, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            reason: reason.into(),
            kind,
            branch: None,
            files: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        if !branch.is_empty() {
            self.branch = Some(branch);
        }
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }
}

/// Append-only failure log
#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(FAILURES_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &FailureRecord) -> StateResult<()> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let line = serde_json::to_string(record).map_err(|source| StateError::Json {
            path: self.path.clone(),
            source,
        })?;

        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{}", line).map_err(io_err)?;
        Ok(())
    }

    /// Every readable record, oldest first. Lines that don't parse (a torn
    /// write from a crash) are skipped.
    pub fn read_all(&self) -> StateResult<Vec<FailureRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    log::warn!("[FailureLog] Skipping malformed line in {:?}: {}", self.path, e);
                    None
                }
            })
            .collect())
    }
}
