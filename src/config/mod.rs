// Orchestrator configuration
//
// Layered: defaults -> global (~/.config/ralph-parallel/config.toml)
// -> project (<repo>/.ralph-parallel/config.toml) -> CLI overrides.

pub mod loader;

pub use loader::{ConfigLoader, ConfigOverrides};

use crate::parallel::pool::PoolConfig;
use crate::parallel::workspace::WorkspaceDisposition;
use crate::runner::command::DEFAULT_CLOSE_MARKER;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Full configuration of a run
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Scheduling and timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    /// Concurrent worker slots
    #[serde(rename = "maxWorkers", alias = "max_workers", default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-task runner timeout
    #[serde(rename = "taskTimeoutSecs", alias = "task_timeout_secs", default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// How long shutdown waits for workers and merges before killing runners
    #[serde(rename = "shutdownTimeoutSecs", alias = "shutdown_timeout_secs", default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Upper bound on one control loop wait
    #[serde(rename = "pollIntervalMs", alias = "poll_interval_ms", default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(rename = "persistIntervalSecs", alias = "persist_interval_secs", default = "default_persist_interval")]
    pub persist_interval_secs: u64,
    /// How often the task source is asked for new tasks; 0 disables rescans
    #[serde(rename = "rescanIntervalSecs", alias = "rescan_interval_secs", default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,
    /// Commit what a successful runner left uncommitted
    #[serde(rename = "autoCommit", alias = "auto_commit", default = "default_true")]
    pub auto_commit: bool,
}

fn default_max_workers() -> usize { 3 }
fn default_task_timeout() -> u64 { 30 * 60 }
fn default_shutdown_timeout() -> u64 { 60 }
fn default_poll_interval() -> u64 { 500 }
fn default_persist_interval() -> u64 { 30 }
fn default_rescan_interval() -> u64 { 60 }
fn default_true() -> bool { true }

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            task_timeout_secs: default_task_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            poll_interval_ms: default_poll_interval(),
            persist_interval_secs: default_persist_interval(),
            rescan_interval_secs: default_rescan_interval(),
            auto_commit: default_true(),
        }
    }
}

/// Repository and workspace settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitConfig {
    /// Branch every task branches off and merges back into
    #[serde(default = "default_mainline")]
    pub mainline: String,
    /// Bound on every git invocation
    #[serde(rename = "timeoutSecs", alias = "timeout_secs", default = "default_git_timeout")]
    pub timeout_secs: u64,
    /// Where worktrees are created, relative to the repository root
    #[serde(rename = "workspaceDir", alias = "workspace_dir", default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    /// What to do with workspaces left by an earlier run
    #[serde(rename = "workspaceDisposition", alias = "workspace_disposition", default)]
    pub workspace_disposition: WorkspaceDisposition,
}

fn default_mainline() -> String { "main".to_string() }
fn default_git_timeout() -> u64 { 120 }
fn default_workspace_dir() -> PathBuf { PathBuf::from(".ralph-parallel/worktrees") }

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            mainline: default_mainline(),
            timeout_secs: default_git_timeout(),
            workspace_dir: default_workspace_dir(),
            workspace_disposition: WorkspaceDisposition::default(),
        }
    }
}

/// Task directories, relative to the repository root
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TasksConfig {
    #[serde(rename = "activeDir", alias = "active_dir", default = "default_active_dir")]
    pub active_dir: PathBuf,
    #[serde(rename = "doneDir", alias = "done_dir", default = "default_done_dir")]
    pub done_dir: PathBuf,
}

fn default_active_dir() -> PathBuf { PathBuf::from("tasks/active") }
fn default_done_dir() -> PathBuf { PathBuf::from("tasks/done") }

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            active_dir: default_active_dir(),
            done_dir: default_done_dir(),
        }
    }
}

/// External command run once per task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Output line that asks for the task to be closed
    #[serde(rename = "closeMarker", alias = "close_marker", default = "default_close_marker")]
    pub close_marker: String,
}

fn default_close_marker() -> String { DEFAULT_CLOSE_MARKER.to_string() }

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            close_marker: default_close_marker(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.execution.max_workers == 0 {
            return invalid("maxWorkers must be greater than 0");
        }
        if self.execution.task_timeout_secs == 0 {
            return invalid("taskTimeoutSecs must be greater than 0");
        }
        if self.execution.shutdown_timeout_secs == 0 {
            return invalid("shutdownTimeoutSecs must be greater than 0");
        }
        if self.execution.poll_interval_ms == 0 {
            return invalid("pollIntervalMs must be greater than 0");
        }
        if self.execution.persist_interval_secs == 0 {
            return invalid("persistIntervalSecs must be greater than 0");
        }
        if self.git.timeout_secs == 0 {
            return invalid("git timeoutSecs must be greater than 0");
        }
        if self.git.mainline.trim().is_empty() {
            return invalid("mainline branch must not be empty");
        }
        if self.git.workspace_dir.as_os_str().is_empty() {
            return invalid("workspaceDir must not be empty");
        }
        if self
            .runner
            .command
            .as_deref()
            .is_some_and(|c| c.trim().is_empty())
        {
            return invalid("runner command must not be empty");
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.task_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.shutdown_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.execution.poll_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.execution.persist_interval_secs)
    }

    /// `None` when rescanning is disabled
    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.execution.rescan_interval_secs > 0)
            .then(|| Duration::from_secs(self.execution.rescan_interval_secs))
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git.timeout_secs)
    }

    pub fn workspace_root(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.git.workspace_dir)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_workers: self.execution.max_workers,
            task_timeout: self.task_timeout(),
            auto_commit: self.execution.auto_commit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.execution.max_workers, 3);
        assert_eq!(config.git.mainline, "main");
        assert_eq!(config.git.workspace_disposition, WorkspaceDisposition::ReportOnly);
        assert_eq!(config.runner.close_marker, DEFAULT_CLOSE_MARKER);
    }

    #[test]
    fn test_camel_case_and_snake_case_keys() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
            [execution]
            maxWorkers = 5
            task_timeout_secs = 60

            [git]
            mainline = "trunk"
            workspaceDisposition = "merge-pending"

            [runner]
            command = "agent"
            args = ["--task", "{task_id}"]
            "#,
        )
        .unwrap();

        assert_eq!(config.execution.max_workers, 5);
        assert_eq!(config.task_timeout(), Duration::from_secs(60));
        assert_eq!(config.execution.poll_interval_ms, 500);
        assert_eq!(config.git.mainline, "trunk");
        assert_eq!(config.git.workspace_disposition, WorkspaceDisposition::MergePending);
        assert_eq!(config.runner.command.as_deref(), Some("agent"));
        assert_eq!(config.tasks, TasksConfig::default());
    }

    #[test]
    fn test_validation() {
        let mut config = OrchestratorConfig::default();
        config.execution.max_workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = OrchestratorConfig::default();
        config.git.mainline = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.runner.command = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rescan_can_be_disabled() {
        let mut config = OrchestratorConfig::default();
        assert_eq!(config.rescan_interval(), Some(Duration::from_secs(60)));
        config.execution.rescan_interval_secs = 0;
        assert!(config.rescan_interval().is_none());
    }

    #[test]
    fn test_derived_settings() {
        let config = OrchestratorConfig::default();
        assert_eq!(
            config.workspace_root(Path::new("/repo")),
            PathBuf::from("/repo/.ralph-parallel/worktrees")
        );
        let pool = config.pool_config();
        assert_eq!(pool.max_workers, 3);
        assert!(pool.auto_commit);
    }
}
