//! Workspace Manager
//!
//! Each dispatched task runs in its own git worktree on a dedicated branch
//! created off the mainline. Directory and branch names carry a millisecond
//! timestamp so a task re-run in a later session never collides with
//! leftovers from an earlier one.

use crate::git::{GitCli, GitError, GitManager};
use crate::models::{Task, TaskId};
use crate::utils::{compact_timestamp, sanitize_branch_name, sanitize_path_component};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Prefix of every branch the engine creates
pub const BRANCH_PREFIX: &str = "ralph-parallel/";

/// Separates the sanitized task id from the timestamp in names
const NAME_SEPARATOR: &str = "--";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("Workspace {} is not on a branch", .0.display())]
    Detached(PathBuf),
}

/// An allocated worktree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: String,
}

/// A workspace left behind by an earlier, interrupted run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWorkspaceInfo {
    pub path: PathBuf,
    pub branch: String,
    /// Sanitized task id recovered from the directory name
    pub task_id: Option<String>,
    pub commits_ahead: usize,
    pub has_uncommitted: bool,
}

impl PendingWorkspaceInfo {
    pub fn has_pending_work(&self) -> bool {
        self.commits_ahead > 0 || self.has_uncommitted
    }

    pub fn workspace(&self) -> Workspace {
        Workspace {
            task_id: self.task_id.clone().unwrap_or_default(),
            path: self.path.clone(),
            branch: self.branch.clone(),
        }
    }
}

/// What to do with orphaned workspaces found at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceDisposition {
    /// Merge workspaces that carry work, then clean everything up
    MergePending,
    /// Throw every orphaned workspace away
    DiscardAll,
    /// Log what was found, then clean up as usual
    #[default]
    ReportOnly,
}

impl FromStr for WorkspaceDisposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "merge-pending" | "merge" => Ok(Self::MergePending),
            "discard-all" | "discard" => Ok(Self::DiscardAll),
            "report-only" | "report" => Ok(Self::ReportOnly),
            other => Err(format!(
                "Unknown workspace disposition '{}' (expected merge-pending, discard-all or report-only)",
                other
            )),
        }
    }
}

impl fmt::Display for WorkspaceDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MergePending => "merge-pending",
            Self::DiscardAll => "discard-all",
            Self::ReportOnly => "report-only",
        };
        f.write_str(s)
    }
}

/// Recover the sanitized task id from a `<id>--<timestamp>` directory name
pub fn task_id_from_dir_name(name: &str) -> Option<String> {
    let (id, ts) = name.rsplit_once(NAME_SEPARATOR)?;
    if id.is_empty() || ts.is_empty() || !ts.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(id.to_string())
}

/// Creates, inspects and destroys task worktrees
pub struct WorkspaceManager {
    repo_root: PathBuf,
    workspace_root: PathBuf,
    mainline: String,
    git: GitCli,
    /// Serializes `git worktree add` against the shared repository
    create_lock: tokio::sync::Mutex<()>,
}

impl WorkspaceManager {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        mainline: impl Into<String>,
        git_timeout: Duration,
    ) -> Self {
        let repo_root = repo_root.into();
        Self {
            git: GitCli::new(&repo_root, git_timeout),
            repo_root,
            workspace_root: workspace_root.into(),
            mainline: mainline.into(),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn mainline(&self) -> &str {
        &self.mainline
    }

    /// Keep the workspace root and the state directory out of the mainline's
    /// status and stashes by listing them in `.git/info/exclude`
    pub fn ensure_excluded(&self, extra: &[&Path]) -> Result<(), WorkspaceError> {
        let manager = GitManager::new(&self.repo_root)?;
        let info_dir = manager.repo_path().join("info");
        let exclude_path = info_dir.join("exclude");

        let existing = match fs::read_to_string(&exclude_path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(WorkspaceError::Io {
                    path: exclude_path,
                    source,
                })
            }
        };
        let present: HashSet<&str> = existing.lines().map(str::trim).collect();

        let mut missing = Vec::new();
        for dir in std::iter::once(self.workspace_root.as_path()).chain(extra.iter().copied()) {
            let Ok(rel) = dir.strip_prefix(&self.repo_root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if rel.is_empty() {
                continue;
            }
            let pattern = format!("/{}/", rel.trim_end_matches('/'));
            if !present.contains(pattern.as_str()) && !missing.contains(&pattern) {
                missing.push(pattern);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        for pattern in &missing {
            content.push_str(pattern);
            content.push('\n');
        }
        fs::create_dir_all(&info_dir).map_err(|source| WorkspaceError::Io {
            path: info_dir.clone(),
            source,
        })?;
        fs::write(&exclude_path, content).map_err(|source| WorkspaceError::Io {
            path: exclude_path.clone(),
            source,
        })?;
        log::debug!("[WorkspaceManager] Added {:?} to {:?}", missing, exclude_path);
        Ok(())
    }

    /// Drop worktree registrations whose directories are gone
    pub fn prune(&self) {
        match GitManager::new(&self.repo_root).and_then(|m| m.prune_orphaned_worktrees()) {
            Ok(0) => {}
            Ok(n) => log::info!("[WorkspaceManager] Pruned {} stale worktree(s)", n),
            Err(e) => log::warn!("[WorkspaceManager] Failed to prune worktrees: {}", e),
        }
    }

    /// Create a fresh worktree for a task, branched off the mainline
    pub async fn create(&self, task: &Task) -> Result<Workspace, WorkspaceError> {
        let _guard = self.create_lock.lock().await;

        fs::create_dir_all(&self.workspace_root).map_err(|source| WorkspaceError::Io {
            path: self.workspace_root.clone(),
            source,
        })?;

        let ts = compact_timestamp();
        let path = self.workspace_root.join(format!(
            "{}{}{}",
            sanitize_path_component(&task.id),
            NAME_SEPARATOR,
            ts
        ));
        let branch = format!(
            "{}{}{}{}",
            BRANCH_PREFIX,
            sanitize_branch_name(&task.id),
            NAME_SEPARATOR,
            ts
        );

        self.git
            .run([
                OsStr::new("worktree"),
                OsStr::new("add"),
                OsStr::new("-b"),
                OsStr::new(&branch),
                path.as_os_str(),
                OsStr::new(&self.mainline),
            ])
            .await?;

        log::info!(
            "[WorkspaceManager] Created workspace for {} at {:?} on branch {}",
            task.id,
            path,
            branch
        );

        Ok(Workspace {
            task_id: task.id.clone(),
            path,
            branch,
        })
    }

    /// Commit anything the runner left uncommitted. Returns whether a commit
    /// was made.
    pub async fn commit_all(
        &self,
        workspace: &Workspace,
        message: &str,
    ) -> Result<bool, WorkspaceError> {
        let git = self.git.with_dir(&workspace.path);
        let status = git.run(["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Ok(false);
        }
        git.run(["add", "-A"]).await?;
        git.run(["commit", "--no-verify", "-m", message]).await?;
        log::debug!(
            "[WorkspaceManager] Committed leftover changes in {:?}",
            workspace.path
        );
        Ok(true)
    }

    /// Every workspace directory not belonging to a tracked task.
    ///
    /// A directory that can't be inspected is logged and skipped.
    pub fn scan_orphans(&self, tracked: &[TaskId]) -> Vec<PendingWorkspaceInfo> {
        let entries = match fs::read_dir(&self.workspace_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                log::warn!(
                    "[WorkspaceManager] Cannot read workspace root {:?}: {}",
                    self.workspace_root,
                    e
                );
                return Vec::new();
            }
        };
        let tracked: HashSet<String> = tracked.iter().map(|id| sanitize_path_component(id)).collect();

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let task_id = task_id_from_dir_name(&name);
            if task_id.as_ref().is_some_and(|id| tracked.contains(id)) {
                continue;
            }
            match self.inspect(&path, task_id) {
                Ok(info) => found.push(info),
                Err(e) => log::warn!(
                    "[WorkspaceManager] Skipping workspace {:?}: {}",
                    path,
                    e
                ),
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        found
    }

    fn inspect(
        &self,
        path: &Path,
        task_id: Option<String>,
    ) -> Result<PendingWorkspaceInfo, WorkspaceError> {
        let manager = GitManager::new(path)?;
        let branch = manager
            .current_branch()?
            .ok_or_else(|| WorkspaceError::Detached(path.to_path_buf()))?;
        Ok(PendingWorkspaceInfo {
            path: path.to_path_buf(),
            commits_ahead: manager.commits_ahead_of(&self.mainline)?,
            has_uncommitted: manager.has_uncommitted_changes()?,
            branch,
            task_id,
        })
    }

    /// Remove the worktree, its directory and its branch. Failures are logged.
    pub async fn cleanup(&self, workspace: &Workspace) {
        if workspace.path.exists() {
            let removed = self
                .git
                .output([
                    OsStr::new("worktree"),
                    OsStr::new("remove"),
                    OsStr::new("--force"),
                    workspace.path.as_os_str(),
                ])
                .await;
            match removed {
                Ok(out) if out.success() => {}
                Ok(out) => log::warn!(
                    "[WorkspaceManager] git worktree remove failed for {:?}: {}",
                    workspace.path,
                    out.stderr.trim()
                ),
                Err(e) => log::warn!(
                    "[WorkspaceManager] git worktree remove failed for {:?}: {}",
                    workspace.path,
                    e
                ),
            }
        }

        if workspace.path.exists() {
            if let Err(e) = fs::remove_dir_all(&workspace.path) {
                log::warn!(
                    "[WorkspaceManager] Failed to remove workspace directory {:?}: {}",
                    workspace.path,
                    e
                );
            }
        }
        self.prune();

        if !workspace.branch.is_empty() {
            let deleted =
                GitManager::new(&self.repo_root).and_then(|m| m.delete_branch(&workspace.branch));
            if let Err(e) = deleted {
                log::warn!(
                    "[WorkspaceManager] Failed to delete branch {}: {}",
                    workspace.branch,
                    e
                );
            }
        }

        log::info!(
            "[WorkspaceManager] Cleaned up workspace {:?} ({})",
            workspace.path,
            workspace.branch
        );
    }
}
