//! Core GitManager implementation
//!
//! git2-backed inspection of the mainline and of task worktrees. Nothing here
//! touches a working tree except `stage_paths`, which only updates the index.

use git2::{BranchType, Repository, Status, StatusOptions, Worktree};
use std::path::{Path, PathBuf};

use super::types::{FileStatus, WorktreeInfo};
use super::GitError;

/// Git manager for repository operations
pub struct GitManager {
    pub(crate) repo: Repository,
}

impl GitManager {
    /// Open the repository (or worktree) at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let repo = Repository::open(path)?;
        Ok(Self { repo })
    }

    /// Get the repository's .git path
    pub fn repo_path(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.repo.workdir()
    }

    /// Current branch name, `None` when HEAD is detached or unborn
    pub fn current_branch(&self) -> Result<Option<String>, GitError> {
        let head = match self.repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !head.is_branch() {
            return Ok(None);
        }
        Ok(head.shorthand().map(|s| s.to_string()))
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    /// Delete a local branch
    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.delete()?;
        Ok(())
    }

    /// Number of commits HEAD has that `base` doesn't
    pub fn commits_ahead_of(&self, base: &str) -> Result<usize, GitError> {
        let head = self.repo.head()?.peel_to_commit()?.id();
        let base = self
            .repo
            .find_branch(base, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .id();
        let (ahead, _behind) = self.repo.graph_ahead_behind(head, base)?;
        Ok(ahead)
    }

    /// Working tree or index changes, untracked files included
    pub fn get_status(&self) -> Result<Vec<FileStatus>, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .exclude_submodules(true);

        let statuses = self.repo.statuses(Some(&mut opts))?;

        let mut result = Vec::new();
        for entry in statuses.iter() {
            if let Some(path) = entry.path() {
                result.push(FileStatus {
                    path: path.to_string(),
                    status: status_to_string(entry.status()),
                });
            }
        }

        Ok(result)
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool, GitError> {
        Ok(!self.get_status()?.is_empty())
    }

    /// Stage the given workdir-relative paths: present files are added,
    /// missing ones removed from the index
    pub fn stage_paths(&self, paths: &[&Path]) -> Result<(), GitError> {
        let workdir = self
            .repo
            .workdir()
            .ok_or_else(|| git2::Error::from_str("Repository has no working directory"))?
            .to_path_buf();
        let mut index = self.repo.index()?;
        for path in paths {
            if workdir.join(path).exists() {
                index.add_path(path)?;
            } else {
                index.remove_path(path)?;
            }
        }
        index.write()?;
        Ok(())
    }

    /// List all linked worktrees
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let worktrees = self.repo.worktrees()?;

        let mut result = Vec::new();
        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                result.push(worktree_to_info(&worktree));
            }
        }

        Ok(result)
    }

    /// Prune worktree registrations whose directory no longer exists
    pub fn prune_orphaned_worktrees(&self) -> Result<u32, GitError> {
        let worktrees = self.repo.worktrees()?;
        let mut pruned_count = 0;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                let worktree_path = worktree.path();
                if !worktree_path.exists() {
                    log::info!(
                        "[Git] Pruning orphaned worktree '{}' (path {:?} no longer exists)",
                        name,
                        worktree_path
                    );
                    if let Err(e) = worktree.prune(None) {
                        log::warn!("[Git] Failed to prune worktree '{}': {}", name, e);
                    } else {
                        pruned_count += 1;
                    }
                }
            }
        }

        Ok(pruned_count)
    }
}

fn status_to_string(status: Status) -> String {
    let mut result = Vec::new();

    if status.contains(Status::INDEX_NEW) || status.contains(Status::WT_NEW) {
        result.push("new");
    }
    if status.contains(Status::INDEX_MODIFIED) || status.contains(Status::WT_MODIFIED) {
        result.push("modified");
    }
    if status.contains(Status::INDEX_DELETED) || status.contains(Status::WT_DELETED) {
        result.push("deleted");
    }
    if status.contains(Status::INDEX_RENAMED) || status.contains(Status::WT_RENAMED) {
        result.push("renamed");
    }
    if status.contains(Status::CONFLICTED) {
        result.push("conflicted");
    }

    if result.is_empty() {
        "unknown".to_string()
    } else {
        result.join(", ")
    }
}

fn worktree_to_info(worktree: &Worktree) -> WorktreeInfo {
    let name = worktree.name().unwrap_or("").to_string();
    let path = worktree.path().to_string_lossy().to_string();
    let is_locked = worktree
        .is_locked()
        .map(|status| !matches!(status, git2::WorktreeLockStatus::Unlocked))
        .unwrap_or(false);

    let branch = Repository::open(worktree.path())
        .ok()
        .and_then(|wt_repo| {
            let head = wt_repo.head().ok()?;
            if head.is_branch() {
                head.shorthand().map(|s| s.to_string())
            } else {
                None
            }
        });

    WorktreeInfo {
        name,
        path,
        branch,
        is_locked,
    }
}
