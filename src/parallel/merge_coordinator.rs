//! Merge Coordinator for Parallel Execution
//!
//! The only writer of the mainline working copy. Requests are consumed one
//! at a time, in arrival order, by a single tokio task:
//!
//! 1. commit lifecycle writes already sitting in the mainline
//! 2. stash local changes, lifecycle paths excluded
//! 3. `git merge --no-ff` the task branch
//! 4. restore the stash; on success remove the workspace and its branch
//!
//! A conflict aborts the merge, restores the stash and is reported. It is
//! never retried here and the workspace is kept for inspection.

use crate::git::{GitCli, GitError, StagedEntry};
use crate::lifecycle::{LifecycleError, LifecycleWriter};
use crate::models::{TaskId, WorkResult};
use crate::parallel::workspace::{Workspace, WorkspaceManager};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Mainline checkout is on '{actual}', expected '{expected}'")]
    WrongBranch { expected: String, actual: String },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Merge coordinator has stopped")]
    Stopped,
}

/// Where the coordinator is in handling the current request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePhase {
    Queued,
    Stashing,
    Merging,
    Merged,
    Conflict,
    RestoringStash,
    /// Also the idle state
    Done,
}

/// Information about merge conflicts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub task_id: TaskId,
    pub branch_name: String,
    pub conflicting_files: Vec<String>,
    pub reason: String,
    pub detected_at: String,
}

/// Result of a merge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { commit: Option<String> },
    Conflict(ConflictInfo),
    /// The merge never got going or failed without conflicting files
    Failed { reason: String },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged { .. })
    }
}

/// Work for the coordinator, processed strictly in order
#[derive(Debug)]
pub enum MergeCommand {
    Merge(WorkResult),
    /// Apply and commit a task's lifecycle completion write
    CompleteLifecycle(TaskId),
    /// Remove a workspace and its branch without merging
    Discard(Workspace),
    Shutdown,
}

/// Sent back for every `Merge` and `CompleteLifecycle` command
#[derive(Debug, Clone)]
pub enum MergeReport {
    Merge {
        task_id: TaskId,
        branch_name: String,
        outcome: MergeOutcome,
    },
    Lifecycle {
        task_id: TaskId,
        result: Result<bool, String>,
    },
}

/// Serializes every mutation of the mainline
pub struct MergeCoordinator {
    repo_root: PathBuf,
    mainline: String,
    git: GitCli,
    workspaces: Arc<WorkspaceManager>,
    lifecycle: Arc<dyn LifecycleWriter>,
    lifecycle_paths: Vec<String>,
    phase: watch::Sender<MergePhase>,
    merged: Vec<TaskId>,
}

impl MergeCoordinator {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        lifecycle: Arc<dyn LifecycleWriter>,
        git_timeout: Duration,
    ) -> Self {
        let repo_root = workspaces.repo_root().to_path_buf();
        let lifecycle_paths = lifecycle
            .lifecycle_paths()
            .iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .filter(|p| !p.is_empty())
            .collect();
        let (phase, _) = watch::channel(MergePhase::Done);
        Self {
            git: GitCli::new(&repo_root, git_timeout),
            mainline: workspaces.mainline().to_string(),
            repo_root,
            workspaces,
            lifecycle,
            lifecycle_paths,
            phase,
            merged: Vec::new(),
        }
    }

    pub fn phase(&self) -> MergePhase {
        *self.phase.borrow()
    }

    /// Tasks merged by this coordinator, in merge order
    pub fn merged(&self) -> &[TaskId] {
        &self.merged
    }

    fn set_phase(&self, phase: MergePhase) {
        log::debug!("[MergeCoordinator] Phase -> {:?}", phase);
        self.phase.send_replace(phase);
    }

    /// Run the coordinator on its own task
    pub fn spawn(self) -> (MergeHandle, mpsc::UnboundedReceiver<MergeReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let phase = self.phase.subscribe();
        let join = tokio::spawn(self.run(rx, reports_tx));
        (MergeHandle { tx, phase, join }, reports_rx)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<MergeCommand>,
        reports: mpsc::UnboundedSender<MergeReport>,
    ) {
        self.abort_stale_merge().await;

        while let Some(command) = rx.recv().await {
            let report = match command {
                MergeCommand::Merge(result) => {
                    let outcome = self.merge(&result).await;
                    Some(MergeReport::Merge {
                        task_id: result.task_id,
                        branch_name: result.branch_name,
                        outcome,
                    })
                }
                MergeCommand::CompleteLifecycle(task_id) => {
                    let result = self
                        .complete_lifecycle(&task_id)
                        .await
                        .map_err(|e| e.to_string());
                    if let Err(e) = &result {
                        log::warn!(
                            "[MergeCoordinator] Lifecycle completion for {} failed: {}",
                            task_id,
                            e
                        );
                    }
                    Some(MergeReport::Lifecycle { task_id, result })
                }
                MergeCommand::Discard(workspace) => {
                    self.workspaces.cleanup(&workspace).await;
                    None
                }
                MergeCommand::Shutdown => break,
            };
            if let Some(report) = report {
                if reports.send(report).is_err() {
                    log::debug!("[MergeCoordinator] Report receiver dropped");
                }
            }
        }

        log::info!(
            "[MergeCoordinator] Stopped after {} merge(s)",
            self.merged.len()
        );
    }

    /// Merge a task branch into the mainline
    pub async fn merge(&mut self, result: &WorkResult) -> MergeOutcome {
        log::info!(
            "[MergeCoordinator] Merging task {} from branch {}",
            result.task_id,
            result.branch_name
        );
        self.set_phase(MergePhase::Queued);

        if let Err(e) = self.verify_mainline().await {
            self.set_phase(MergePhase::Done);
            return self.failed(result, e.to_string());
        }
        if let Err(e) = self
            .commit_pending_lifecycle("Complete pending task lifecycle updates")
            .await
        {
            self.set_phase(MergePhase::Done);
            return self.failed(result, format!("Failed to commit lifecycle writes: {}", e));
        }

        self.set_phase(MergePhase::Stashing);
        let stashed = match self.stash_local(&result.task_id).await {
            Ok(stashed) => stashed,
            Err(e) => {
                self.set_phase(MergePhase::Done);
                return self.failed(result, format!("Failed to stash local changes: {}", e));
            }
        };

        self.set_phase(MergePhase::Merging);
        let message = format!("Merge task {} ({})", result.task_id, result.branch_name);
        let merge = self
            .git
            .output([
                "merge",
                "--no-ff",
                "--no-edit",
                "-m",
                message.as_str(),
                result.branch_name.as_str(),
            ])
            .await;

        let outcome = match merge {
            Ok(out) if out.success() => {
                self.set_phase(MergePhase::Merged);
                let commit = self.git.rev_parse("HEAD").await.ok().flatten();
                MergeOutcome::Merged { commit }
            }
            Ok(out) => {
                self.set_phase(MergePhase::Conflict);
                let files = self.conflicted_files().await;
                self.abort_merge().await;
                let reason = first_non_empty(&out.stderr, &out.stdout);
                if files.is_empty() {
                    MergeOutcome::Failed { reason }
                } else {
                    MergeOutcome::Conflict(ConflictInfo {
                        task_id: result.task_id.clone(),
                        branch_name: result.branch_name.clone(),
                        conflicting_files: files,
                        reason,
                        detected_at: chrono::Utc::now().to_rfc3339(),
                    })
                }
            }
            Err(e) => {
                self.set_phase(MergePhase::Conflict);
                self.abort_merge().await;
                MergeOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        if stashed {
            self.set_phase(MergePhase::RestoringStash);
            self.restore_stash().await;
        }

        match &outcome {
            MergeOutcome::Merged { commit } => {
                log::info!(
                    "[MergeCoordinator] Merged task {} ({})",
                    result.task_id,
                    commit.as_deref().unwrap_or("no commit")
                );
                self.workspaces
                    .cleanup(&Workspace {
                        task_id: result.task_id.clone(),
                        path: result.workspace_path.clone(),
                        branch: result.branch_name.clone(),
                    })
                    .await;
                self.merged.push(result.task_id.clone());
            }
            MergeOutcome::Conflict(info) => log::warn!(
                "[MergeCoordinator] Conflict merging task {}: {:?}",
                result.task_id,
                info.conflicting_files
            ),
            MergeOutcome::Failed { reason } => log::error!(
                "[MergeCoordinator] Merge of task {} failed: {}",
                result.task_id,
                reason
            ),
        }

        self.set_phase(MergePhase::Done);
        outcome
    }

    fn failed(&self, result: &WorkResult, reason: String) -> MergeOutcome {
        log::error!(
            "[MergeCoordinator] Not merging task {}: {}",
            result.task_id,
            reason
        );
        MergeOutcome::Failed { reason }
    }

    /// Apply a task's lifecycle write and commit it
    pub async fn complete_lifecycle(&self, task_id: &str) -> Result<bool, MergeError> {
        self.verify_mainline().await?;
        let changed = self.lifecycle.complete_lifecycle(&self.repo_root, task_id)?;
        let committed = self
            .commit_pending_lifecycle(&format!("Complete task {}", task_id))
            .await?;
        Ok(changed || committed)
    }

    async fn verify_mainline(&self) -> Result<(), MergeError> {
        let actual = self.git.current_branch().await?;
        if actual != self.mainline {
            return Err(MergeError::WrongBranch {
                expected: self.mainline.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Stage everything under the lifecycle paths and commit exactly the
    /// staged entries. Returns whether a commit was made.
    pub async fn commit_pending_lifecycle(&self, message: &str) -> Result<bool, MergeError> {
        if self.lifecycle_paths.is_empty() {
            return Ok(false);
        }

        for path in &self.lifecycle_paths {
            // A path that exists neither on disk nor in the index makes
            // `git add` fail; nothing to stage there anyway
            let out = self.git.output(["add", "-A", "--", path.as_str()]).await?;
            if !out.success() {
                log::debug!(
                    "[MergeCoordinator] Nothing to stage under {}: {}",
                    path,
                    out.stderr.trim()
                );
            }
        }

        let mut diff_args = vec!["diff", "--cached", "--name-status", "--no-renames", "--"];
        diff_args.extend(self.lifecycle_paths.iter().map(String::as_str));
        let staged = StagedEntry::parse_name_status(&self.git.run(&diff_args).await?);
        // A pure rename still shows up here as a delete plus an add
        if staged.is_empty() {
            return Ok(false);
        }

        let mut commit_args = vec!["commit", "--no-verify", "-m", message, "--"];
        commit_args.extend(staged.iter().map(|e| e.path.as_str()));
        self.git.run(&commit_args).await?;

        log::info!(
            "[MergeCoordinator] Committed {} lifecycle change(s): {}",
            staged.len(),
            message
        );
        Ok(true)
    }

    /// Stash local changes outside the lifecycle paths. Returns whether a
    /// stash entry was actually created.
    async fn stash_local(&self, task_id: &str) -> Result<bool, MergeError> {
        let before = self.git.rev_parse("refs/stash").await?;

        let message = format!("ralph-parallel: before merging {}", task_id);
        let excludes: Vec<String> = self
            .lifecycle_paths
            .iter()
            .map(|p| format!(":(exclude){}", p))
            .collect();
        let mut args = vec![
            "stash",
            "push",
            "--include-untracked",
            "-m",
            message.as_str(),
            "--",
            ".",
        ];
        args.extend(excludes.iter().map(String::as_str));
        self.git.run(&args).await?;

        let after = self.git.rev_parse("refs/stash").await?;
        let stashed = after.is_some() && after != before;
        if stashed {
            log::debug!("[MergeCoordinator] Stashed local changes before merging {}", task_id);
        }
        Ok(stashed)
    }

    async fn restore_stash(&self) {
        match self.git.output(["stash", "pop"]).await {
            Ok(out) if out.success() => {}
            Ok(out) => log::warn!(
                "[MergeCoordinator] Could not restore stashed changes, they remain in the stash: {}",
                first_non_empty(&out.stderr, &out.stdout)
            ),
            Err(e) => log::warn!(
                "[MergeCoordinator] Could not restore stashed changes, they remain in the stash: {}",
                e
            ),
        }
    }

    async fn conflicted_files(&self) -> Vec<String> {
        match self.git.output(["diff", "--name-only", "--diff-filter=U"]).await {
            Ok(out) => out.lines().map(str::to_string).collect(),
            Err(e) => {
                log::warn!("[MergeCoordinator] Failed to list conflicted files: {}", e);
                Vec::new()
            }
        }
    }

    async fn abort_merge(&self) {
        match self.git.rev_parse("MERGE_HEAD").await {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                log::warn!("[MergeCoordinator] Could not check MERGE_HEAD: {}", e);
                return;
            }
        }
        if let Err(e) = self.git.run(["merge", "--abort"]).await {
            log::warn!(
                "[MergeCoordinator] git merge --abort failed, resetting: {}",
                e
            );
            if let Err(e) = self.git.run(["reset", "--merge"]).await {
                log::error!("[MergeCoordinator] git reset --merge failed: {}", e);
            }
        }
    }

    /// A crash mid-merge leaves MERGE_HEAD behind
    async fn abort_stale_merge(&self) {
        if let Ok(Some(_)) = self.git.rev_parse("MERGE_HEAD").await {
            log::warn!("[MergeCoordinator] Aborting merge left over from an earlier run");
            self.abort_merge().await;
        }
    }
}

fn first_non_empty(a: &str, b: &str) -> String {
    let a = a.trim();
    if a.is_empty() {
        b.trim().to_string()
    } else {
        a.to_string()
    }
}

/// Sending side of a running coordinator
pub struct MergeHandle {
    tx: mpsc::UnboundedSender<MergeCommand>,
    phase: watch::Receiver<MergePhase>,
    join: JoinHandle<()>,
}

impl MergeHandle {
    pub fn request_merge(&self, result: WorkResult) -> Result<(), MergeError> {
        self.send(MergeCommand::Merge(result))
    }

    pub fn complete_lifecycle(&self, task_id: impl Into<TaskId>) -> Result<(), MergeError> {
        self.send(MergeCommand::CompleteLifecycle(task_id.into()))
    }

    pub fn discard(&self, workspace: Workspace) -> Result<(), MergeError> {
        self.send(MergeCommand::Discard(workspace))
    }

    fn send(&self, command: MergeCommand) -> Result<(), MergeError> {
        self.tx.send(command).map_err(|_| MergeError::Stopped)
    }

    pub fn phase(&self) -> MergePhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MergePhase> {
        self.phase.clone()
    }

    /// Let queued commands finish, then stop. Returns false if the
    /// coordinator had to be aborted after `timeout`.
    pub async fn shutdown(mut self, timeout: Duration) -> bool {
        if self.tx.send(MergeCommand::Shutdown).is_err() {
            log::debug!("[MergeCoordinator] Coordinator already stopped");
        }
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::error!("[MergeCoordinator] Coordinator task failed: {}", e);
                false
            }
            Err(_) => {
                log::warn!(
                    "[MergeCoordinator] Still busy after {:?}, aborting",
                    timeout
                );
                self.join.abort();
                false
            }
        }
    }
}
