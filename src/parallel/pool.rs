//! Worker Pool
//!
//! A bounded number of slots, each running one task in its own workspace.
//! Results are reported on an unbounded channel so a slow consumer never
//! stalls a finishing worker.
//!
//! A task that is cut off, by its timeout or by `terminate_all_processes`,
//! is reported as interrupted and never as failed.

use crate::models::{Task, TaskId, TaskOutcome, WorkResult};
use crate::parallel::workspace::{Workspace, WorkspaceManager};
use crate::runner::{RunContext, RunnerError, TaskRunner, VerdictFlag};
use crate::utils::lock_mutex_recover;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is saturated ({active}/{max} slots in use)")]
    Saturated { active: usize, max: usize },

    #[error("Worker pool is shutting down")]
    ShuttingDown,
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub task_timeout: Duration,
    /// Commit leftover workspace changes when a runner succeeds
    pub auto_commit: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            task_timeout: Duration::from_secs(30 * 60),
            auto_commit: true,
        }
    }
}

/// Holds one slot for the lifetime of a worker, panics included
struct SlotGuard {
    active: Arc<AtomicUsize>,
    running: Arc<Mutex<HashSet<TaskId>>>,
    task_id: TaskId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        lock_mutex_recover(&self.running).remove(&self.task_id);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded pool of concurrent task workers
pub struct WorkerPool {
    config: PoolConfig,
    workspaces: Arc<WorkspaceManager>,
    runner: Arc<dyn TaskRunner>,
    active: Arc<AtomicUsize>,
    running: Arc<Mutex<HashSet<TaskId>>>,
    /// Parent of every worker's token
    cancel: CancellationToken,
    results_tx: mpsc::UnboundedSender<WorkResult>,
}

impl WorkerPool {
    /// Create a pool and the receiving end of its completion channel
    pub fn new(
        config: PoolConfig,
        workspaces: Arc<WorkspaceManager>,
        runner: Arc<dyn TaskRunner>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkResult>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let pool = Self {
            config,
            workspaces,
            runner,
            active: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancellationToken::new(),
            results_tx,
        };
        (pool, results_rx)
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    /// Number of occupied slots
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn available_slots(&self) -> usize {
        self.config.max_workers.saturating_sub(self.active_count())
    }

    pub fn is_saturated(&self) -> bool {
        self.available_slots() == 0
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ids of tasks currently holding a slot
    pub fn running_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = lock_mutex_recover(&self.running).iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a task in a free slot. Exactly one `WorkResult` for it will
    /// arrive on the completion channel.
    pub fn submit(&self, task: Task) -> Result<JoinHandle<()>, PoolError> {
        if self.cancel.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let max = self.config.max_workers;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|active| PoolError::Saturated { active, max })?;

        lock_mutex_recover(&self.running).insert(task.id.clone());
        let guard = SlotGuard {
            active: self.active.clone(),
            running: self.running.clone(),
            task_id: task.id.clone(),
        };

        log::info!(
            "[WorkerPool] Dispatching task {} ({}/{} slots in use)",
            task.id,
            self.active_count(),
            max
        );

        let workspaces = self.workspaces.clone();
        let runner = self.runner.clone();
        let cancel = self.cancel.child_token();
        let config = self.config.clone();
        let tx = self.results_tx.clone();

        Ok(tokio::spawn(async move {
            let result = run_task(task, &workspaces, runner.as_ref(), &config, cancel).await;
            // Free the slot before reporting so the consumer sees it available
            drop(guard);
            if tx.send(result).is_err() {
                log::warn!("[WorkerPool] Completion channel closed, result dropped");
            }
        }))
    }

    /// Cancel every in-flight invocation. Their results still arrive, as
    /// interrupted. No new tasks are accepted afterwards.
    pub fn terminate_all_processes(&self) {
        if !self.cancel.is_cancelled() {
            log::warn!(
                "[WorkerPool] Terminating {} in-flight task(s)",
                self.active_count()
            );
            self.cancel.cancel();
        }
    }
}

fn interrupted(verdict: &VerdictFlag) -> TaskOutcome {
    if verdict.is_raised() {
        TaskOutcome::InterruptedButClose
    } else {
        TaskOutcome::Interrupted
    }
}

async fn run_task(
    task: Task,
    workspaces: &WorkspaceManager,
    runner: &dyn TaskRunner,
    config: &PoolConfig,
    cancel: CancellationToken,
) -> WorkResult {
    let started = Instant::now();

    let workspace = match workspaces.create(&task).await {
        Ok(ws) => ws,
        Err(e) => {
            log::error!(
                "[WorkerPool] Failed to allocate workspace for {}: {}",
                task.id,
                e
            );
            return WorkResult {
                task_id: task.id,
                outcome: TaskOutcome::Failure {
                    reason: format!("Failed to allocate workspace: {}", e),
                },
                branch_name: String::new(),
                workspace_path: PathBuf::new(),
                output: String::new(),
                duration_secs: started.elapsed().as_secs_f64(),
            };
        }
    };

    let verdict = VerdictFlag::new();
    let ctx = RunContext {
        task: task.clone(),
        workspace: workspace.clone(),
        cancel: cancel.clone(),
        verdict: verdict.clone(),
    };

    let (outcome, output) = match tokio::time::timeout(config.task_timeout, runner.run(ctx)).await
    {
        Err(_) => {
            log::warn!(
                "[WorkerPool] Task {} timed out after {:?}",
                task.id,
                config.task_timeout
            );
            cancel.cancel();
            (interrupted(&verdict), String::new())
        }
        Ok(Err(RunnerError::Cancelled)) => {
            log::info!("[WorkerPool] Task {} was terminated", task.id);
            (interrupted(&verdict), String::new())
        }
        Ok(Ok(out)) if out.success => {
            let outcome = if config.auto_commit {
                commit_leftovers(workspaces, &task, &workspace).await
            } else {
                TaskOutcome::Success
            };
            (outcome, out.output)
        }
        // A runner that exits non-zero because it was killed was still cut off
        Ok(_) if cancel.is_cancelled() => (interrupted(&verdict), String::new()),
        Ok(Err(e)) => (
            TaskOutcome::Failure {
                reason: e.to_string(),
            },
            String::new(),
        ),
        Ok(Ok(out)) => (
            TaskOutcome::Failure {
                reason: out
                    .reason
                    .unwrap_or_else(|| "Runner reported failure".to_string()),
            },
            out.output,
        ),
    };

    let duration_secs = started.elapsed().as_secs_f64();
    log::info!(
        "[WorkerPool] Task {} finished in {:.1}s: {:?}",
        task.id,
        duration_secs,
        outcome
    );

    WorkResult {
        task_id: task.id,
        outcome,
        branch_name: workspace.branch,
        workspace_path: workspace.path,
        output,
        duration_secs,
    }
}

async fn commit_leftovers(
    workspaces: &WorkspaceManager,
    task: &Task,
    workspace: &Workspace,
) -> TaskOutcome {
    let message = format!("Task {}: {}", task.id, task.title);
    match workspaces.commit_all(workspace, &message).await {
        Ok(_) => TaskOutcome::Success,
        Err(e) => TaskOutcome::Failure {
            reason: format!("Failed to commit task changes: {}", e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::setup_test_repo;
    use crate::git::GitManager;
    use crate::runner::{RunOutput, RunnerError};
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::path::Path;

    /// Runner scripted in-process
    #[derive(Default)]
    struct FakeRunner {
        sleep: Duration,
        raise_verdict: bool,
        fail_with: Option<String>,
        write_file: Option<&'static str>,
    }

    impl TaskRunner for FakeRunner {
        fn run(&self, ctx: RunContext) -> BoxFuture<'_, Result<RunOutput, RunnerError>> {
            async move {
                if self.raise_verdict {
                    ctx.verdict.raise();
                }
                if let Some(name) = self.write_file {
                    std::fs::write(ctx.workspace.path.join(name), "work").unwrap();
                }
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(RunnerError::Cancelled),
                    _ = tokio::time::sleep(self.sleep) => {}
                }
                match &self.fail_with {
                    Some(reason) => Ok(RunOutput::failed(reason.clone(), "")),
                    None => Ok(RunOutput::succeeded("ok")),
                }
            }
            .boxed()
        }
    }

    fn pool(
        repo: &Path,
        mainline: &str,
        config: PoolConfig,
        runner: FakeRunner,
    ) -> (WorkerPool, mpsc::UnboundedReceiver<WorkResult>) {
        let workspaces = Arc::new(WorkspaceManager::new(
            repo,
            repo.join(".worktrees"),
            mainline,
            Duration::from_secs(30),
        ));
        WorkerPool::new(config, workspaces, Arc::new(runner))
    }

    fn config(max_workers: usize, timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            max_workers,
            task_timeout: Duration::from_millis(timeout_ms),
            auto_commit: true,
        }
    }

    #[tokio::test]
    async fn test_success_commits_and_frees_slot() {
        let (temp_dir, _repo) = setup_test_repo();
        let runner = FakeRunner {
            write_file: Some("out.txt"),
            ..Default::default()
        };
        let (pool, mut rx) = pool(temp_dir.path(), "main", config(2, 10_000), runner);

        let handle = pool.submit(Task::new("a")).unwrap();
        let result = rx.recv().await.unwrap();
        handle.await.unwrap();

        assert_eq!(result.outcome, TaskOutcome::Success);
        assert!(result.has_workspace());
        assert_eq!(pool.active_count(), 0);
        let ws = GitManager::new(&result.workspace_path).unwrap();
        assert_eq!(ws.commits_ahead_of("main").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_when_saturated() {
        let (temp_dir, _repo) = setup_test_repo();
        let runner = FakeRunner {
            sleep: Duration::from_secs(30),
            ..Default::default()
        };
        let (pool, mut rx) = pool(temp_dir.path(), "main", config(1, 60_000), runner);

        pool.submit(Task::new("a")).unwrap();
        assert_eq!(
            pool.submit(Task::new("b")).unwrap_err(),
            PoolError::Saturated { active: 1, max: 1 }
        );
        assert_eq!(pool.running_tasks(), vec!["a".to_string()]);

        pool.terminate_all_processes();
        let result = rx.recv().await.unwrap();
        assert_eq!(result.outcome, TaskOutcome::Interrupted);
        assert_eq!(
            pool.submit(Task::new("c")).unwrap_err(),
            PoolError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_timeout_is_interrupted_not_failed() {
        let (temp_dir, _repo) = setup_test_repo();
        let runner = FakeRunner {
            sleep: Duration::from_secs(30),
            ..Default::default()
        };
        let (pool, mut rx) = pool(temp_dir.path(), "main", config(1, 200), runner);

        pool.submit(Task::new("slow")).unwrap();
        let result = rx.recv().await.unwrap();
        assert_eq!(result.outcome, TaskOutcome::Interrupted);
        assert!(result.error().is_none());
        assert!(result.workspace_path.exists());
    }

    #[tokio::test]
    async fn test_timeout_after_close_verdict() {
        let (temp_dir, _repo) = setup_test_repo();
        let runner = FakeRunner {
            sleep: Duration::from_secs(30),
            raise_verdict: true,
            ..Default::default()
        };
        let (pool, mut rx) = pool(temp_dir.path(), "main", config(1, 200), runner);

        pool.submit(Task::new("closing")).unwrap();
        let result = rx.recv().await.unwrap();
        assert_eq!(result.outcome, TaskOutcome::InterruptedButClose);
    }

    #[tokio::test]
    async fn test_runner_failure() {
        let (temp_dir, _repo) = setup_test_repo();
        let runner = FakeRunner {
            fail_with: Some("assertion failed".to_string()),
            ..Default::default()
        };
        let (pool, mut rx) = pool(temp_dir.path(), "main", config(1, 10_000), runner);

        pool.submit(Task::new("bad")).unwrap();
        let result = rx.recv().await.unwrap();
        assert_eq!(result.error(), Some("assertion failed"));
    }

    #[tokio::test]
    async fn test_workspace_allocation_failure() {
        let (temp_dir, _repo) = setup_test_repo();
        let (pool, mut rx) = pool(
            temp_dir.path(),
            "no-such-branch",
            config(1, 10_000),
            FakeRunner::default(),
        );

        pool.submit(Task::new("a")).unwrap();
        let result = rx.recv().await.unwrap();
        assert!(result.error().unwrap().contains("allocate workspace"));
        assert!(!result.has_workspace());
        assert_eq!(pool.active_count(), 0);
    }
}
