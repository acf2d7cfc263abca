//! Parallel Orchestrator
//!
//! Ties the queue, overlap detector, worker pool and merge coordinator into
//! one control loop. The loop never blocks for longer than the poll interval,
//! so a shutdown request is seen promptly.
//!
//! Routing of a finished task:
//! - success: merge request; completed once the merge is reported
//! - interrupted, close requested: completed, lifecycle written, workspace discarded
//! - interrupted: parked, workspace kept for the next run
//! - failure: classified; transient failures are parked, real ones recorded
//!
//! Overlap footprints are released when a task is settled: after its merge
//! report for successes, right away for everything else.

use crate::classifier::{FailureClassifier, FailureKind, PatternClassifier};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::file_storage::failures::FailureStage;
use crate::file_storage::{FailureLog, FailureRecord, OrchestratorState, RunLock, StateStore};
use crate::git::GitCli;
use crate::lifecycle::{FileLifecycleWriter, LifecycleWriter};
use crate::models::{TaskId, TaskOutcome, TaskStatus, WorkResult};
use crate::parallel::merge_coordinator::{
    MergeCoordinator, MergeError, MergeHandle, MergeOutcome, MergeReport,
};
use crate::parallel::overlap::OverlapDetector;
use crate::parallel::pool::WorkerPool;
use crate::parallel::queue::{QueueError, QueueStats, WorkQueue};
use crate::parallel::workspace::{
    PendingWorkspaceInfo, Workspace, WorkspaceDisposition, WorkspaceManager,
};
use crate::runner::{CommandRunner, TaskRunner};
use crate::shutdown::ShutdownState;
use crate::source::{DirectoryTaskSource, TaskSource};
use crate::utils::{sanitize_path_component, state_dir};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The pluggable parts of a run
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn TaskSource>,
    pub runner: Arc<dyn TaskRunner>,
    pub lifecycle: Arc<dyn LifecycleWriter>,
    pub classifier: Arc<dyn FailureClassifier>,
}

impl Collaborators {
    /// Directory source, command runner, file lifecycle writer and pattern
    /// classifier, as configured
    pub fn from_config(config: &OrchestratorConfig, repo_root: &Path) -> Result<Self, ConfigError> {
        let command = config.runner.command.clone().ok_or_else(|| {
            ConfigError::Invalid("no runner command configured".to_string())
        })?;
        let runner = CommandRunner::new(command, config.runner.args.clone())
            .with_close_marker(config.runner.close_marker.clone());

        Ok(Self {
            source: Arc::new(DirectoryTaskSource::new(
                repo_root.join(&config.tasks.active_dir),
            )),
            runner: Arc::new(runner),
            lifecycle: Arc::new(FileLifecycleWriter::new(
                config.tasks.active_dir.clone(),
                config.tasks.done_dir.clone(),
            )),
            classifier: Arc::new(PatternClassifier::new()),
        })
    }
}

/// What a run did
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub dispatched: usize,
    /// Merged into the mainline, in merge order
    pub merged: Vec<TaskId>,
    /// Leftover workspaces of an earlier run merged into the mainline; their
    /// tasks stay pending
    pub recovered: Vec<TaskId>,
    /// Interrupted after asking to be closed; completed without a merge
    pub closed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub interrupted: Vec<TaskId>,
    /// Failed for an environmental reason; left for a later run
    pub transient: Vec<TaskId>,
    /// Still waiting on dependencies when the run ended
    pub blocked: Vec<TaskId>,
    pub orphans_found: usize,
    pub shutdown_requested: bool,
    pub duration_secs: f64,
    pub queue: QueueStats,
}

/// Drives one repository's backlog to completion
pub struct Orchestrator {
    config: OrchestratorConfig,
    repo_root: PathBuf,
    collaborators: Collaborators,
    shutdown: ShutdownState,
    queue: Arc<WorkQueue>,
    overlap: Arc<OverlapDetector>,
    fresh: bool,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        repo_root: impl Into<PathBuf>,
        collaborators: Collaborators,
        shutdown: ShutdownState,
    ) -> Self {
        Self {
            config,
            repo_root: repo_root.into(),
            collaborators,
            shutdown,
            queue: Arc::new(WorkQueue::new()),
            overlap: Arc::new(OverlapDetector::new()),
            fresh: false,
        }
    }

    /// Ignore (and delete) the state of earlier runs
    pub fn with_fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn overlap(&self) -> &OverlapDetector {
        &self.overlap
    }

    pub fn state_dir(&self) -> PathBuf {
        state_dir(&self.repo_root)
    }

    /// Run until the backlog is settled or shutdown is requested.
    ///
    /// State is persisted on the way out even when the loop fails.
    pub async fn run(&self) -> OrchestratorResult<RunSummary> {
        let state_dir = self.state_dir();
        let _lock = RunLock::acquire(&state_dir)?;

        let mut run = self.start(&state_dir).await?;
        let loop_result = run.event_loop().await;
        if let Err(e) = &loop_result {
            log::error!("[Orchestrator] Control loop failed: {}", e);
        }
        let shutdown_result = run.shutdown().await;

        loop_result?;
        shutdown_result?;
        Ok(run.finish())
    }

    async fn start(&self, state_dir: &Path) -> OrchestratorResult<Run> {
        let config = &self.config;
        let mainline = config.git.mainline.clone();

        let current = GitCli::new(&self.repo_root, config.git_timeout())
            .current_branch()
            .await?;
        if current != mainline {
            return Err(OrchestratorError::WrongBranch {
                expected: mainline,
                actual: current,
            });
        }

        let workspaces = Arc::new(WorkspaceManager::new(
            &self.repo_root,
            config.workspace_root(&self.repo_root),
            &mainline,
            config.git_timeout(),
        ));
        workspaces.ensure_excluded(&[state_dir])?;
        workspaces.prune();

        let store = StateStore::new(state_dir);
        let previous = if self.fresh {
            store.clear()?;
            None
        } else {
            store.load()?
        };

        let added = self
            .queue
            .enqueue(self.collaborators.source.list_ready_candidates()?);
        log::info!("[Orchestrator] {} task(s) from the task source", added);

        if let Some(previous) = &previous {
            log::info!(
                "[Orchestrator] Resuming after run {}: {} completed, {} failed",
                previous.run_id,
                previous.completed.len(),
                previous.failed.len()
            );
            self.queue.restore(&previous.completed, &previous.failed);
        }

        let coordinator = MergeCoordinator::new(
            workspaces.clone(),
            self.collaborators.lifecycle.clone(),
            config.git_timeout(),
        );
        let (merge, merge_rx) = coordinator.spawn();
        let (pool, results_rx) = WorkerPool::new(
            config.pool_config(),
            workspaces.clone(),
            self.collaborators.runner.clone(),
        );

        let run_id = uuid::Uuid::new_v4().to_string();
        log::info!(
            "[Orchestrator] Starting run {} with up to {} worker(s) on {}",
            run_id,
            config.execution.max_workers,
            mainline
        );

        let mut run = Run {
            config: config.clone(),
            collaborators: self.collaborators.clone(),
            queue: self.queue.clone(),
            overlap: self.overlap.clone(),
            shutdown: self.shutdown.clone(),
            shutdown_token: self.shutdown.token(),
            workspaces,
            pool,
            results_rx,
            merge: Some(merge),
            merge_rx,
            merge_closed: false,
            store,
            failures: FailureLog::new(state_dir),
            in_flight: HashMap::new(),
            pending_merges: BTreeSet::new(),
            recovered_merges: BTreeSet::new(),
            dirty: true,
            last_persist: Instant::now(),
            last_rescan: Instant::now(),
            started: Instant::now(),
            summary: RunSummary {
                run_id,
                ..Default::default()
            },
        };
        run.recover_orphans().await;
        run.persist();
        Ok(run)
    }
}

enum Event {
    Result(WorkResult),
    Merge(Option<MergeReport>),
    Shutdown,
    Tick,
}

/// Everything that only exists while a run is going
struct Run {
    config: OrchestratorConfig,
    collaborators: Collaborators,
    queue: Arc<WorkQueue>,
    overlap: Arc<OverlapDetector>,
    shutdown: ShutdownState,
    shutdown_token: CancellationToken,
    workspaces: Arc<WorkspaceManager>,
    pool: WorkerPool,
    results_rx: mpsc::UnboundedReceiver<WorkResult>,
    merge: Option<MergeHandle>,
    merge_rx: mpsc::UnboundedReceiver<MergeReport>,
    merge_closed: bool,
    store: StateStore,
    failures: FailureLog,
    /// Dispatched tasks whose result hasn't arrived
    in_flight: HashMap<TaskId, JoinHandle<()>>,
    /// Sent to the coordinator, report not back yet
    pending_merges: BTreeSet<TaskId>,
    /// Pending merges that carry leftover work rather than a finished run
    recovered_merges: BTreeSet<TaskId>,
    dirty: bool,
    last_persist: Instant,
    last_rescan: Instant,
    started: Instant,
    summary: RunSummary,
}

impl Run {
    async fn event_loop(&mut self) -> OrchestratorResult<()> {
        loop {
            if self.shutdown.is_shutdown_requested() {
                log::warn!("[Orchestrator] Shutdown requested, no new dispatches");
                self.summary.shutdown_requested = true;
                return Ok(());
            }
            if self.merge_closed {
                return Err(MergeError::Stopped.into());
            }

            self.reap_workers();
            self.maybe_rescan();
            self.dispatch();

            if self.is_idle() {
                let stats = self.queue.stats();
                if stats.held > 0 {
                    // Nothing left to wait on; let them compete again
                    for id in self.queue.ids_with_status(TaskStatus::Pending) {
                        self.log_queue(self.queue.release(&id));
                    }
                    continue;
                }
                let blocked = self.queue.blocked_tasks();
                if !blocked.is_empty() {
                    log::warn!(
                        "[Orchestrator] {} task(s) can never become ready (failed dependency or cycle): {:?}",
                        blocked.len(),
                        blocked
                    );
                }
                log::info!("[Orchestrator] Nothing left to do");
                return Ok(());
            }

            if self.dirty || self.last_persist.elapsed() >= self.config.persist_interval() {
                self.persist();
            }

            let event = tokio::select! {
                biased;
                Some(result) = self.results_rx.recv() => Event::Result(result),
                report = self.merge_rx.recv(), if !self.merge_closed => Event::Merge(report),
                _ = self.shutdown_token.cancelled() => Event::Shutdown,
                _ = tokio::time::sleep(self.config.poll_interval()) => Event::Tick,
            };
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Result(result) => self.handle_result(result),
            Event::Merge(Some(report)) => self.handle_merge_report(report),
            Event::Merge(None) => {
                log::error!("[Orchestrator] Merge coordinator stopped unexpectedly");
                self.merge_closed = true;
            }
            Event::Shutdown | Event::Tick => {}
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.pending_merges.is_empty() && !self.queue.has_ready()
    }

    fn maybe_rescan(&mut self) {
        let Some(interval) = self.config.rescan_interval() else {
            return;
        };
        if self.last_rescan.elapsed() < interval {
            return;
        }
        self.last_rescan = Instant::now();
        match self.collaborators.source.list_ready_candidates() {
            Ok(tasks) => {
                let added = self.queue.enqueue(tasks);
                if added > 0 {
                    log::info!("[Orchestrator] Rescan found {} new task(s)", added);
                    self.dirty = true;
                }
            }
            Err(e) => log::warn!("[Orchestrator] Task source rescan failed: {}", e),
        }
    }

    /// Hand ready tasks to free slots, deferring any that overlap in-flight work
    fn dispatch(&mut self) {
        while self.pool.available_slots() > 0 {
            let Some(task) = self.queue.try_next_ready() else {
                break;
            };

            let blockers = self.overlap.check_overlap(&task.files);
            if !blockers.is_empty() {
                log::info!(
                    "[Orchestrator] Deferring {}: shares {:?} with {:?}",
                    task.id,
                    self.overlap.shared_files(&blockers[0], &task.files),
                    blockers
                );
                self.log_queue(self.queue.defer(&task.id));
                self.overlap.defer(&task.id, &blockers);
                self.dirty = true;
                continue;
            }

            self.overlap.register(&task.id, &task.files);
            let id = task.id.clone();
            match self.pool.submit(task) {
                Ok(handle) => {
                    self.in_flight.insert(id, handle);
                    self.summary.dispatched += 1;
                    self.dirty = true;
                }
                Err(e) => {
                    log::warn!("[Orchestrator] Could not dispatch {}: {}", id, e);
                    self.overlap.unregister(&id);
                    // Back to plain pending
                    self.log_queue(self.queue.defer(&id));
                    self.log_queue(self.queue.release(&id));
                    break;
                }
            }
        }
    }

    /// A worker that ended without reporting panicked
    fn reap_workers(&mut self) {
        let finished: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        if finished.is_empty() {
            return;
        }
        // A finished worker has already queued its result
        while let Ok(result) = self.results_rx.try_recv() {
            self.handle_result(result);
        }
        for id in finished {
            if self.in_flight.contains_key(&id) {
                log::error!("[Orchestrator] Worker for {} ended without a result", id);
                self.handle_result(lost_result(&id, "Worker task panicked"));
            }
        }
    }

    fn handle_result(&mut self, result: WorkResult) {
        if self.in_flight.remove(&result.task_id).is_none() {
            log::warn!(
                "[Orchestrator] Ignoring result for {}, it isn't in flight",
                result.task_id
            );
            return;
        }
        self.route_result(result);
    }

    fn route_result(&mut self, result: WorkResult) {
        self.dirty = true;
        let id = result.task_id.clone();

        match result.outcome.clone() {
            TaskOutcome::Success => {
                self.pending_merges.insert(id.clone());
                if let Err(e) = self.merger().and_then(|m| m.request_merge(result)) {
                    log::error!("[Orchestrator] Cannot merge {}: {}", id, e);
                    self.pending_merges.remove(&id);
                    self.merge_closed = true;
                    self.log_queue(self.queue.park(&id));
                    self.settle(&id);
                }
                // Footprint stays registered until the merge is reported
            }
            TaskOutcome::InterruptedButClose => {
                log::info!(
                    "[Orchestrator] Task {} was cut off after asking to be closed",
                    id
                );
                self.log_queue(self.queue.mark_completed(&id));
                self.summary.closed.push(id.clone());
                self.send_to_merger(|m| m.complete_lifecycle(id.clone()));
                self.discard_workspace(&result);
                self.settle(&id);
            }
            TaskOutcome::Interrupted => {
                log::warn!(
                    "[Orchestrator] Task {} was interrupted, keeping {:?} for the next run",
                    id,
                    result.workspace_path
                );
                self.log_queue(self.queue.park(&id));
                self.summary.interrupted.push(id.clone());
                self.settle(&id);
            }
            TaskOutcome::Failure { reason } => {
                // Ordinary output may mention timeouts or status codes
                match self.collaborators.classifier.classify(&reason) {
                    FailureKind::Transient(category) => {
                        log::warn!(
                            "[Orchestrator] Task {} hit a transient {} failure, leaving it for a later run: {}",
                            id,
                            category,
                            reason
                        );
                        self.log_queue(self.queue.park(&id));
                        self.summary.transient.push(id.clone());
                    }
                    FailureKind::Real => {
                        log::error!("[Orchestrator] Task {} failed: {}", id, reason);
                        self.log_queue(self.queue.mark_failed(&id));
                        self.summary.failed.push(id.clone());
                        let mut record = FailureRecord::new(id.clone(), FailureStage::Task, reason.clone());
                        if result.has_workspace() {
                            record = record.with_branch(result.branch_name.clone());
                        }
                        self.record_failure(record);
                    }
                }
                self.discard_workspace(&result);
                self.settle(&id);
            }
        }
    }

    fn handle_merge_report(&mut self, report: MergeReport) {
        match report {
            MergeReport::Merge {
                task_id,
                branch_name,
                outcome,
            } => {
                self.pending_merges.remove(&task_id);
                self.dirty = true;
                let tracked = self.queue.contains(&task_id);

                if self.recovered_merges.remove(&task_id) {
                    self.handle_recovered_merge(task_id, branch_name, outcome, tracked);
                    return;
                }

                match outcome {
                    MergeOutcome::Merged { .. } => {
                        if tracked {
                            self.log_queue(self.queue.mark_completed(&task_id));
                        }
                        self.summary.merged.push(task_id.clone());
                        self.send_to_merger(|m| m.complete_lifecycle(task_id.clone()));
                    }
                    MergeOutcome::Conflict(info) => {
                        if tracked {
                            self.log_queue(self.queue.mark_failed(&task_id));
                        }
                        self.summary.failed.push(task_id.clone());
                        let reason = format!(
                            "Merge conflict in {}: {}",
                            info.conflicting_files.join(", "),
                            info.reason
                        );
                        self.record_failure(
                            FailureRecord::new(task_id.clone(), FailureStage::MergeConflict, reason)
                                .with_branch(branch_name)
                                .with_files(info.conflicting_files),
                        );
                    }
                    MergeOutcome::Failed { reason } => {
                        if tracked {
                            self.log_queue(self.queue.mark_failed(&task_id));
                        }
                        self.summary.failed.push(task_id.clone());
                        self.record_failure(
                            FailureRecord::new(task_id.clone(), FailureStage::Merge, reason)
                                .with_branch(branch_name),
                        );
                    }
                }
                self.settle(&task_id);
            }
            MergeReport::Lifecycle { task_id, result } => match result {
                Ok(true) => log::debug!("[Orchestrator] Lifecycle of {} committed", task_id),
                Ok(false) => log::debug!("[Orchestrator] No lifecycle change for {}", task_id),
                Err(e) => log::warn!(
                    "[Orchestrator] Lifecycle of {} not recorded, fix it by hand: {}",
                    task_id,
                    e
                ),
            },
        }
    }

    /// Leftover work never finishes its task: whatever the merge did, the task
    /// goes back to pending and is dispatched like any other
    fn handle_recovered_merge(
        &mut self,
        task_id: TaskId,
        branch_name: String,
        outcome: MergeOutcome,
        tracked: bool,
    ) {
        match outcome {
            MergeOutcome::Merged { .. } => {
                log::info!(
                    "[Orchestrator] Leftover work of {} merged, the task stays pending",
                    task_id
                );
                self.summary.recovered.push(task_id.clone());
            }
            MergeOutcome::Conflict(info) => {
                log::error!(
                    "[Orchestrator] Leftover work of {} conflicts in {}, branch {} kept",
                    task_id,
                    info.conflicting_files.join(", "),
                    branch_name
                );
                let reason = format!(
                    "Merge conflict in leftover work ({}): {}",
                    info.conflicting_files.join(", "),
                    info.reason
                );
                self.record_failure(
                    FailureRecord::new(task_id.clone(), FailureStage::MergeConflict, reason)
                        .with_branch(branch_name)
                        .with_files(info.conflicting_files),
                );
            }
            MergeOutcome::Failed { reason } => {
                log::error!(
                    "[Orchestrator] Leftover work of {} could not be merged: {}",
                    task_id,
                    reason
                );
                self.record_failure(
                    FailureRecord::new(task_id.clone(), FailureStage::Merge, reason)
                        .with_branch(branch_name),
                );
            }
        }
        if tracked && self.queue.status(&task_id) == Some(TaskStatus::InProgress) {
            self.log_queue(self.queue.reset(&task_id));
        }
        self.settle(&task_id);
    }

    /// Drop the footprint and make the tasks that waited on it dispatchable
    fn settle(&mut self, id: &str) {
        for waiter in self.overlap.unregister(id) {
            log::debug!("[Orchestrator] Releasing {} (was waiting on {})", waiter, id);
            self.log_queue(self.queue.release(&waiter));
        }
    }

    fn merger(&self) -> Result<&MergeHandle, MergeError> {
        self.merge.as_ref().ok_or(MergeError::Stopped)
    }

    fn send_to_merger<F>(&mut self, send: F)
    where
        F: FnOnce(&MergeHandle) -> Result<(), MergeError>,
    {
        if let Err(e) = self.merger().and_then(send) {
            log::error!("[Orchestrator] Merge coordinator unavailable: {}", e);
            self.merge_closed = true;
        }
    }

    fn discard_workspace(&mut self, result: &WorkResult) {
        if !result.has_workspace() {
            return;
        }
        let workspace = Workspace {
            task_id: result.task_id.clone(),
            path: result.workspace_path.clone(),
            branch: result.branch_name.clone(),
        };
        self.send_to_merger(|m| m.discard(workspace));
    }

    fn record_failure(&self, record: FailureRecord) {
        if let Err(e) = self.failures.append(&record) {
            log::error!(
                "[Orchestrator] Could not record failure of {}: {}",
                record.task_id,
                e
            );
        }
    }

    fn log_queue(&self, result: Result<(), QueueError>) {
        if let Err(e) = result {
            log::warn!("[Orchestrator] {}", e);
        }
    }

    fn state(&self) -> OrchestratorState {
        OrchestratorState::from_snapshot(
            self.summary.run_id.clone(),
            self.queue.snapshot(),
            self.pending_merges.iter().cloned().collect(),
        )
    }

    /// Best effort; the next attempt retries
    fn persist(&mut self) {
        match self.store.save(&self.state()) {
            Ok(()) => {
                self.dirty = false;
                self.last_persist = Instant::now();
            }
            Err(e) => log::error!("[Orchestrator] Failed to persist state: {}", e),
        }
    }

    /// Deal with workspaces left by an earlier run, as configured
    async fn recover_orphans(&mut self) {
        let orphans = self.workspaces.scan_orphans(&[]);
        self.summary.orphans_found = orphans.len();
        if orphans.is_empty() {
            return;
        }

        let disposition = self.config.git.workspace_disposition;
        log::info!(
            "[Orchestrator] Found {} workspace(s) from an earlier run ({})",
            orphans.len(),
            disposition
        );
        for info in &orphans {
            log::info!(
                "[Orchestrator]   {:?} on {}: {} commit(s) ahead, uncommitted changes: {}",
                info.path,
                info.branch,
                info.commits_ahead,
                info.has_uncommitted
            );
        }

        for info in orphans {
            if disposition == WorkspaceDisposition::MergePending && info.has_pending_work() {
                self.merge_orphan(info).await;
            } else {
                self.send_to_merger(|m| m.discard(info.workspace()));
            }
        }
    }

    async fn merge_orphan(&mut self, info: PendingWorkspaceInfo) {
        let task_id = self.claim_orphan_task(&info);

        // Only the branch tip is merged
        if info.has_uncommitted {
            let message = format!("Recover uncommitted work of {}", task_id);
            if let Err(e) = self.workspaces.commit_all(&info.workspace(), &message).await {
                log::warn!(
                    "[Orchestrator] Could not commit leftover changes of {}: {}",
                    task_id,
                    e
                );
            }
        }

        log::info!(
            "[Orchestrator] Merging leftover work of {} from {}",
            task_id,
            info.branch
        );
        self.pending_merges.insert(task_id.clone());
        self.recovered_merges.insert(task_id.clone());
        let result = WorkResult {
            task_id: task_id.clone(),
            outcome: TaskOutcome::Success,
            branch_name: info.branch,
            workspace_path: info.path,
            output: String::new(),
            duration_secs: 0.0,
        };
        if let Err(e) = self.merger().and_then(|m| m.request_merge(result)) {
            log::error!("[Orchestrator] Cannot merge leftover work of {}: {}", task_id, e);
            self.pending_merges.remove(&task_id);
            self.recovered_merges.remove(&task_id);
            self.merge_closed = true;
        }
    }

    /// Map an orphan back to a pending task and claim it, so it isn't
    /// dispatched again while its old work is merged
    fn claim_orphan_task(&mut self, info: &PendingWorkspaceInfo) -> TaskId {
        let Some(sanitized) = info.task_id.clone() else {
            return dir_name(&info.path);
        };
        let candidate = self
            .queue
            .ids_with_status(TaskStatus::Pending)
            .into_iter()
            .find(|id| sanitize_path_component(id) == sanitized);

        match candidate.map(|id| self.queue.claim(&id)) {
            Some(Ok(task)) => {
                self.overlap.register(&task.id, &task.files);
                task.id
            }
            Some(Err(e)) => {
                log::warn!("[Orchestrator] {}", e);
                sanitized
            }
            None => sanitized,
        }
    }

    /// Stop dispatching, drain, terminate what is left, stop the coordinator
    /// and persist
    async fn shutdown(&mut self) -> OrchestratorResult<()> {
        let timeout = self.config.shutdown_timeout();

        if !self.in_flight.is_empty() || !self.pending_merges.is_empty() {
            log::info!(
                "[Orchestrator] Waiting up to {:?} for {} worker(s) and {} merge(s)",
                timeout,
                self.in_flight.len(),
                self.pending_merges.len()
            );
            let drained = self.drain(Instant::now() + timeout).await;

            if !drained && !self.in_flight.is_empty() {
                self.pool.terminate_all_processes();
                // Cancelled workers still report, as interrupted
                self.drain(Instant::now() + timeout).await;
                for (id, handle) in std::mem::take(&mut self.in_flight) {
                    log::warn!("[Orchestrator] Abandoning worker for {}", id);
                    handle.abort();
                    self.route_result(lost_result(&id, ""));
                }
            }
        }
        self.pool.terminate_all_processes();

        if let Some(merge) = self.merge.take() {
            if !merge.shutdown(timeout).await {
                log::warn!(
                    "[Orchestrator] Merge coordinator did not finish, {} merge(s) unresolved",
                    self.pending_merges.len()
                );
            }
        }
        while let Ok(report) = self.merge_rx.try_recv() {
            self.handle_merge_report(report);
        }

        let state = self.state();
        self.store.save(&state)?;
        log::info!(
            "[Orchestrator] State saved to {:?}",
            self.store.path()
        );
        Ok(())
    }

    /// Process results and reports until nothing is in flight or pending,
    /// or the deadline passes. Returns whether everything settled.
    async fn drain(&mut self, deadline: Instant) -> bool {
        loop {
            self.reap_workers();
            if self.in_flight.is_empty() && self.pending_merges.is_empty() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }

            let event = tokio::select! {
                biased;
                Some(result) = self.results_rx.recv() => Event::Result(result),
                report = self.merge_rx.recv(), if !self.merge_closed => Event::Merge(report),
                _ = tokio::time::sleep(remaining.min(self.config.poll_interval())) => Event::Tick,
            };
            self.handle_event(event);
            if self.merge_closed && self.in_flight.is_empty() {
                return self.pending_merges.is_empty();
            }
        }
    }

    fn finish(mut self) -> RunSummary {
        self.summary.blocked = self.queue.blocked_tasks();
        self.summary.queue = self.queue.stats();
        self.summary.duration_secs = self.started.elapsed().as_secs_f64();
        log::info!(
            "[Orchestrator] Run {} finished in {:.1}s: {} merged, {} recovered, {} closed, {} failed, {} interrupted, {} transient",
            self.summary.run_id,
            self.summary.duration_secs,
            self.summary.merged.len(),
            self.summary.recovered.len(),
            self.summary.closed.len(),
            self.summary.failed.len(),
            self.summary.interrupted.len(),
            self.summary.transient.len()
        );
        self.summary
    }
}

/// Result for a worker that never reported. Empty reason means interrupted.
fn lost_result(id: &str, reason: &str) -> WorkResult {
    let outcome = if reason.is_empty() {
        TaskOutcome::Interrupted
    } else {
        TaskOutcome::Failure {
            reason: reason.to_string(),
        }
    };
    WorkResult {
        task_id: id.to_string(),
        outcome,
        branch_name: String::new(),
        workspace_path: PathBuf::new(),
        output: String::new(),
        duration_secs: 0.0,
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
