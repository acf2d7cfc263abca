//! Parallel execution
//!
//! - `queue` - priority and dependency ordered backlog
//! - `overlap` - file footprints of in-flight tasks
//! - `workspace` - one git worktree per dispatched task
//! - `pool` - bounded set of workers running tasks in their workspaces
//! - `merge_coordinator` - the single writer of the mainline
//! - `orchestrator` - the control loop tying them together

pub mod merge_coordinator;
pub mod orchestrator;
pub mod overlap;
pub mod pool;
pub mod queue;
pub mod workspace;

pub use merge_coordinator::{
    ConflictInfo, MergeCoordinator, MergeError, MergeHandle, MergeOutcome, MergePhase, MergeReport,
};
pub use orchestrator::{Collaborators, Orchestrator, RunSummary};
pub use overlap::OverlapDetector;
pub use pool::{PoolConfig, PoolError, WorkerPool};
pub use queue::{QueueError, QueueSnapshot, QueueStats, WorkQueue};
pub use workspace::{
    PendingWorkspaceInfo, Workspace, WorkspaceDisposition, WorkspaceError, WorkspaceManager,
    BRANCH_PREFIX,
};
