// Task status state machine for the work queue

use super::TaskStatus;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

/// Validates if a task can transition from one status to another
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    match (from, to) {
        // From Pending
        (TaskStatus::Pending, TaskStatus::InProgress) => true,

        // From InProgress
        (TaskStatus::InProgress, TaskStatus::Completed) => true,
        (TaskStatus::InProgress, TaskStatus::Failed) => true,
        (TaskStatus::InProgress, TaskStatus::Parked) => true,
        (TaskStatus::InProgress, TaskStatus::Pending) => true, // Deferred by overlap

        // Explicit resets
        (TaskStatus::Completed, TaskStatus::Pending) => true,
        (TaskStatus::Failed, TaskStatus::Pending) => true,
        (TaskStatus::Parked, TaskStatus::Pending) => true,

        // Same state is always allowed (no-op)
        (a, b) if a == b => true,

        // All other transitions are invalid
        _ => false,
    }
}

/// Validates and performs a state transition
pub fn transition_state(
    current: TaskStatus,
    target: TaskStatus,
) -> Result<TaskStatus, StateTransitionError> {
    if !can_transition(current, target) {
        return Err(StateTransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }

    Ok(target)
}

/// Check if a status is a terminal state
pub fn is_terminal_state(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Completed | TaskStatus::Failed)
}

/// Check if a status indicates active work
pub fn is_active_state(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::InProgress)
}
