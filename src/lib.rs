// Clippy allows for reasonable defaults
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::derivable_impls)] // Explicit Default impls can be clearer
#![allow(clippy::collapsible_if)] // Separate ifs can be more readable

//! Parallel task orchestration engine.
//!
//! Pulls tasks from a [`source::TaskSource`], runs up to N of them at once in
//! isolated git worktrees, keeps tasks that touch the same files apart, and
//! merges finished work into the mainline one branch at a time.

pub mod classifier;
pub mod config;
pub mod error;
pub mod file_storage;
pub mod git;
pub mod lifecycle;
pub mod models;
pub mod parallel;
pub mod runner;
pub mod shutdown;
pub mod source;
pub mod utils;

pub use config::{ConfigLoader, ConfigOverrides, OrchestratorConfig};
pub use error::{OrchestratorError, OrchestratorResult};
pub use models::{Task, TaskId, TaskOutcome, TaskStatus, WorkResult};
pub use parallel::{Collaborators, Orchestrator, RunSummary};
pub use shutdown::ShutdownState;
