//! File-based storage for run state
//!
//! Everything lives in the project's state directory (`.ralph-parallel/`):
//! - `state.json` - snapshot of the queue, rewritten atomically
//! - `failures.jsonl` - append-only record of real task failures
//! - `orchestrator.lock` - held for the lifetime of a run
//! - `config.toml` - project configuration (read by `config`)

pub mod failures;
pub mod lock;
pub mod state;

pub use failures::{FailureLog, FailureRecord};
pub use lock::RunLock;
pub use state::{OrchestratorState, StateStore};

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Another run holds the lock at {}", .0.display())]
    Locked(PathBuf),
}

pub type StateResult<T> = Result<T, StateError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> StateResult<()> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(io_error(path))?;
    }
    Ok(())
}

/// Write data to a file atomically (temp file + rename)
pub fn atomic_write(path: &Path, content: &str) -> StateResult<()> {
    let temp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    fs::write(&temp_path, content).map_err(io_error(&temp_path))?;
    fs::rename(&temp_path, path).map_err(io_error(path))?;

    Ok(())
}

/// Read a JSON file and deserialize it
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StateResult<T> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    serde_json::from_str(&content).map_err(|source| StateError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Write data as pretty-printed JSON atomically
pub fn write_json<T: serde::Serialize>(path: &Path, data: &T) -> StateResult<()> {
    let content = serde_json::to_string_pretty(data).map_err(|source| StateError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    atomic_write(path, &content)
}
