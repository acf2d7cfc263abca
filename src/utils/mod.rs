// Utility functions

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Name of the per-repository state directory.
pub const STATE_DIR_NAME: &str = ".ralph-parallel";

/// Get the .ralph-parallel directory path for a repository.
#[inline]
pub fn state_dir(repo_path: &Path) -> PathBuf {
    repo_path.join(STATE_DIR_NAME)
}

/// Get the project config path for a repository.
#[inline]
pub fn project_config_path(repo_path: &Path) -> PathBuf {
    state_dir(repo_path).join("config.toml")
}

/// Safely acquire a mutex lock, recovering from poisoning by returning the guard.
///
/// Every component keeps its state behind a single mutex and only mutates it
/// through short critical sections, so a poisoned guard still holds
/// consistent data.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}

/// Sanitize a string for use in a branch name
pub fn sanitize_branch_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .to_lowercase()
}

/// Sanitize a string for use as a path component
pub fn sanitize_path_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
}

/// Millisecond-resolution timestamp used to make branch and directory names unique.
pub fn compact_timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
}

/// Keep only the last `max_lines` lines of some process output.
pub fn tail_lines(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
