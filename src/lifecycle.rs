//! Lifecycle completion writes
//!
//! Closing a task means moving its file from the active directory to the
//! done directory and staging the result. The write is made in the mainline
//! working copy; committing it is the merge coordinator's job.

use crate::git::{GitError, GitManager};
use crate::source::split_front_matter;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Lifecycle write failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Git(#[from] GitError),
}

/// Records that a task is finished
pub trait LifecycleWriter: Send + Sync {
    /// Apply and stage the completion write. Returns whether anything changed.
    fn complete_lifecycle(&self, repo_root: &Path, task_id: &str) -> Result<bool, LifecycleError>;

    /// Repository-relative paths this writer may touch
    fn lifecycle_paths(&self) -> Vec<PathBuf>;
}

/// Moves `<active>/<id>.md` to `<done>/<id>.md`
#[derive(Debug, Clone)]
pub struct FileLifecycleWriter {
    active_dir: PathBuf,
    done_dir: PathBuf,
}

/// Rewrite a `status:` front-matter line to `status: done`.
/// Returns `None` when there is no such line.
pub fn mark_status_done(content: &str) -> Option<String> {
    let (Some(front), _) = split_front_matter(content) else {
        return None;
    };
    // `front` borrows from `content`
    let start = front.as_ptr() as usize - content.as_ptr() as usize;
    let end = start + front.len();

    let mut changed = false;
    let rewritten: String = front
        .split_inclusive('\n')
        .map(|line| {
            let key = line.trim_start();
            if !changed && key.starts_with("status:") {
                changed = true;
                let newline = if line.ends_with("\r\n") {
                    "\r\n"
                } else if line.ends_with('\n') {
                    "\n"
                } else {
                    ""
                };
                format!("status: done{}", newline)
            } else {
                line.to_string()
            }
        })
        .collect();

    if !changed {
        return None;
    }
    Some(format!("{}{}{}", &content[..start], rewritten, &content[end..]))
}

impl FileLifecycleWriter {
    pub fn new(active_dir: impl Into<PathBuf>, done_dir: impl Into<PathBuf>) -> Self {
        Self {
            active_dir: active_dir.into(),
            done_dir: done_dir.into(),
        }
    }

    /// Find the task's file: `<id>.md`, or any file whose front matter id matches
    fn find_task_file(&self, repo_root: &Path, task_id: &str) -> Option<PathBuf> {
        let direct = self.active_dir.join(format!("{}.md", task_id));
        if repo_root.join(&direct).is_file() {
            return Some(direct);
        }

        let entries = fs::read_dir(repo_root.join(&self.active_dir)).ok()?;
        let mut candidates: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        candidates.sort();
        candidates.into_iter().find_map(|path| {
            if !path.extension().is_some_and(|ext| ext == "md") {
                return None;
            }
            let content = fs::read_to_string(&path).ok()?;
            let task = crate::source::parse_task_file(&path, &content).ok()??;
            if task.id != task_id {
                return None;
            }
            Some(self.active_dir.join(path.file_name()?))
        })
    }
}

impl LifecycleWriter for FileLifecycleWriter {
    fn complete_lifecycle(&self, repo_root: &Path, task_id: &str) -> Result<bool, LifecycleError> {
        let Some(src_rel) = self.find_task_file(repo_root, task_id) else {
            log::debug!(
                "[Lifecycle] No active file for {}, nothing to complete",
                task_id
            );
            return Ok(false);
        };
        let file_name = src_rel
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| format!("{}.md", task_id).into());
        let dst_rel = self.done_dir.join(file_name);
        let src = repo_root.join(&src_rel);
        let dst = repo_root.join(&dst_rel);

        let done_dir = repo_root.join(&self.done_dir);
        fs::create_dir_all(&done_dir).map_err(|source| LifecycleError::Io {
            path: done_dir.clone(),
            source,
        })?;

        let content = fs::read_to_string(&src).map_err(|source| LifecycleError::Io {
            path: src.clone(),
            source,
        })?;
        match mark_status_done(&content) {
            Some(updated) => {
                fs::write(&dst, updated).map_err(|source| LifecycleError::Io {
                    path: dst.clone(),
                    source,
                })?;
                fs::remove_file(&src).map_err(|source| LifecycleError::Io {
                    path: src.clone(),
                    source,
                })?;
            }
            // No status line: a pure rename
            None => fs::rename(&src, &dst).map_err(|source| LifecycleError::Io {
                path: src.clone(),
                source,
            })?,
        }

        GitManager::new(repo_root)?.stage_paths(&[src_rel.as_path(), dst_rel.as_path()])?;
        log::info!(
            "[Lifecycle] Moved {} to {}",
            src_rel.display(),
            dst_rel.display()
        );
        Ok(true)
    }

    fn lifecycle_paths(&self) -> Vec<PathBuf> {
        vec![self.active_dir.clone(), self.done_dir.clone()]
    }
}
