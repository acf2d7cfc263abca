//! Run lock (`orchestrator.lock`)
//!
//! An exclusive advisory lock held for the lifetime of a run, so two runs
//! never drive the same repository. The lock goes away with the file handle,
//! including when the process dies.

use super::{ensure_dir, StateError, StateResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "orchestrator.lock";

#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without waiting
    pub fn acquire(state_dir: &Path) -> StateResult<Self> {
        ensure_dir(state_dir)?;
        let path = state_dir.join(LOCK_FILE);
        let io_err = |source| StateError::Io {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(StateError::Locked(path));
            }
            return Err(io_err(e));
        }

        // Informational only
        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;

        log::debug!("[RunLock] Acquired {:?}", path);
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("[RunLock] Failed to release {:?}: {}", self.path, e);
        }
    }
}
