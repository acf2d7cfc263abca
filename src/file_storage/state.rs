//! Persisted orchestrator snapshot (`state.json`)

use super::{read_json, write_json, StateError, StateResult};
use crate::models::TaskId;
use crate::parallel::queue::QueueSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state.json";

/// What a run leaves behind for the next one.
///
/// Only `completed` and `failed` are acted on when resuming. Pending and
/// in-progress ids are informational: tasks come back from the source, and
/// work of in-progress tasks is recovered through the orphan scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    #[serde(default)]
    pub pending: Vec<TaskId>,
    #[serde(default)]
    pub in_progress: Vec<TaskId>,
    #[serde(default)]
    pub completed: Vec<TaskId>,
    #[serde(default)]
    pub failed: Vec<TaskId>,
    /// Succeeded tasks whose merge had not been reported yet
    #[serde(default)]
    pub pending_merges: Vec<TaskId>,
    pub run_id: String,
    pub updated_at: DateTime<Utc>,
}

impl OrchestratorState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            pending: Vec::new(),
            in_progress: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            pending_merges: Vec::new(),
            run_id: run_id.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn from_snapshot(
        run_id: impl Into<String>,
        snapshot: QueueSnapshot,
        pending_merges: Vec<TaskId>,
    ) -> Self {
        Self {
            pending: snapshot.pending,
            in_progress: snapshot.in_progress,
            completed: snapshot.completed,
            failed: snapshot.failed,
            pending_merges,
            run_id: run_id.into(),
            updated_at: Utc::now(),
        }
    }

    /// Every id mentioned anywhere in the snapshot
    pub fn all_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.pending
            .iter()
            .chain(&self.in_progress)
            .chain(&self.completed)
            .chain(&self.failed)
            .chain(&self.pending_merges)
    }
}

/// Reads and writes `state.json` in the state directory
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the previous snapshot. A missing file is `None`; an unreadable
    /// one is moved aside so the run can start over.
    pub fn load(&self) -> StateResult<Option<OrchestratorState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        match read_json::<OrchestratorState>(&self.path) {
            Ok(state) => {
                log::info!(
                    "[StateStore] Loaded state of run {} ({} completed, {} failed)",
                    state.run_id,
                    state.completed.len(),
                    state.failed.len()
                );
                Ok(Some(state))
            }
            Err(StateError::Json { source, .. }) => {
                let aside = self.path.with_extension("json.corrupt");
                log::warn!(
                    "[StateStore] Ignoring unreadable {:?} ({}), moved to {:?}",
                    self.path,
                    source,
                    aside
                );
                fs::rename(&self.path, &aside).map_err(|source| StateError::Io {
                    path: self.path.clone(),
                    source,
                })?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, state: &OrchestratorState) -> StateResult<()> {
        write_json(&self.path, state)?;
        log::debug!(
            "[StateStore] Saved state: {} pending, {} in progress, {} completed, {} failed, {} merging",
            state.pending.len(),
            state.in_progress.len(),
            state.completed.len(),
            state.failed.len(),
            state.pending_merges.len()
        );
        Ok(())
    }

    /// Forget the previous run
    pub fn clear(&self) -> StateResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(&temp_dir.path().join(".ralph-parallel"));

        let snapshot = QueueSnapshot {
            pending: vec!["c".to_string()],
            in_progress: vec!["b".to_string()],
            completed: vec!["a".to_string()],
            failed: vec![],
        };
        let state = OrchestratorState::from_snapshot("run-1", snapshot, vec!["b".to_string()]);
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.all_ids().count(), 4);

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"pendingMerges\""));
        assert!(raw.contains("\"runId\": \"run-1\""));
    }

    #[test]
    fn test_missing_lists_default_to_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path());
        fs::write(
            store.path(),
            r#"{"completed": ["a"], "runId": "r", "updatedAt": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.completed, vec!["a".to_string()]);
        assert!(loaded.failed.is_empty());
        assert!(loaded.pending_merges.is_empty());
    }

    #[test]
    fn test_corrupt_state_is_moved_aside() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path());
        fs::write(store.path(), "{ truncated").unwrap();

        assert!(store.load().unwrap().is_none());
        assert!(!store.path().exists());
        assert!(temp_dir.path().join("state.json.corrupt").exists());
    }

    #[test]
    fn test_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::new(temp_dir.path());
        store.save(&OrchestratorState::new("r")).unwrap();
        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
    }
}
