// File overlap detection for parallel task dispatch
//
// A conservative filter: two tasks whose expected footprints share a path are
// never in flight together. Deferring a task that wouldn't really have
// conflicted is fine; dispatching one that does is not.

use crate::models::TaskId;
use crate::utils::lock_mutex_recover;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct OverlapInner {
    /// Footprint of every registered (in-flight) task
    footprints: HashMap<TaskId, HashSet<String>>,
    /// Deferred tasks, keyed by the task they are waiting on, in deferral order
    waiting: HashMap<TaskId, Vec<TaskId>>,
}

/// Tracks which files in-flight tasks are expected to touch
pub struct OverlapDetector {
    inner: Mutex<OverlapInner>,
}

/// Normalize a path hint so `./src/a.rs` and `src/a.rs` compare equal
pub fn normalize_path(path: &str) -> String {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.trim_end_matches('/').replace('\\', "/")
}

impl OverlapDetector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(OverlapInner::default()),
        }
    }

    /// Record a task's footprint. Registering again replaces the footprint.
    pub fn register<I, S>(&self, id: &str, files: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let footprint: HashSet<String> = files
            .into_iter()
            .map(|f| normalize_path(f.as_ref()))
            .filter(|f| !f.is_empty())
            .collect();
        log::debug!(
            "[OverlapDetector] Registered {} with {} file(s)",
            id,
            footprint.len()
        );
        lock_mutex_recover(&self.inner)
            .footprints
            .insert(id.to_string(), footprint);
    }

    /// Registered tasks whose footprint intersects the candidate's, sorted by id.
    /// Empty means the candidate may be dispatched now.
    pub fn check_overlap<I, S>(&self, candidate_files: I) -> Vec<TaskId>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let candidate: HashSet<String> = candidate_files
            .into_iter()
            .map(|f| normalize_path(f.as_ref()))
            .filter(|f| !f.is_empty())
            .collect();
        if candidate.is_empty() {
            return Vec::new();
        }

        let inner = lock_mutex_recover(&self.inner);
        let blockers: BTreeSet<TaskId> = inner
            .footprints
            .iter()
            .filter(|(_, footprint)| !footprint.is_disjoint(&candidate))
            .map(|(id, _)| id.clone())
            .collect();
        blockers.into_iter().collect()
    }

    /// Files shared between a candidate and a specific registered task
    pub fn shared_files<I, S>(&self, id: &str, candidate_files: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let inner = lock_mutex_recover(&self.inner);
        let Some(footprint) = inner.footprints.get(id) else {
            return Vec::new();
        };
        let shared: BTreeSet<String> = candidate_files
            .into_iter()
            .map(|f| normalize_path(f.as_ref()))
            .filter(|f| footprint.contains(f))
            .collect();
        shared.into_iter().collect()
    }

    /// Put `id` on the waiting list of every blocker
    pub fn defer(&self, id: &str, blockers: &[TaskId]) {
        let mut inner = lock_mutex_recover(&self.inner);
        for blocker in blockers {
            let waiters = inner.waiting.entry(blocker.clone()).or_default();
            if !waiters.iter().any(|w| w == id) {
                waiters.push(id.to_string());
            }
        }
    }

    /// Remove a task's footprint and hand back the tasks that were waiting on it.
    ///
    /// Returned tasks are dropped from every other waiting list, so each
    /// deferred task is released exactly once. Unregistering twice is a no-op.
    pub fn unregister(&self, id: &str) -> Vec<TaskId> {
        let mut inner = lock_mutex_recover(&self.inner);
        inner.footprints.remove(id);
        let released = inner.waiting.remove(id).unwrap_or_default();
        if !released.is_empty() {
            for waiters in inner.waiting.values_mut() {
                waiters.retain(|w| !released.contains(w));
            }
            inner.waiting.retain(|_, waiters| !waiters.is_empty());
            log::debug!(
                "[OverlapDetector] {} finished, releasing {:?}",
                id,
                released
            );
        }
        released
    }

    pub fn is_registered(&self, id: &str) -> bool {
        lock_mutex_recover(&self.inner).footprints.contains_key(id)
    }

    /// Number of tasks currently deferred on some blocker
    pub fn waiting_count(&self) -> usize {
        let inner = lock_mutex_recover(&self.inner);
        let unique: HashSet<&TaskId> = inner.waiting.values().flatten().collect();
        unique.len()
    }

    pub fn registered_count(&self) -> usize {
        lock_mutex_recover(&self.inner).footprints.len()
    }
}

impl Default for OverlapDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("src/"), "src");
        assert_eq!(normalize_path("  a\\b.rs "), "a/b.rs");
    }

    #[test]
    fn test_disjoint_footprints_do_not_overlap() {
        let detector = OverlapDetector::new();
        detector.register("a", ["src/a.rs"]);
        assert!(detector.check_overlap(["src/b.rs"]).is_empty());
    }

    #[test]
    fn test_shared_file_overlaps() {
        let detector = OverlapDetector::new();
        detector.register("a", ["src/a.rs", "README.md"]);
        detector.register("b", ["src/b.rs"]);
        assert_eq!(
            detector.check_overlap(["./README.md", "src/c.rs"]),
            vec!["a".to_string()]
        );
        assert_eq!(
            detector.shared_files("a", ["README.md", "src/c.rs"]),
            vec!["README.md".to_string()]
        );
    }

    #[test]
    fn test_exact_membership_only() {
        let detector = OverlapDetector::new();
        detector.register("a", ["src"]);
        assert!(detector.check_overlap(["src/lib.rs"]).is_empty());
    }

    #[test]
    fn test_empty_footprint_never_overlaps() {
        let detector = OverlapDetector::new();
        detector.register("a", Vec::<String>::new());
        detector.register("b", ["x.rs"]);
        assert!(detector.check_overlap(Vec::<String>::new()).is_empty());
        assert!(detector.check_overlap(["y.rs"]).is_empty());
    }

    #[test]
    fn test_register_is_idempotent() {
        let detector = OverlapDetector::new();
        detector.register("a", ["x.rs"]);
        detector.register("a", ["x.rs"]);
        assert_eq!(detector.registered_count(), 1);
        assert_eq!(detector.check_overlap(["x.rs"]), vec!["a".to_string()]);
    }

    #[test]
    fn test_unregister_releases_waiters_once() {
        let detector = OverlapDetector::new();
        detector.register("a", ["x.rs"]);
        detector.register("b", ["y.rs"]);

        let blockers = detector.check_overlap(["x.rs", "y.rs"]);
        assert_eq!(blockers, vec!["a".to_string(), "b".to_string()]);
        detector.defer("c", &blockers);
        detector.defer("d", &["a".to_string()]);
        assert_eq!(detector.waiting_count(), 2);

        assert_eq!(
            detector.unregister("a"),
            vec!["c".to_string(), "d".to_string()]
        );
        // c was released already; b finishing must not release it again
        assert!(detector.unregister("b").is_empty());
        assert_eq!(detector.waiting_count(), 0);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let detector = OverlapDetector::new();
        detector.register("a", ["x.rs"]);
        detector.defer("b", &["a".to_string()]);
        assert_eq!(detector.unregister("a"), vec!["b".to_string()]);
        assert!(detector.unregister("a").is_empty());
        assert!(!detector.is_registered("a"));
        assert!(detector.check_overlap(["x.rs"]).is_empty());
    }

    #[test]
    fn test_defer_does_not_duplicate() {
        let detector = OverlapDetector::new();
        detector.register("a", ["x.rs"]);
        detector.defer("b", &["a".to_string()]);
        detector.defer("b", &["a".to_string()]);
        assert_eq!(detector.unregister("a"), vec!["b".to_string()]);
    }
}
