use crate::util::{lock, remove_file_best_effort};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

/// Backing files whose deletion has to wait.
///
/// A file lands here when removing it failed (some platforms refuse to delete
/// open files) or when a reader or writer inside this process still holds it.
/// The pending set is persisted with the cache state so deletions are retried
/// after a restart.
#[derive(Debug)]
pub(crate) struct DeferredDeletionSet {
    root: PathBuf,
    state: Mutex<DeferredState>,
}

#[derive(Debug, Default)]
struct DeferredState {
    pending: BTreeSet<String>,
    /// Open stream count per backing file.
    pins: HashMap<String, usize>,
}

impl DeferredState {
    fn is_pinned(&self, file_name: &str) -> bool {
        self.pins.contains_key(file_name)
    }
}

impl DeferredDeletionSet {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(DeferredState::default()),
        }
    }

    /// Queues `file_name` for a later deletion attempt. Idempotent.
    pub(crate) fn remember(&self, file_name: &str) -> bool {
        lock(&self.state).pending.insert(file_name.to_string())
    }

    pub(crate) fn extend(&self, file_names: impl IntoIterator<Item = String>) {
        lock(&self.state).pending.extend(file_names);
    }

    pub(crate) fn contains(&self, file_name: &str) -> bool {
        lock(&self.state).pending.contains(file_name)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Pending names, in a stable order for persistence.
    pub(crate) fn snapshot(&self) -> Vec<String> {
        lock(&self.state).pending.iter().cloned().collect()
    }

    /// Marks `file_name` as held open by a stream.
    pub(crate) fn pin(&self, file_name: &str) {
        *lock(&self.state)
            .pins
            .entry(file_name.to_string())
            .or_insert(0) += 1;
    }

    /// Releases one hold on `file_name`.
    pub(crate) fn unpin(&self, file_name: &str) {
        let mut state = lock(&self.state);
        if let Some(count) = state.pins.get_mut(file_name) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(file_name);
            }
        }
    }

    /// Deletes `file_name` now if possible, otherwise queues it.
    ///
    /// Returns `true` if the file is gone.
    pub(crate) fn delete_or_defer(&self, file_name: &str, reason: &'static str) -> bool {
        let mut state = lock(&self.state);
        if state.is_pinned(file_name) {
            tracing::trace!(
                target = "lru_disk_cache",
                file_name,
                reason,
                "backing file is still open; deferring deletion"
            );
            state.pending.insert(file_name.to_string());
            return false;
        }

        if remove_file_best_effort(&self.root.join(file_name), reason) {
            state.pending.remove(file_name);
            true
        } else {
            state.pending.insert(file_name.to_string());
            false
        }
    }

    /// Retries every pending deletion and returns how many files remain.
    pub(crate) fn sweep(&self) -> usize {
        let mut state = lock(&self.state);
        let DeferredState { pending, pins } = &mut *state;
        let before = pending.len();
        pending.retain(|file_name| {
            pins.contains_key(file_name)
                || !remove_file_best_effort(&self.root.join(file_name), "deferred.sweep")
        });
        let remaining = pending.len();
        if before != remaining {
            tracing::debug!(
                target = "lru_disk_cache",
                deleted = before - remaining,
                remaining,
                "swept deferred deletions"
            );
        }
        remaining
    }
}
