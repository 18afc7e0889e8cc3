use crate::util::lock;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Work performed by the save task once its interval elapses.
pub(crate) trait BackgroundSave: Send + Sync + 'static {
    /// Persists dirty state. Failures are handled by the implementor.
    fn save_in_background(&self);
}

/// Periodic saver for one cache instance.
///
/// At most one task is alive at a time. A task sleeps for the configured
/// interval, saves if the owner is dirty, and exits as soon as it wakes up to
/// find nothing to do; the next mutation starts a fresh one.
#[derive(Debug)]
pub(crate) struct SaveScheduler {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
}

#[derive(Debug)]
struct SchedulerState {
    dirty: bool,
    running: bool,
    shutdown: bool,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl SaveScheduler {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState {
                    dirty: false,
                    running: false,
                    shutdown: false,
                    interval,
                    handle: None,
                }),
                wake: Condvar::new(),
            }),
        }
    }

    /// Marks the owner dirty and makes sure a save task is alive.
    ///
    /// Idempotent: if a task is already running it picks the change up on its
    /// next wake-up. After [`SaveScheduler::shutdown`] only the flag is set.
    pub(crate) fn ensure_scheduled(&self, owner: Weak<dyn BackgroundSave>) {
        let mut state = lock(&self.shared.state);
        state.dirty = true;
        if state.running || state.shutdown {
            return;
        }

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("lru-disk-cache-save".to_string())
            .spawn(move || save_loop(shared, owner));
        match spawned {
            Ok(handle) => {
                state.running = true;
                // A previous handle belongs to a task that already exited.
                state.handle = Some(handle);
            }
            Err(err) => {
                tracing::warn!(
                    target = "lru_disk_cache",
                    error = %err,
                    "failed to start background save task; state is saved on close"
                );
            }
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        lock(&self.shared.state).dirty
    }

    /// Clears the dirty flag ahead of taking a snapshot to save.
    ///
    /// Mutations that land after this call set the flag again.
    pub(crate) fn clear_dirty(&self) {
        lock(&self.shared.state).dirty = false;
    }

    /// Sets the dirty flag without starting a task.
    pub(crate) fn mark_dirty(&self) {
        lock(&self.shared.state).dirty = true;
    }

    pub(crate) fn interval(&self) -> Duration {
        lock(&self.shared.state).interval
    }

    /// Takes effect from the next sleep; an ongoing sleep is not shortened.
    pub(crate) fn set_interval(&self, interval: Duration) {
        lock(&self.shared.state).interval = interval;
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        lock(&self.shared.state).running
    }

    /// Stops the save task and waits for it to exit.
    ///
    /// A save that is already in progress runs to completion. No new task is
    /// started afterwards.
    pub(crate) fn shutdown(&self) {
        let handle = {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            self.shared.wake.notify_all();
            state.handle.take()
        };

        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::warn!(
                target = "lru_disk_cache",
                "background save task panicked"
            );
        }
    }
}

fn save_loop(shared: Arc<Shared>, owner: Weak<dyn BackgroundSave>) {
    loop {
        {
            let mut state = lock(&shared.state);
            let deadline = Instant::now() + state.interval;
            while !state.shutdown {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                state = match shared.wake.wait_timeout(state, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            if state.shutdown || !state.dirty {
                state.running = false;
                return;
            }
        }

        let Some(owner) = owner.upgrade() else {
            lock(&shared.state).running = false;
            return;
        };
        tracing::trace!(target = "lru_disk_cache", "background save");
        owner.save_in_background();
    }
}
