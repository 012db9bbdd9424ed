//! Background Task Tracker.
//!
//! Every background thread the bridge starts holds a [`WaitGroup`] token, so
//! shutdown can wait until none of them can touch the queue or registries.
//! Once shut down the tracker has no group left to hand out, so a spawn that
//! races shutdown either gets a token shutdown waits for or is refused.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
use std::sync::Arc;
use std::thread;

use crossbeam_utils::sync::WaitGroup;

use super::dispatch::panic_message;
use super::error::{BridgeError, Result};
use super::sync::{lock, Mutex};

pub struct TaskTracker {
    /// `None` after [`TaskTracker::shutdown`].
    group: Mutex<Option<WaitGroup>>,
    active: Arc<StdAtomicUsize>,
    next_id: StdAtomicUsize,
}

/// Decrements the active count however the task ends.
struct ActiveGuard(Arc<StdAtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, StdOrdering::AcqRel);
    }
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            group: Mutex::new(Some(WaitGroup::new())),
            active: Arc::new(StdAtomicUsize::new(0)),
            next_id: StdAtomicUsize::new(1),
        }
    }

    /// Run `f` on a new thread named `tether-bg-N`.
    ///
    /// A panic inside `f` is logged and the task still counts as finished.
    /// Fails with [`BridgeError::QueueClosed`] after shutdown.
    pub fn spawn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let (token, guard) = {
            let group = lock(&self.group);
            let token = group.as_ref().ok_or(BridgeError::QueueClosed)?.clone();
            self.active.fetch_add(1, StdOrdering::AcqRel);
            (token, ActiveGuard(self.active.clone()))
        };
        let id = self.next_id.fetch_add(1, StdOrdering::Relaxed);

        let spawned = thread::Builder::new()
            .name(format!("tether-bg-{}", id))
            .spawn(move || {
                let _token = token;
                // Dropped before the token, so `active` is already down when
                // `wait_all` returns.
                let _guard = guard;
                if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                    log::error!(
                        "[bridge] background task {} panicked: {}",
                        id,
                        panic_message(&*payload)
                    );
                }
            });

        match spawned {
            Ok(_) => {
                log::trace!("[bridge] spawned background task {}", id);
                Ok(())
            }
            // The closure (and with it the guard and token) is dropped on
            // failure, which undoes the bookkeeping.
            Err(err) => {
                log::error!("[bridge] failed to spawn background task {}: {}", id, err);
                Err(err.into())
            }
        }
    }

    /// Block until every task spawned so far has finished.
    ///
    /// Tasks spawned while this waits belong to the next round.
    pub fn wait_all(&self) {
        let group = lock(&self.group).replace(WaitGroup::new());
        self.wait(group);
    }

    /// Refuse further spawns, then block until every accepted task has
    /// finished. Idempotent.
    pub fn shutdown(&self) {
        let group = lock(&self.group).take();
        self.wait(group);
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.group).is_none()
    }

    fn wait(&self, group: Option<WaitGroup>) {
        let Some(group) = group else { return };
        let running = self.active();
        if running > 0 {
            log::debug!("[bridge] waiting for {} background task(s)", running);
        }
        group.wait();
    }

    /// Background tasks currently running.
    pub fn active(&self) -> usize {
        self.active.load(StdOrdering::Acquire)
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn wait_all_waits_for_every_task() {
        let tracker = TaskTracker::new();
        let done = Arc::new(StdAtomicUsize::new(0));
        for i in 0..4 {
            let done = done.clone();
            tracker
                .spawn(move || {
                    thread::sleep(Duration::from_millis(10 * i));
                    done.fetch_add(1, StdOrdering::SeqCst);
                })
                .unwrap();
        }
        tracker.wait_all();
        assert_eq!(done.load(StdOrdering::SeqCst), 4);
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn panicking_task_still_finishes() {
        let tracker = TaskTracker::new();
        tracker.spawn(|| panic!("background boom")).unwrap();
        tracker.wait_all();
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn threads_are_named() {
        let tracker = TaskTracker::new();
        let name = Arc::new(std::sync::Mutex::new(String::new()));
        let n = name.clone();
        tracker
            .spawn(move || {
                *n.lock().unwrap() = thread::current().name().unwrap_or("").to_string();
            })
            .unwrap();
        tracker.wait_all();
        assert!(name.lock().unwrap().starts_with("tether-bg-"));
    }

    #[test]
    fn tracker_is_reusable_after_wait() {
        let tracker = TaskTracker::new();
        tracker.wait_all();

        let release = Arc::new(AtomicBool::new(false));
        let r = release.clone();
        tracker
            .spawn(move || {
                while !r.load(StdOrdering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        assert_eq!(tracker.active(), 1);
        release.store(true, StdOrdering::SeqCst);
        tracker.wait_all();
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn spawn_after_shutdown_is_refused() {
        let tracker = TaskTracker::new();
        tracker.shutdown();
        assert!(tracker.is_shut_down());

        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let err = tracker
            .spawn(move || r.store(true, StdOrdering::SeqCst))
            .unwrap_err();
        assert!(matches!(err, BridgeError::QueueClosed));
        assert_eq!(tracker.active(), 0);

        tracker.shutdown();
        tracker.wait_all();
        assert!(!ran.load(StdOrdering::SeqCst));
    }

    #[test]
    fn spawns_racing_shutdown_have_finished_when_it_returns() {
        for _ in 0..20 {
            let tracker = Arc::new(TaskTracker::new());
            let accepted = Arc::new(StdAtomicUsize::new(0));
            let finished = Arc::new(StdAtomicUsize::new(0));

            let spawners: Vec<_> = (0..4)
                .map(|_| {
                    let (tracker, accepted, finished) =
                        (tracker.clone(), accepted.clone(), finished.clone());
                    thread::spawn(move || {
                        for _ in 0..25 {
                            let finished = finished.clone();
                            let spawned = tracker.spawn(move || {
                                thread::sleep(Duration::from_micros(50));
                                finished.fetch_add(1, StdOrdering::SeqCst);
                            });
                            match spawned {
                                Ok(()) => accepted.fetch_add(1, StdOrdering::SeqCst),
                                Err(_) => break,
                            };
                        }
                    })
                })
                .collect();

            thread::sleep(Duration::from_millis(1));
            tracker.shutdown();
            let finished_at_shutdown = finished.load(StdOrdering::SeqCst);

            for spawner in spawners {
                spawner.join().unwrap();
            }
            // Nothing could be accepted after shutdown took the group.
            assert_eq!(accepted.load(StdOrdering::SeqCst), finished_at_shutdown);
            assert_eq!(finished.load(StdOrdering::SeqCst), finished_at_shutdown);
        }
    }
}
