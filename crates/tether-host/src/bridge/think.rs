//! Think Queue: the per-tick bridge from background threads to the
//! interpreter thread.
//!
//! ```text
//!   any thread                          interpreter thread (once per tick)
//!   ──────────                          ──────────────────────────────────
//!   submit ──► TaskChannel (bounded) ─┐
//!                                     ├─► process()
//!   submit_persistent ──► inbox ──────┘     1. adopt inbox into `persistent`
//!                                            2. run every persistent callback
//!                                            3. drain up to the budget
//! ```
//!
//! The queue only moves [`Handle`]s; the callables live in the
//! [`CallableRegistry`]. A persistent callback signals completion by
//! returning [`DONE`].

use tether_ffi::Handle;

use super::config::DrainPolicy;
use super::dispatch;
use super::error::BridgeError;
use super::interp::Interpreter;
use super::registry::CallableRegistry;
use super::sync::{lock, AtomicBool, AtomicUsize, Mutex, Ordering, RemoteQueue, TaskChannel};

/// Return value of a persistent callback that wants to be removed.
pub const DONE: i32 = 1;

/// What a persistent callback wants after this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Think {
    Continue,
    Done,
}

impl Think {
    pub fn code(self) -> i32 {
        match self {
            Think::Continue => 0,
            Think::Done => DONE,
        }
    }
}

/// Work done by one [`ThinkQueue::process`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub persistent_run: usize,
    pub persistent_done: usize,
    pub tasks_run: usize,
    pub errors: usize,
}

impl TickReport {
    pub fn processed(&self) -> usize {
        self.persistent_done + self.tasks_run
    }
}

pub struct ThinkQueue {
    tasks: TaskChannel<Handle>,
    inbox: RemoteQueue<Handle>,
    persistent: Mutex<Vec<Handle>>,
    pending: AtomicUsize,
    policy: DrainPolicy,
    closed: AtomicBool,
}

impl ThinkQueue {
    pub fn new(capacity: usize, policy: DrainPolicy) -> Self {
        Self {
            tasks: TaskChannel::new(capacity.max(1)),
            inbox: RemoteQueue::new(),
            persistent: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            policy,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a one-shot task. Blocks while the queue is full.
    ///
    /// Hands the handle back if the queue is closed before, while waiting, or
    /// as the handle lands. An accepted handle is always either drained by a
    /// tick or returned by [`ThinkQueue::close`].
    pub fn enqueue(&self, handle: Handle) -> Result<(), Handle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(handle);
        }
        // Counted before it becomes visible to the tick, so a drain can never
        // decrement below zero.
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tasks.send(handle).map_err(|handle| {
            self.release_pending(1);
            handle
        })
    }

    /// Queue a persistent callback. Never blocks.
    pub fn enqueue_persistent(&self, handle: Handle) -> Result<(), Handle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(handle);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.inbox.push(handle);
        Ok(())
    }

    /// One-shot tasks queued plus persistent callbacks not yet done.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// One-shot tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.tasks.len()
    }

    pub fn persistent_count(&self) -> usize {
        lock(&self.persistent).len() + self.inbox.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn release_pending(&self, n: usize) {
        if n == 0 {
            return;
        }
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                Some(p.saturating_sub(n))
            });
    }

    /// Close the queue and return every handle that never ran.
    ///
    /// Submitters blocked on a full queue wake up with their handle handed
    /// back. Idempotent.
    pub fn close(&self) -> Vec<Handle> {
        self.closed.store(true, Ordering::Release);
        let mut leftovers = self.tasks.close();
        leftovers.append(&mut lock(&self.persistent));
        while let Some(handle) = self.inbox.pop() {
            leftovers.push(handle);
        }
        self.pending.store(0, Ordering::Release);
        leftovers
    }

    /// Run one tick. Interpreter thread only.
    pub fn process<I: Interpreter>(
        &self,
        registry: &CallableRegistry<I>,
        interp: &mut I,
    ) -> TickReport {
        let mut report = TickReport::default();

        // Persistent callbacks first. The list is taken out so callbacks can
        // submit more work without touching a held lock.
        let mut current = std::mem::take(&mut *lock(&self.persistent));
        while let Some(handle) = self.inbox.pop() {
            current.push(handle);
        }

        let mut dropped = 0;
        let mut kept = Vec::with_capacity(current.len());
        for handle in current {
            interp.clear_stack();
            report.persistent_run += 1;
            match dispatch::invoke(registry, handle, interp) {
                Ok(DONE) => {
                    registry.release(handle);
                    report.persistent_done += 1;
                }
                Ok(_) => kept.push(handle),
                // Released elsewhere: cancelled
                Err(BridgeError::HandleNotFound(_)) => dropped += 1,
                Err(err) => {
                    report.errors += 1;
                    surface(interp, "persistent callback", &err);
                    kept.push(handle);
                }
            }
        }

        if !self.is_closed() {
            let mut list = lock(&self.persistent);
            kept.append(&mut list);
            *list = kept;
        }

        let budget = self.policy.budget(self.tasks.len());
        let mut drained = 0;
        while drained < budget {
            let Some(handle) = self.tasks.try_recv() else {
                break;
            };
            drained += 1;
            interp.clear_stack();
            match dispatch::invoke(registry, handle, interp) {
                Ok(_) => report.tasks_run += 1,
                Err(err) => {
                    report.errors += 1;
                    surface(interp, "queued task", &err);
                }
            }
        }

        if !self.is_closed() {
            self.release_pending(report.persistent_done + dropped + drained);
        }
        report
    }
}

fn surface<I: Interpreter>(interp: &mut I, what: &str, err: &BridgeError) {
    log::warn!("[bridge] {} failed: {}", what, err);
    interp.warn(&format!("{} failed: {}", what, err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::interp::testing::RecordingInterpreter;
    use std::sync::Arc;

    fn queue(policy: DrainPolicy) -> (ThinkQueue, CallableRegistry<RecordingInterpreter>) {
        (ThinkQueue::new(16, policy), CallableRegistry::new())
    }

    fn push_task(
        q: &ThinkQueue,
        reg: &CallableRegistry<RecordingInterpreter>,
        value: i64,
    ) -> Handle {
        let h = reg.store_once(move |i: &mut RecordingInterpreter| {
            i.warnings.push(format!("ran {}", value));
            0
        });
        q.enqueue(h).unwrap();
        h
    }

    fn ran(interp: &RecordingInterpreter) -> Vec<String> {
        interp
            .warnings
            .iter()
            .filter(|w| w.starts_with("ran "))
            .cloned()
            .collect()
    }

    #[test]
    fn bounded_drain_keeps_order_across_ticks() {
        let (q, reg) = queue(DrainPolicy::Bounded(3));
        for v in 0..7 {
            push_task(&q, &reg, v);
        }
        let mut interp = RecordingInterpreter::default();

        assert_eq!(q.process(&reg, &mut interp).tasks_run, 3);
        assert_eq!(q.pending(), 4);
        assert_eq!(q.process(&reg, &mut interp).tasks_run, 3);
        assert_eq!(q.process(&reg, &mut interp).tasks_run, 1);
        assert_eq!(q.pending(), 0);

        let expected: Vec<String> = (0..7).map(|v| format!("ran {}", v)).collect();
        assert_eq!(ran(&interp), expected);
        assert!(reg.is_empty());
    }

    #[test]
    fn drain_all_empties_the_queue() {
        let (q, reg) = queue(DrainPolicy::All);
        for v in 0..10 {
            push_task(&q, &reg, v);
        }
        let mut interp = RecordingInterpreter::default();
        let report = q.process(&reg, &mut interp);
        assert_eq!(report.tasks_run, 10);
        assert_eq!(q.queued(), 0);
    }

    #[test]
    fn work_submitted_during_drain_waits_for_next_tick() {
        let q = Arc::new(ThinkQueue::new(16, DrainPolicy::All));
        let reg = Arc::new(CallableRegistry::<RecordingInterpreter>::new());

        let (q2, reg2) = (q.clone(), reg.clone());
        let h = reg.store_once(move |_: &mut RecordingInterpreter| {
            let inner = reg2.store_once(|_: &mut RecordingInterpreter| 0);
            q2.enqueue(inner).unwrap();
            0
        });
        q.enqueue(h).unwrap();

        let mut interp = RecordingInterpreter::default();
        assert_eq!(q.process(&reg, &mut interp).tasks_run, 1);
        assert_eq!(q.queued(), 1);
        assert_eq!(q.process(&reg, &mut interp).tasks_run, 1);
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn stack_is_cleared_before_each_task() {
        let (q, reg) = queue(DrainPolicy::All);
        for _ in 0..2 {
            let h = reg.store_once(|i: &mut RecordingInterpreter| {
                assert!(i.stack.is_empty());
                i.stack.push(42);
                1
            });
            q.enqueue(h).unwrap();
        }
        let mut interp = RecordingInterpreter::default();
        interp.stack.push(7);
        let report = q.process(&reg, &mut interp);
        assert_eq!(report.tasks_run, 2);
        assert_eq!(report.errors, 0);
        assert_eq!(interp.clears, 2);
    }

    #[test]
    fn failing_task_is_surfaced_and_drain_continues() {
        let (q, reg) = queue(DrainPolicy::All);
        let bad = reg.store_once(|_: &mut RecordingInterpreter| panic!("exploded"));
        q.enqueue(bad).unwrap();
        push_task(&q, &reg, 1);

        let mut interp = RecordingInterpreter::default();
        let report = q.process(&reg, &mut interp);
        assert_eq!(report.errors, 1);
        assert_eq!(report.tasks_run, 1);
        assert!(interp.warnings.iter().any(|w| w.contains("exploded")));
        assert_eq!(ran(&interp), vec!["ran 1".to_string()]);
        assert_eq!(q.pending(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn persistent_runs_until_done() {
        let (q, reg) = queue(DrainPolicy::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let h = reg.store(
            move |_: &mut RecordingInterpreter| {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 3 { DONE } else { 0 }
            },
            false,
        );
        q.enqueue_persistent(h).unwrap();
        assert_eq!(q.pending(), 1);

        let mut interp = RecordingInterpreter::default();
        for _ in 0..5 {
            q.process(&reg, &mut interp);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(q.persistent_count(), 0);
        assert_eq!(q.pending(), 0);
        assert!(reg.get(h).is_none());
    }

    #[test]
    fn persistent_runs_before_tasks() {
        let (q, reg) = queue(DrainPolicy::All);
        push_task(&q, &reg, 1);
        let h = reg.store(
            |i: &mut RecordingInterpreter| {
                i.warnings.push("ran persistent".into());
                DONE
            },
            false,
        );
        q.enqueue_persistent(h).unwrap();

        let mut interp = RecordingInterpreter::default();
        let report = q.process(&reg, &mut interp);
        assert_eq!(report.processed(), 2);
        assert_eq!(ran(&interp), vec!["ran persistent".to_string(), "ran 1".to_string()]);
    }

    #[test]
    fn failing_persistent_is_kept() {
        let (q, reg) = queue(DrainPolicy::default());
        let h = reg.store(|_: &mut RecordingInterpreter| panic!("flaky"), false);
        q.enqueue_persistent(h).unwrap();

        let mut interp = RecordingInterpreter::default();
        q.process(&reg, &mut interp);
        q.process(&reg, &mut interp);
        assert_eq!(interp.warnings.len(), 2);
        assert_eq!(q.persistent_count(), 1);
        assert_eq!(q.pending(), 1);
    }

    #[test]
    fn released_persistent_is_dropped() {
        let (q, reg) = queue(DrainPolicy::default());
        let h = reg.store(|_: &mut RecordingInterpreter| 0, false);
        q.enqueue_persistent(h).unwrap();
        reg.release(h);

        let mut interp = RecordingInterpreter::default();
        let report = q.process(&reg, &mut interp);
        assert_eq!(report.errors, 0);
        assert_eq!(q.persistent_count(), 0);
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn close_returns_everything_and_rejects() {
        let (q, reg) = queue(DrainPolicy::default());
        let a = push_task(&q, &reg, 1);
        let p = reg.store(|_: &mut RecordingInterpreter| 0, false);
        q.enqueue_persistent(p).unwrap();

        let leftovers = q.close();
        assert_eq!(leftovers, vec![a, p]);
        assert_eq!(q.pending(), 0);
        assert!(q.is_closed());
        assert_eq!(q.enqueue(a), Err(a));
        assert_eq!(q.enqueue_persistent(p), Err(p));

        let mut interp = RecordingInterpreter::default();
        assert_eq!(q.process(&reg, &mut interp), TickReport::default());
        assert!(q.close().is_empty());
    }

    #[test]
    fn accepted_handles_survive_a_racing_close() {
        use std::collections::HashSet;
        use std::thread;
        use std::time::Duration;

        for _ in 0..20 {
            let q = Arc::new(ThinkQueue::new(1, DrainPolicy::All));
            q.enqueue(Handle::new(1).unwrap()).unwrap();

            let senders: Vec<_> = (2..10u64)
                .map(|raw| {
                    let q = q.clone();
                    thread::spawn(move || {
                        let h = Handle::new(raw).unwrap();
                        q.enqueue(h).ok().map(|()| h)
                    })
                })
                .collect();

            // A few receives free slots for parked senders, then close races them.
            let mut received = HashSet::new();
            for _ in 0..3 {
                thread::sleep(Duration::from_millis(1));
                if let Some(h) = q.tasks.try_recv() {
                    received.insert(h);
                }
            }
            let leftovers: HashSet<_> = q.close().into_iter().collect();

            for sender in senders {
                if let Some(h) = sender.join().unwrap() {
                    assert!(
                        received.contains(&h) || leftovers.contains(&h),
                        "{} was accepted but neither ran nor came back from close",
                        h
                    );
                }
            }
            assert_eq!(q.pending(), 0);
        }
    }
}
