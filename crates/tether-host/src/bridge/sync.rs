//! Synchronization primitives abstraction for loom testing.
//!
//! When compiled with `--cfg loom`, this module uses loom's types which allow
//! deterministic concurrency testing. Otherwise, it uses std types and the
//! crossbeam queues.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[cfg(loom)]
pub(crate) use loom::sync::{Mutex, MutexGuard};

#[cfg(not(loom))]
pub(crate) use std::sync::{Mutex, MutexGuard};

use std::sync::TryLockError;

/// Lock, recovering the guard if a previous holder panicked.
///
/// Callables never run while a bridge lock is held, so a poisoned lock only
/// means a panic unwound through bookkeeping code; the data is still valid.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Like [`lock`], but `None` if the lock is held, including by this thread.
pub(crate) fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

// =============================================================================
// RemoteQueue - lock-free inbox for persistent callbacks
// =============================================================================
//
// Under loom, we use a Mutex<VecDeque> since loom doesn't provide SegQueue.

#[cfg(not(loom))]
mod queue {
    use crossbeam_queue::SegQueue;

    pub struct RemoteQueue<T>(SegQueue<T>);

    impl<T> RemoteQueue<T> {
        pub const fn new() -> Self {
            Self(SegQueue::new())
        }

        pub fn push(&self, value: T) {
            self.0.push(value);
        }

        pub fn pop(&self) -> Option<T> {
            self.0.pop()
        }

        pub fn len(&self) -> usize {
            self.0.len()
        }
    }
}

#[cfg(loom)]
mod queue {
    use loom::sync::Mutex;
    use std::collections::VecDeque;

    pub struct RemoteQueue<T>(Mutex<VecDeque<T>>);

    impl<T> RemoteQueue<T> {
        pub fn new() -> Self {
            Self(Mutex::new(VecDeque::new()))
        }

        pub fn push(&self, value: T) {
            super::lock(&self.0).push_back(value);
        }

        pub fn pop(&self) -> Option<T> {
            super::lock(&self.0).pop_front()
        }

        pub fn len(&self) -> usize {
            super::lock(&self.0).len()
        }
    }
}

pub use queue::RemoteQueue;

// =============================================================================
// TaskChannel - bounded, blocking, closable FIFO for one-shot tasks
// =============================================================================
//
// Senders are any thread; the single receiver is the interpreter thread.
// `close` wakes every blocked sender with an error and hands back whatever
// was still queued.

#[cfg(not(loom))]
mod channel {
    use super::{lock, Mutex};
    use crossbeam_channel::{bounded, Receiver, Sender};

    pub struct TaskChannel<T> {
        tx: Sender<T>,
        rx: Mutex<Option<Receiver<T>>>,
    }

    impl<T> TaskChannel<T> {
        pub fn new(capacity: usize) -> Self {
            let (tx, rx) = bounded(capacity);
            Self {
                tx,
                rx: Mutex::new(Some(rx)),
            }
        }

        /// Blocks while the channel is full. Gives the value back if the
        /// channel is (or becomes) closed.
        ///
        /// A send that lands after `close` has started is also reported as
        /// rejected: `close` may already have finished draining, so the value
        /// would otherwise be dropped with the channel. The receiver slot is
        /// re-checked under the lock `close` holds while draining, so an `Ok`
        /// value is always either received or returned by `close`.
        pub fn send(&self, value: T) -> Result<(), T>
        where
            T: Copy,
        {
            self.tx.send(value).map_err(|e| e.into_inner())?;
            if lock(&self.rx).is_none() {
                return Err(value);
            }
            Ok(())
        }

        pub fn try_recv(&self) -> Option<T> {
            lock(&self.rx).as_ref()?.try_recv().ok()
        }

        pub fn close(&self) -> Vec<T> {
            let Some(rx) = lock(&self.rx).take() else {
                return Vec::new();
            };
            let rest = rx.try_iter().collect();
            // Dropping the last receiver disconnects the channel, which
            // unblocks every sender parked in `send`.
            drop(rx);
            rest
        }

        pub fn len(&self) -> usize {
            self.tx.len()
        }
    }
}

#[cfg(loom)]
mod channel {
    use super::{lock, Mutex};
    use loom::sync::Condvar;
    use std::collections::VecDeque;

    struct Buffer<T> {
        items: VecDeque<T>,
        disconnected: bool,
    }

    /// Same shape as the crossbeam version: the buffer and the receiver slot
    /// are locked separately, and `close` drains item by item before it
    /// disconnects, so a blocked sender can refill the freed slot mid-drain.
    pub struct TaskChannel<T> {
        buffer: Mutex<Buffer<T>>,
        space: Condvar,
        rx: Mutex<bool>,
        capacity: usize,
    }

    impl<T> TaskChannel<T> {
        pub fn new(capacity: usize) -> Self {
            Self {
                buffer: Mutex::new(Buffer {
                    items: VecDeque::with_capacity(capacity),
                    disconnected: false,
                }),
                space: Condvar::new(),
                rx: Mutex::new(true),
                capacity,
            }
        }

        pub fn send(&self, value: T) -> Result<(), T>
        where
            T: Copy,
        {
            {
                let mut buffer = lock(&self.buffer);
                while !buffer.disconnected && buffer.items.len() >= self.capacity {
                    buffer = self
                        .space
                        .wait(buffer)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                if buffer.disconnected {
                    return Err(value);
                }
                buffer.items.push_back(value);
            }
            if !*lock(&self.rx) {
                return Err(value);
            }
            Ok(())
        }

        fn recv_one(&self) -> Option<T> {
            let mut buffer = lock(&self.buffer);
            let value = buffer.items.pop_front();
            if value.is_some() {
                self.space.notify_one();
            }
            value
        }

        pub fn try_recv(&self) -> Option<T> {
            let rx = lock(&self.rx);
            if !*rx {
                return None;
            }
            self.recv_one()
        }

        pub fn close(&self) -> Vec<T> {
            let mut rx = lock(&self.rx);
            if !*rx {
                return Vec::new();
            }
            let mut rest = Vec::new();
            while let Some(value) = self.recv_one() {
                rest.push(value);
            }
            {
                let mut buffer = lock(&self.buffer);
                buffer.disconnected = true;
                buffer.items.clear();
                self.space.notify_all();
            }
            *rx = false;
            rest
        }

        pub fn len(&self) -> usize {
            lock(&self.buffer).items.len()
        }
    }
}

pub use channel::TaskChannel;


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn accepted_send_is_received_or_returned_by_close() {
        loom::model(|| {
            let ch = Arc::new(TaskChannel::new(1));
            ch.send(1u32).unwrap();

            let ch2 = ch.clone();
            let sender = thread::spawn(move || ch2.send(2u32));
            let ch3 = ch.clone();
            let tick = thread::spawn(move || ch3.try_recv());

            let leftovers = ch.close();
            let received = tick.join().unwrap();
            if sender.join().unwrap().is_ok() {
                assert!(received == Some(2) || leftovers.contains(&2));
            }
            assert_eq!(ch.try_recv(), None);
        });
    }
}
