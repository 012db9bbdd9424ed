//! Callable Registry: handle-keyed storage for native callables.
//!
//! Foreign code only ever holds a [`Handle`]; the callable itself stays here.
//! Handles come from a counter, never from the callable's address, so a
//! released handle can't be spoofed into a newer entry.
//!
//! One-shot entries remove themselves when their single invocation returns
//! (or unwinds). Lookups made re-entrantly *during* that invocation still see
//! the entry; no lookup after it does.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tether_ffi::Handle;

use super::sync::{lock, AtomicU64, Mutex, Ordering};

/// A stored callable. Receives the interpreter, returns the number of values
/// it left on the interpreter stack.
pub type Callable<I> = Arc<dyn Fn(&mut I) -> i32 + Send + Sync>;

type Table<I> = Mutex<HashMap<Handle, Callable<I>>>;

/// Take the next handle from a counter that starts at 1.
///
/// Handles are never reused, so running out is fatal rather than wrapping
/// into live entries. That takes `usize::MAX - 1` allocations: 2^32 on 32-bit
/// targets, never in practice on 64-bit ones.
pub(crate) fn next_handle(counter: &AtomicU64) -> Handle {
    let raw = counter.fetch_add(1, Ordering::Relaxed);
    match Handle::new(raw) {
        Some(handle) if handle != Handle::SCRATCH => handle,
        _ => panic!("handle space exhausted after {} allocations", raw.saturating_sub(1)),
    }
}

pub struct CallableRegistry<I> {
    table: Arc<Table<I>>,
    next_handle: AtomicU64,
}

impl<I: 'static> CallableRegistry<I> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(1),
        }
    }

    fn allocate(&self) -> Handle {
        next_handle(&self.next_handle)
    }

    /// Store a callable. Safe to call from any thread.
    pub fn store<F>(&self, f: F, one_shot: bool) -> Handle
    where
        F: Fn(&mut I) -> i32 + Send + Sync + 'static,
    {
        let handle = self.allocate();

        let callable: Callable<I> = if one_shot {
            let table = Arc::downgrade(&self.table);
            Arc::new(move |interp: &mut I| {
                let _remove = RemoveOnDrop { table: &table, handle };
                f(interp)
            })
        } else {
            Arc::new(f)
        };

        lock(&self.table).insert(handle, callable);
        handle
    }

    /// Store an `FnOnce` as a one-shot entry.
    ///
    /// Invoking it a second time (only possible through a re-entrant lookup
    /// during the first call) is a fault.
    pub fn store_once<F>(&self, f: F) -> Handle
    where
        F: FnOnce(&mut I) -> i32 + Send + 'static,
    {
        let slot = Mutex::new(Some(f));
        self.store(
            move |interp: &mut I| {
                let f = lock(&slot).take();
                match f {
                    Some(f) => f(interp),
                    None => panic!("one-shot callable invoked more than once"),
                }
            },
            true,
        )
    }

    pub fn get(&self, handle: Handle) -> Option<Callable<I>> {
        lock(&self.table).get(&handle).cloned()
    }

    /// Remove an entry. Idempotent; returns whether anything was removed.
    pub fn release(&self, handle: Handle) -> bool {
        let removed = lock(&self.table).remove(&handle);
        // The callable (and whatever it captured) drops outside the lock
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<Callable<I>> = lock(&self.table).drain().map(|(_, f)| f).collect();
        drained.len()
    }
}

impl<I: 'static> Default for CallableRegistry<I> {
    fn default() -> Self {
        Self::new()
    }
}

struct RemoveOnDrop<'a, I> {
    table: &'a Weak<Table<I>>,
    handle: Handle,
}

impl<I> Drop for RemoveOnDrop<'_, I> {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            let removed = lock(&table).remove(&self.handle);
            drop(removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::thread;

    struct Interp(Vec<i32>);

    #[test]
    fn store_get_release() {
        let reg = CallableRegistry::<Interp>::new();
        let h = reg.store(|i: &mut Interp| { i.0.push(1); 1 }, false);

        let f = reg.get(h).expect("stored callable");
        let mut interp = Interp(vec![]);
        assert_eq!(f(&mut interp), 1);
        assert_eq!(f(&mut interp), 1);
        assert_eq!(interp.0, vec![1, 1]);

        assert!(reg.release(h));
        assert!(reg.get(h).is_none());
        assert!(!reg.release(h));
    }

    #[test]
    fn unknown_handle_misses() {
        let reg = CallableRegistry::<Interp>::new();
        assert!(reg.get(Handle::new(999).unwrap()).is_none());
        assert!(!reg.release(Handle::new(999).unwrap()));
    }

    #[test]
    fn one_shot_removes_itself_after_call() {
        let reg = Arc::new(CallableRegistry::<Interp>::new());
        let seen_during_call = Arc::new(Mutex::new(None));

        let reg2 = reg.clone();
        let seen = seen_during_call.clone();
        let h = reg.store(
            move |_: &mut Interp| {
                // Re-entrant lookup still sees the entry
                let me = Handle::new(1).unwrap();
                *lock(&seen) = Some(reg2.get(me).is_some());
                0
            },
            true,
        );
        assert_eq!(h.get(), 1);

        let f = reg.get(h).unwrap();
        f(&mut Interp(vec![]));

        assert_eq!(*lock(&seen_during_call), Some(true));
        assert!(reg.get(h).is_none());
    }

    #[test]
    fn one_shot_removed_even_when_it_panics() {
        let reg = CallableRegistry::<Interp>::new();
        let h = reg.store(|_: &mut Interp| panic!("nope"), true);

        let f = reg.get(h).unwrap();
        let result = catch_unwind(AssertUnwindSafe(|| f(&mut Interp(vec![]))));
        assert!(result.is_err());
        assert!(reg.get(h).is_none());
    }

    #[test]
    fn store_once_moves_captured_state() {
        let reg = CallableRegistry::<Interp>::new();
        let payload = vec![4, 5, 6];
        let h = reg.store_once(move |i: &mut Interp| {
            i.0.extend(payload);
            3
        });

        let mut interp = Interp(vec![]);
        let f = reg.get(h).unwrap();
        assert_eq!(f(&mut interp), 3);
        assert_eq!(interp.0, vec![4, 5, 6]);
        assert!(reg.is_empty());

        // The Arc we still hold is spent
        let again = catch_unwind(AssertUnwindSafe(|| f(&mut interp)));
        assert!(again.is_err());
    }

    #[test]
    fn concurrent_stores_never_collide() {
        let reg = Arc::new(CallableRegistry::<Interp>::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|_| reg.store(|_: &mut Interp| 0, false))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for t in threads {
            for h in t.join().unwrap() {
                assert!(all.insert(h), "duplicate handle {:?}", h);
            }
        }
        assert_eq!(all.len(), 800);
        assert_eq!(reg.len(), 800);
        assert_eq!(reg.clear(), 800);
        assert!(reg.is_empty());
    }

    #[test]
    fn released_handles_are_not_reused() {
        let reg = CallableRegistry::<Interp>::new();
        let a = reg.store(|_: &mut Interp| 0, false);
        reg.release(a);
        let b = reg.store(|_: &mut Interp| 0, false);
        assert_ne!(a, b);
        assert!(reg.get(a).is_none());
    }

    #[test]
    fn exhausted_counter_never_yields_scratch() {
        let counter = AtomicU64::new(Handle::SCRATCH.get() - 1);
        let last = next_handle(&counter);
        assert_ne!(last, Handle::SCRATCH);

        let result = catch_unwind(AssertUnwindSafe(|| next_handle(&counter)));
        assert!(result.is_err());
        let again = catch_unwind(AssertUnwindSafe(|| next_handle(&counter)));
        assert!(again.is_err());
    }
}
