//! Bridge between background threads and a single-threaded embedded
//! interpreter.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           Bridge<I>                                  │
//! │                                                                      │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────────────┐  │
//! │  │ CallableRegistry │  │ PointerRegistry  │  │ TaskTracker        │  │
//! │  │ Handle → Fn(&mut │  │ Handle → Arc<dyn │  │ WaitGroup of       │  │
//! │  │   I) -> i32      │  │   Any>  +scratch │  │ tether-bg-N        │  │
//! │  └────────▲─────────┘  └──────────────────┘  └────────────────────┘  │
//! │           │ invoke                                                   │
//! │  ┌────────┴─────────┐        ┌────────────────────────────────────┐  │
//! │  │ dispatch         │◄───────│ ThinkQueue                         │  │
//! │  │ catch_unwind →   │        │ bounded FIFO (one-shot handles)    │  │
//! │  │ BridgeError      │        │ inbox + list (persistent handles)  │  │
//! │  └────────▲─────────┘        └─────────────────▲──────────────────┘  │
//! └───────────┼────────────────────────────────────┼─────────────────────┘
//!             │ ExportedFn                         │ TimerHook (every frame)
//!     ┌───────┴────────────────────────────────────┴───────┐
//!     │        wrapper layer (C closures, timers)          │
//!     └────────────────────────────────────────────────────┘
//! ```
//!
//! Any thread may store callables, wrap values and submit work. Only the
//! thread that called [`Bridge::open`] may run anything: [`Bridge::invoke`]
//! and [`Bridge::on_tick`] check it.
//!
//! # Lifecycle
//!
//! `open` registers a per-frame timer whose context is the bridge itself and
//! keeps the bridge alive while that timer exists. `close` stops accepting
//! work, wakes blocked submitters, waits for background tasks, removes the
//! timer and drops everything that never ran.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod interp;
pub mod pointers;
pub mod registry;
pub mod tasks;
pub mod think;
pub(crate) mod sync;

use std::ffi::c_void;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{SystemTime, UNIX_EPOCH};

use tether_ffi::{ExportedFn, Handle, TimerHook};

pub use config::{BridgeConfig, DrainPolicy};
pub use error::{BridgeError, Result};
pub use interp::Interpreter;
pub use pointers::PointerRegistry;
pub use registry::{Callable, CallableRegistry};
pub use tasks::TaskTracker;
pub use think::{Think, ThinkQueue, TickReport, DONE};

use sync::{lock, try_lock, AtomicBool, Mutex, Ordering};

pub struct Bridge<I: Interpreter> {
    config: BridgeConfig,
    callables: CallableRegistry<I>,
    pointers: PointerRegistry,
    queue: ThinkQueue,
    tasks: TaskTracker,
    open: AtomicBool,
    owner: ThreadId,
    timer_name: String,
    /// Strong self-reference held while the tick timer is registered.
    keepalive: Mutex<Option<Arc<Self>>>,
}

impl<I: Interpreter> Bridge<I> {
    /// Open the bridge on the interpreter thread and register the tick timer.
    pub fn open(interp: &mut I, config: BridgeConfig) -> Result<Arc<Self>> {
        let timer_name = format!("{}{}{}", config.timer_prefix, random_u32(), unix_nanos());

        let bridge = Arc::new(Self {
            callables: CallableRegistry::new(),
            pointers: PointerRegistry::new(),
            queue: ThinkQueue::new(config.queue_capacity, config.drain_policy),
            tasks: TaskTracker::new(),
            open: AtomicBool::new(true),
            owner: thread::current().id(),
            timer_name,
            keepalive: Mutex::new(None),
            config,
        });

        let hook = TimerHook {
            ctx: Arc::as_ptr(&bridge) as *const c_void,
            tick: dispatch::tick_trampoline::<I>,
        };
        interp.create_timer(&bridge.timer_name, 0.0, 0, hook)?;
        *lock(&bridge.keepalive) = Some(bridge.clone());

        log::debug!(
            "[bridge] opened (timer {}, capacity {}, drain {:?})",
            bridge.timer_name,
            bridge.config.queue_capacity,
            bridge.config.drain_policy
        );
        Ok(bridge)
    }

    /// Shut down. Interpreter thread only; idempotent.
    ///
    /// Blocks until every background task started with [`Bridge::spawn`] has
    /// returned. Those tasks see `QueueClosed` from any further submission,
    /// including one already blocked on a full queue.
    pub fn close(&self, interp: &mut I) -> Result<()> {
        self.check_thread()?;
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let leftovers = self.queue.close();
        self.tasks.shutdown();

        interp.remove_timer(&self.timer_name);
        let keepalive = lock(&self.keepalive).take();

        for handle in &leftovers {
            self.callables.release(*handle);
        }
        let callables = self.callables.clear();
        let pointers = self.pointers.clear();
        log::debug!(
            "[bridge] closed: dropped {} unrun task(s), {} callable(s), {} value(s)",
            leftovers.len(),
            callables,
            pointers
        );

        // The caller's own reference keeps `self` alive past this.
        drop(keepalive);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BridgeError::QueueClosed)
        }
    }

    fn check_thread(&self) -> Result<()> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(BridgeError::ForeignThread)
        }
    }

    // =========================================================================
    // Any thread
    // =========================================================================

    /// Queue `f` to run once on the interpreter thread.
    ///
    /// Blocks while the queue is full. Fails with `QueueClosed` if the bridge
    /// is closed before or while waiting; `f` is then dropped unrun.
    pub fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut I) + Send + 'static,
    {
        self.check_open()?;
        let handle = self.callables.store_once(move |interp: &mut I| {
            f(interp);
            0
        });
        self.queue.enqueue(handle).map_err(|handle| {
            self.callables.release(handle);
            BridgeError::QueueClosed
        })
    }

    /// Run `f` once per tick, before queued tasks, until it returns
    /// [`Think::Done`]. The returned handle cancels it via [`Bridge::release`].
    ///
    /// `f` is not re-entrant: invoking its own handle from inside it fails
    /// with `CallableFault` instead of deadlocking.
    pub fn submit_persistent<F>(&self, f: F) -> Result<Handle>
    where
        F: FnMut(&mut I) -> Think + Send + 'static,
    {
        self.check_open()?;
        let f = Mutex::new(f);
        let handle = self.callables.store(
            move |interp: &mut I| {
                let Some(mut f) = try_lock(&f) else {
                    panic!("persistent callback invoked itself while running");
                };
                (*f)(interp).code()
            },
            false,
        );
        self.queue.enqueue_persistent(handle).map_err(|handle| {
            self.callables.release(handle);
            BridgeError::QueueClosed
        })?;
        Ok(handle)
    }

    /// Run `f` on a tracked background thread.
    ///
    /// Fails with `QueueClosed` once [`Bridge::close`] has started; a spawn
    /// that races it is either refused or waited for by it.
    pub fn spawn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_open()?;
        self.tasks.spawn(f)
    }

    /// Forget a callable. A persistent callback released this way is dropped
    /// from the queue on the next tick without running again.
    pub fn release(&self, handle: Handle) -> bool {
        self.callables.release(handle)
    }

    // =========================================================================
    // Interpreter thread
    // =========================================================================

    /// Call a registered callable. Faults come back as `CallableFault`.
    pub fn invoke(&self, handle: Handle, interp: &mut I) -> Result<i32> {
        self.check_thread()?;
        self.check_open()?;
        dispatch::invoke(&self.callables, handle, interp)
    }

    /// Run one tick: persistent callbacks, then up to the drain budget of
    /// queued tasks. Normally driven by the registered timer.
    pub fn on_tick(&self, interp: &mut I) -> Result<TickReport> {
        self.check_thread()?;
        self.check_open()?;
        let report = self.queue.process(&self.callables, interp);
        if report.persistent_run + report.tasks_run > 0 {
            log::trace!("[bridge] tick: {:?}", report);
        }
        Ok(report)
    }

    /// Register `f` and return what the wrapper layer needs to push it as a
    /// C closure. Valid while the bridge is alive.
    pub fn export<F>(self: &Arc<Self>, f: F) -> ExportedFn
    where
        F: Fn(&mut I) -> i32 + Send + Sync + 'static,
    {
        let handle = self.callables.store(f, false);
        self.exported(handle)
    }

    /// Like [`Bridge::export`], but the callable removes itself after its
    /// first call.
    pub fn export_once<F>(self: &Arc<Self>, f: F) -> ExportedFn
    where
        F: FnOnce(&mut I) -> i32 + Send + 'static,
    {
        let handle = self.callables.store_once(f);
        self.exported(handle)
    }

    fn exported(self: &Arc<Self>, handle: Handle) -> ExportedFn {
        ExportedFn {
            ctx: Arc::as_ptr(self) as *const c_void,
            handle: handle.as_ptr(),
            call: dispatch::dispatch_entry::<I>(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn callables(&self) -> &CallableRegistry<I> {
        &self.callables
    }

    pub fn pointers(&self) -> &PointerRegistry {
        &self.pointers
    }

    /// Queued one-shot tasks plus unfinished persistent callbacks.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// One-shot tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.queued()
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.active()
    }

    pub fn timer_name(&self) -> &str {
        &self.timer_name
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// OS randomness for the timer name; the nanosecond suffix still separates
/// bridges if the OS source is unavailable.
fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_err() {
        return 0;
    }
    u32::from_ne_bytes(buf)
}
