//! Tether demo host: drives a simulated interpreter frame loop
//!
//! The host:
//! 1. Opens the bridge on the "interpreter thread" (this one)
//! 2. Starts background workers that submit one-shot tasks
//! 3. Registers a persistent countdown that finishes after a few frames
//! 4. Calls an exported native function the way the wrapper layer would
//! 5. Fires timers once per frame until nothing is pending, then closes
//!
//! `TETHER_DEBUG=1` turns on bridge debug output.

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use log::{Level, LevelFilter, Log, Metadata, Record};
use tether_ffi::TimerHook;
use tether_host::bridge::{Bridge, BridgeConfig, BridgeError, Interpreter, Think};

const WORKERS: usize = 4;
const TASKS_PER_WORKER: usize = 10;
const MAX_FRAMES: u64 = 10_000;

// =============================================================================
// Logging (TETHER_DEBUG=1 to enable debug output)
// =============================================================================

fn debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var("TETHER_DEBUG").map_or(false, |v| v == "1"))
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info || debug_enabled()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{:5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging() {
    let level = if debug_enabled() { LevelFilter::Trace } else { LevelFilter::Info };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

// =============================================================================
// Simulated interpreter
// =============================================================================

/// Stand-in for the embedded interpreter: a value stack and a timer table.
#[derive(Default)]
struct SimInterpreter {
    stack: Vec<i64>,
    timers: Vec<(String, TimerHook)>,
    frame: u64,
}

impl SimInterpreter {
    /// One host frame: fire every registered timer.
    fn run_frame(&mut self) {
        self.frame += 1;
        let hooks: Vec<TimerHook> = self.timers.iter().map(|(_, hook)| *hook).collect();
        let state = self.as_raw();
        for hook in hooks {
            // SAFETY: hooks were registered against this interpreter and we
            // are on its thread.
            unsafe { hook.fire(state) };
        }
    }
}

impl Interpreter for SimInterpreter {
    fn clear_stack(&mut self) {
        self.stack.clear();
    }

    fn warn(&mut self, message: &str) {
        eprintln!("[interp] warning: {}", message);
    }

    fn create_timer(
        &mut self,
        name: &str,
        _delay: f64,
        _repetitions: u32,
        hook: TimerHook,
    ) -> Result<(), BridgeError> {
        if self.timers.iter().any(|(n, _)| n == name) {
            return Err(BridgeError::Timer(format!("timer {} already exists", name)));
        }
        self.timers.push((name.to_string(), hook));
        Ok(())
    }

    fn remove_timer(&mut self, name: &str) {
        self.timers.retain(|(n, _)| n != name);
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() {
    init_logging();
    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let config = BridgeConfig::from_env();
    let mut interp = SimInterpreter::default();
    let bridge = Bridge::open(&mut interp, config)?;
    let started = Instant::now();

    // Native function the interpreter can call: pushes the sum of the stack.
    let sum = bridge.export(|i: &mut SimInterpreter| {
        let total: i64 = i.stack.iter().sum();
        i.stack.push(total);
        1
    });
    interp.stack.extend([1, 2, 3]);
    // SAFETY: the bridge is alive and this is the interpreter thread.
    let result = unsafe { sum.call(interp.as_raw()) };
    if result.is_err() {
        return Err("exported function failed".into());
    }
    log::info!("exported sum returned {} value(s): {:?}", result.count, interp.stack.last());

    let config_handle = bridge.pointers().wrap(String::from("demo"));

    let executed = Arc::new(AtomicUsize::new(0));
    for worker in 0..WORKERS {
        let b = bridge.clone();
        let executed = executed.clone();
        bridge.spawn(move || {
            for task in 0..TASKS_PER_WORKER {
                let executed = executed.clone();
                let b2 = b.clone();
                let submitted = b.submit(move |i: &mut SimInterpreter| {
                    let name = b2
                        .pointers()
                        .unwrap::<String>(config_handle)
                        .map(|s| s.to_string())
                        .unwrap_or_default();
                    i.stack.push((worker * TASKS_PER_WORKER + task) as i64);
                    executed.fetch_add(1, Ordering::SeqCst);
                    log::debug!("[{}] worker {} task {} on frame {}", name, worker, task, i.frame);
                });
                if let Err(e) = submitted {
                    log::warn!("worker {} stopped: {}", worker, e);
                    return;
                }
                std::thread::sleep(Duration::from_micros(200));
            }
        })?;
    }

    let mut remaining = 5;
    bridge.submit_persistent(move |i: &mut SimInterpreter| {
        remaining -= 1;
        log::debug!("countdown {} on frame {}", remaining, i.frame);
        if remaining == 0 { Think::Done } else { Think::Continue }
    })?;

    while bridge.active_tasks() > 0 || bridge.pending() > 0 {
        if interp.frame >= MAX_FRAMES {
            return Err(format!("work still pending after {} frames", MAX_FRAMES).into());
        }
        interp.run_frame();
        std::thread::sleep(Duration::from_millis(1));
    }

    let frames = interp.frame;
    bridge.close(&mut interp)?;
    log::info!(
        "ran {} task(s) in {} frame(s), {:?}",
        executed.load(Ordering::SeqCst),
        frames,
        started.elapsed()
    );
    Ok(())
}
