//! The seam between the bridge and the interpreter wrapper layer.
//!
//! The bridge never talks to the interpreter's C API itself. It only needs the
//! handful of operations below; the wrapper layer (or a test double)
//! implements them. Every method is called on the interpreter thread.

use std::ffi::c_void;

use tether_ffi::TimerHook;

use super::error::Result;

pub trait Interpreter: 'static {
    /// Drop every value on the interpreter stack (`settop(0)`).
    fn clear_stack(&mut self);

    /// Report a non-fatal error inside the interpreter without unwinding it.
    fn warn(&mut self, message: &str);

    /// Register a native timer that fires `hook` every `delay` seconds,
    /// `repetitions` times (`0` = forever). `delay` 0 means every frame.
    fn create_timer(&mut self, name: &str, delay: f64, repetitions: u32, hook: TimerHook)
        -> Result<()>;

    /// Remove a timer registered with [`Interpreter::create_timer`].
    fn remove_timer(&mut self, name: &str);

    /// View the raw state pointer foreign code hands back as `Self`.
    ///
    /// The default treats `state` as `*mut Self`, which is correct for the
    /// usual `#[repr(transparent)]` wrapper around the opaque C state type and
    /// for test doubles passed by address.
    ///
    /// # Safety
    ///
    /// `state` must point to a live `Self` that is not otherwise borrowed for
    /// the returned lifetime.
    unsafe fn from_raw<'a>(state: *mut c_void) -> &'a mut Self
    where
        Self: Sized,
    {
        &mut *(state as *mut Self)
    }

    /// The raw pointer form of `self`, inverse of [`Interpreter::from_raw`].
    fn as_raw(&mut self) -> *mut c_void
    where
        Self: Sized,
    {
        self as *mut Self as *mut c_void
    }
}

/// Recording interpreter used by the unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Default)]
    pub struct RecordingInterpreter {
        pub stack: Vec<i64>,
        pub warnings: Vec<String>,
        pub timers: Vec<(String, TimerHook)>,
        pub clears: usize,
    }

    impl RecordingInterpreter {
        /// Fire every registered timer once, like one host frame.
        pub fn frame(&mut self) {
            let hooks: Vec<TimerHook> = self.timers.iter().map(|(_, h)| *h).collect();
            let state = self.as_raw();
            for hook in hooks {
                unsafe { hook.fire(state) };
            }
        }
    }

    impl Interpreter for RecordingInterpreter {
        fn clear_stack(&mut self) {
            self.stack.clear();
            self.clears += 1;
        }

        fn warn(&mut self, message: &str) {
            self.warnings.push(message.to_string());
        }

        fn create_timer(
            &mut self,
            name: &str,
            _delay: f64,
            _repetitions: u32,
            hook: TimerHook,
        ) -> Result<()> {
            self.timers.push((name.to_string(), hook));
            Ok(())
        }

        fn remove_timer(&mut self, name: &str) {
            self.timers.retain(|(n, _)| n != name);
        }
    }
}
