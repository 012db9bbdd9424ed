//! FFI-safe types shared between the bridge and the interpreter wrapper layer.
//!
//! The wrapper layer is the thin C side that owns the embedded interpreter:
//! it pushes closures, reads upvalues and raises interpreter errors. Everything
//! it exchanges with the bridge goes through the types in this crate, so the
//! crate has NO dependencies and only uses `#[repr(C)]` layouts.
//!
//! # Handles
//!
//! Foreign code never sees a managed reference. It holds a [`Handle`], a plain
//! integer carried as a light-userdata pointer, and hands it back on every
//! call. The bridge resolves it against its registries.

use std::ffi::{c_char, c_int, c_void};
use std::fmt;
use std::num::NonZeroU64;

// =============================================================================
// Handle
// =============================================================================

/// Opaque token referencing a registry entry.
///
/// Handles come from a monotonically increasing counter and are never reused,
/// so a stale handle held by foreign code can only ever miss, never alias a
/// newer entry. Every handle fits in a pointer, so the light-userdata
/// encoding is lossless on 32-bit targets too.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Reserved slot of the pointer registry used for synchronous hand-offs.
    pub const SCRATCH: Handle = match NonZeroU64::new(usize::MAX as u64) {
        Some(v) => Handle(v),
        None => unreachable!(),
    };

    /// `None` for zero and for values wider than a pointer.
    pub fn new(raw: u64) -> Option<Handle> {
        usize::try_from(raw).ok()?;
        NonZeroU64::new(raw).map(Handle)
    }

    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Encode as a light-userdata pointer. The pointer is never dereferenced.
    pub fn as_ptr(self) -> *mut c_void {
        self.0.get() as usize as *mut c_void
    }

    /// Decode a light-userdata pointer produced by [`Handle::as_ptr`].
    pub fn from_ptr(ptr: *const c_void) -> Option<Handle> {
        Handle::new(ptr as usize as u64)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Handle::SCRATCH {
            f.write_str("Handle(scratch)")
        } else {
            write!(f, "Handle({})", self.0)
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Result across the boundary
// =============================================================================

/// Result-count-or-error pair returned to the wrapper layer.
///
/// When `err` is non-null the wrapper raises it as an interpreter error and
/// then releases it with `tether_error_free`. `count` is only meaningful when
/// `err` is null.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FfiResult {
    pub count: c_int,
    pub err: *mut c_char,
}

impl FfiResult {
    pub const fn ok(count: c_int) -> Self {
        Self {
            count,
            err: std::ptr::null_mut(),
        }
    }

    pub const fn err(err: *mut c_char) -> Self {
        Self { count: 0, err }
    }

    pub fn is_err(&self) -> bool {
        !self.err.is_null()
    }
}

// =============================================================================
// Entry points handed to the wrapper layer
// =============================================================================

/// Call a registered callable. `ctx` is the bridge, `state` the interpreter,
/// `handle` the upvalue the closure was pushed with.
pub type RawDispatchFn =
    unsafe extern "C" fn(ctx: *const c_void, state: *mut c_void, handle: *mut c_void) -> FfiResult;

/// Per-tick timer callback. Returns the number of values left on the stack
/// (always 0).
pub type RawTickFn = unsafe extern "C" fn(ctx: *const c_void, state: *mut c_void) -> c_int;

/// Native timer callback plus the context it must be invoked with.
///
/// The wrapper pushes `tick` as a C closure with `ctx` as its upvalue and
/// registers it with the host's timer facility.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TimerHook {
    pub ctx: *const c_void,
    pub tick: RawTickFn,
}

impl TimerHook {
    /// Fire one tick.
    ///
    /// # Safety
    ///
    /// `state` must be the interpreter the hook was registered with, and the
    /// call must happen on that interpreter's thread while the timer is still
    /// registered.
    pub unsafe fn fire(&self, state: *mut c_void) -> c_int {
        (self.tick)(self.ctx, state)
    }
}

/// A callable exported to the interpreter: the wrapper pushes `call` as a C
/// closure carrying `ctx` and `handle` as upvalues.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExportedFn {
    pub ctx: *const c_void,
    pub handle: *mut c_void,
    pub call: RawDispatchFn,
}

impl ExportedFn {
    /// # Safety
    ///
    /// Same contract as [`TimerHook::fire`]: interpreter thread only, while the
    /// owning bridge is alive.
    pub unsafe fn call(&self, state: *mut c_void) -> FfiResult {
        (self.call)(self.ctx, state, self.handle)
    }
}
