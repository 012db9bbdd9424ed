//! Dispatch Wrapper: the only way into a registered callable.
//!
//! A panic unwinding into foreign frames is undefined behavior, so every call
//! is made under `catch_unwind` and the panic turns into
//! [`BridgeError::CallableFault`] before control returns. Callables may panic
//! freely (including from nested callable invocations); the boundary always
//! sees a result count or an error value.
//!
//! The `extern "C"` trampolines at the bottom are what the wrapper layer
//! actually calls. They add a second `catch_unwind` around the bridge
//! bookkeeping itself and turn errors into heap C strings.

use std::any::Any;
use std::ffi::{c_char, c_int, c_void, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tether_ffi::{FfiResult, Handle, RawDispatchFn};

use super::error::{BridgeError, Result};
use super::interp::Interpreter;
use super::registry::{Callable, CallableRegistry};
use super::Bridge;

/// Best-effort description of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callable panicked with a non-string payload".to_string()
    }
}

/// Call `callable`, converting a panic into `CallableFault`.
pub fn call_contained<I>(callable: &Callable<I>, interp: &mut I) -> Result<i32> {
    catch_unwind(AssertUnwindSafe(|| callable(interp)))
        .map_err(|payload| BridgeError::CallableFault(panic_message(&*payload)))
}

/// Look up `handle` and call it with `interp`.
///
/// The registry lock is released before the call, so the callable may store,
/// look up or release entries (including itself).
pub fn invoke<I: 'static>(
    registry: &CallableRegistry<I>,
    handle: Handle,
    interp: &mut I,
) -> Result<i32> {
    let callable = registry
        .get(handle)
        .ok_or(BridgeError::HandleNotFound(handle.get()))?;
    call_contained(&callable, interp)
}

// =============================================================================
// C boundary
// =============================================================================

/// Heap-allocate an error message for the wrapper layer.
/// Interior NULs are replaced so the message is never lost.
pub fn error_to_c(err: &BridgeError) -> *mut c_char {
    let message = err.to_string().replace('\0', "\u{FFFD}");
    match CString::new(message) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Release an error string returned in an [`FfiResult`].
///
/// # Safety
///
/// `err` must be null or a pointer obtained from an `FfiResult` produced by
/// this library, and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn tether_error_free(err: *mut c_char) {
    if !err.is_null() {
        drop(CString::from_raw(err));
    }
}

/// Take a temporary strong reference to the bridge behind `ctx`, so a
/// callable that closes the bridge and drops the last other reference can't
/// free it under us.
unsafe fn retain<I: Interpreter>(ctx: *const c_void) -> Arc<Bridge<I>> {
    let ptr = ctx as *const Bridge<I>;
    Arc::increment_strong_count(ptr);
    Arc::from_raw(ptr)
}

/// [`tether_ffi::RawDispatchFn`] for bridges over `I`.
///
/// # Safety
///
/// `ctx` must come from [`Bridge::export`] on a bridge that is still alive and
/// `state` must be that bridge's interpreter.
pub unsafe extern "C" fn dispatch_trampoline<I: Interpreter>(
    ctx: *const c_void,
    state: *mut c_void,
    handle: *mut c_void,
) -> FfiResult {
    // Nothing can be looked up without a bridge; the bridge itself may still
    // be open, so this is not reported as a closed queue.
    if ctx.is_null() || state.is_null() {
        return FfiResult::err(error_to_c(&BridgeError::HandleNotFound(0)));
    }

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let bridge = retain::<I>(ctx);
        let handle = Handle::from_ptr(handle).ok_or(BridgeError::HandleNotFound(0))?;
        let interp = I::from_raw(state);
        bridge.invoke(handle, interp)
    }));

    match outcome {
        Ok(Ok(count)) => FfiResult::ok(count),
        Ok(Err(err)) => FfiResult::err(error_to_c(&err)),
        Err(payload) => {
            let err = BridgeError::CallableFault(panic_message(&*payload));
            FfiResult::err(error_to_c(&err))
        }
    }
}

/// The dispatch entry point for bridges over `I`, as a plain function pointer.
pub fn dispatch_entry<I: Interpreter>() -> RawDispatchFn {
    dispatch_trampoline::<I>
}

/// [`tether_ffi::RawTickFn`] registered as the per-tick timer.
///
/// Returns immediately while nothing is pending, so an idle bridge costs one
/// atomic load per frame.
///
/// # Safety
///
/// `ctx` must be the pointer [`Bridge::open`] registered and `state` the
/// interpreter it was registered with.
pub unsafe extern "C" fn tick_trampoline<I: Interpreter>(
    ctx: *const c_void,
    state: *mut c_void,
) -> c_int {
    if ctx.is_null() || state.is_null() {
        return 0;
    }
    {
        let bridge = &*(ctx as *const Bridge<I>);
        if bridge.pending() == 0 {
            return 0;
        }
    }

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let bridge = retain::<I>(ctx);
        let interp = I::from_raw(state);
        bridge.on_tick(interp)
    }));

    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => log::debug!("[bridge] tick skipped: {}", err),
        Err(payload) => log::error!("[bridge] tick panicked: {}", panic_message(&*payload)),
    }
    0
}
