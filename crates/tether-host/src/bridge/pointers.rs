//! Opaque Pointer Registry: lets foreign code carry a managed value by handle.
//!
//! Values are type-erased on the way in and type-checked on the way out, the
//! same way a typed resource registry checks type ids on retrieval.
//!
//! # Scratch slot
//!
//! [`PointerRegistry::with_scratch`] parks a value under the fixed
//! [`Handle::SCRATCH`] for the duration of one synchronous call. It skips the
//! counter and map churn for fire-and-forget hand-offs, but it is only valid
//! while the closure runs: foreign code must not keep the handle past the
//! call, and only one hand-off may be in flight at a time (a second one fails
//! with [`BridgeError::ScratchBusy`] instead of overwriting the first).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tether_ffi::Handle;

use super::error::{BridgeError, Result};
use super::registry::next_handle;
use super::sync::{lock, AtomicU64, Mutex};

type Value = Arc<dyn Any + Send + Sync>;

pub struct PointerRegistry {
    values: Mutex<HashMap<Handle, Value>>,
    scratch: Mutex<Option<Value>>,
    next_handle: AtomicU64,
}

impl PointerRegistry {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            scratch: Mutex::new(None),
            next_handle: AtomicU64::new(1),
        }
    }

    fn allocate(&self) -> Handle {
        next_handle(&self.next_handle)
    }

    pub fn wrap<T: Any + Send + Sync>(&self, value: T) -> Handle {
        self.wrap_arc(Arc::new(value))
    }

    /// Register a value that is already shared.
    pub fn wrap_arc<T: Any + Send + Sync>(&self, value: Arc<T>) -> Handle {
        let handle = self.allocate();
        lock(&self.values).insert(handle, value);
        handle
    }

    /// Look a value up without removing it.
    pub fn unwrap<T: Any + Send + Sync>(&self, handle: Handle) -> Result<Arc<T>> {
        let value = if handle == Handle::SCRATCH {
            lock(&self.scratch).clone()
        } else {
            lock(&self.values).get(&handle).cloned()
        };
        let value = value.ok_or(BridgeError::HandleNotFound(handle.get()))?;
        value
            .downcast::<T>()
            .map_err(|_| BridgeError::TypeMismatch(handle.get()))
    }

    /// Remove a value and return it. On type mismatch the entry stays.
    pub fn take<T: Any + Send + Sync>(&self, handle: Handle) -> Result<Arc<T>> {
        let mut values = lock(&self.values);
        match values.get(&handle) {
            None => Err(BridgeError::HandleNotFound(handle.get())),
            Some(v) if !(**v).is::<T>() => Err(BridgeError::TypeMismatch(handle.get())),
            Some(_) => {
                let value = values
                    .remove(&handle)
                    .ok_or(BridgeError::HandleNotFound(handle.get()))?;
                drop(values);
                value
                    .downcast::<T>()
                    .map_err(|_| BridgeError::TypeMismatch(handle.get()))
            }
        }
    }

    /// Idempotent; returns whether anything was removed.
    pub fn release(&self, handle: Handle) -> bool {
        let removed = lock(&self.values).remove(&handle);
        removed.is_some()
    }

    /// Run `f` with `value` parked under [`Handle::SCRATCH`]. Synchronous use only.
    pub fn with_scratch<T, R>(&self, value: T, f: impl FnOnce(Handle) -> R) -> Result<R>
    where
        T: Any + Send + Sync,
    {
        {
            let mut slot = lock(&self.scratch);
            if slot.is_some() {
                return Err(BridgeError::ScratchBusy);
            }
            *slot = Some(Arc::new(value));
        }

        struct ClearOnDrop<'a>(&'a Mutex<Option<Value>>);
        impl Drop for ClearOnDrop<'_> {
            fn drop(&mut self) {
                let old = lock(self.0).take();
                drop(old);
            }
        }

        let _clear = ClearOnDrop(&self.scratch);
        Ok(f(Handle::SCRATCH))
    }

    pub fn len(&self) -> usize {
        lock(&self.values).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        let drained: Vec<Value> = lock(&self.values).drain().map(|(_, v)| v).collect();
        drained.len()
    }
}

impl Default for PointerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
