//! tether-host: lets background threads hand work to a single-threaded
//! embedded interpreter, and lets the interpreter call native callables by
//! handle without ever unwinding into foreign frames.
//!
//! Everything lives in [`bridge`]; the binary in this crate is a demo host.

pub mod bridge;

pub use bridge::{Bridge, BridgeConfig, BridgeError, DrainPolicy, Interpreter, Think};
pub use tether_ffi::Handle;
