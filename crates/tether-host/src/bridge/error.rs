use thiserror::Error;

/// Everything that can go wrong inside the bridge.
///
/// None of these are fatal to the host. At the foreign boundary they are
/// turned into an error string; while draining they become interpreter
/// warnings.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Lookup against an unknown or already released handle.
    #[error("no callable or value registered for handle {0}")]
    HandleNotFound(u64),

    /// The callable panicked; carries the panic message.
    #[error("{0}")]
    CallableFault(String),

    /// The interpreter is not open (or was closed while waiting for queue space).
    #[error("interpreter is closed")]
    QueueClosed,

    /// The pointer registry holds a value of a different type under this handle.
    #[error("value registered for handle {0} has a different type")]
    TypeMismatch(u64),

    /// The scratch slot is already in use by an enclosing hand-off.
    #[error("scratch slot is already in use")]
    ScratchBusy,

    /// An interpreter-only operation was attempted from another thread.
    #[error("interpreter accessed from a thread other than the one that opened it")]
    ForeignThread,

    /// The interpreter refused to register the tick timer.
    #[error("failed to register tick timer: {0}")]
    Timer(String),

    /// The OS refused to start a background thread.
    #[error("failed to spawn background task: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
