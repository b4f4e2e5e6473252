//! Engine error type

/// Error type for engine operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Out of memory")]
    OutOfMemory,

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Hook id {0:#x} already exists")]
    AlreadyExists(u32),

    #[error("Hook not found")]
    NotFound,

    #[error("Platform not supported")]
    NotImplemented,

    #[error("Malformed custom handler data")]
    InvalidTransportData,

    #[error("Thread suspension failed: {0}")]
    SuspendFailed(&'static str),

    #[error("Memory protection failed: {0}")]
    ProtectFailed(String),

    #[error("Failed to disassemble target at {0:#x}")]
    DisassembleFailed(usize),

    #[error("Thread is exiting")]
    Cancelled,
}

pub type EngineResult<T> = Result<T, EngineError>;
