//! Error types for the fibra task runtime

use core::fmt;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by pool operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Malformed pool configuration; returned synchronously from spawn
    InvalidConfig(&'static str),

    /// A command-buffer entry failed validation
    InvalidEntry(EntryError),

    /// Stack allocation failed irrecoverably
    OutOfMemory,

    /// The pool no longer accepts enqueue requests
    PoolClosed,

    /// Operation requires a task context but the caller is an OS thread
    NotInTask,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidConfig(msg) => write!(f, "invalid pool config: {}", msg),
            PoolError::InvalidEntry(e) => write!(f, "invalid command entry: {}", e),
            PoolError::OutOfMemory => write!(f, "out of stack memory"),
            PoolError::PoolClosed => write!(f, "pool closed"),
            PoolError::NotInTask => write!(f, "not running inside a task"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Reasons a command-buffer entry is rejected by the processor
///
/// The offending entry is aborted in place and the failure forwarded
/// through the buffer's abort policy; it is never returned to the
/// enqueuer directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryError {
    /// No stack class is large enough for the requested minimum size
    StackSizeUnsupported,

    /// `select_worker` index is outside the pool's worker vector
    WorkerOutOfRange,

    /// A waited-on handle belongs to a different pool
    ForeignHandle,

    /// `wait_command(offset)` points before the start of the buffer
    BadWaitOffset,

    /// A nested buffer could not be admitted
    NestedBufferFailed,
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryError::StackSizeUnsupported => write!(f, "no stack class fits requested size"),
            EntryError::WorkerOutOfRange => write!(f, "worker index out of range"),
            EntryError::ForeignHandle => write!(f, "handle owned by another pool"),
            EntryError::BadWaitOffset => write!(f, "wait offset out of bounds"),
            EntryError::NestedBufferFailed => write!(f, "nested command buffer rejected"),
        }
    }
}

impl From<EntryError> for PoolError {
    fn from(e: EntryError) -> Self {
        PoolError::InvalidEntry(e)
    }
}
