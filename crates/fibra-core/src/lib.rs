//! # fibra-core
//!
//! Core types for the fibra task runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific implementations live in `fibra-runtime`.
//!
//! ## Modules
//!
//! - `id` - Pool, worker and task identifier types
//! - `state` - Command-buffer state words and status enums
//! - `error` - Error types
//! - `locals` - Fixed-capacity task-local value table
//! - `spinlock` - Internal spinlock primitive
//! - `flog` - Context-aware debug print macros
//! - `env` - Environment variable utilities

#![allow(dead_code)]

pub mod env;
pub mod error;
pub mod flog;
pub mod id;
pub mod locals;
pub mod spinlock;
pub mod state;

// Re-exports for convenience
pub use env::{env_get, env_get_bool, env_get_opt, env_is_set};
pub use error::{EntryError, PoolError, PoolResult};
pub use id::{PoolId, TaskId, WorkerId};
pub use locals::TaskLocalMap;
pub use spinlock::SpinLock;
pub use state::{BufferStatus, EnqueueStatus, EntryStatus};

/// Shared constants
pub mod constants {
    /// Smallest stack a task may run on (one page of headroom past the
    /// largest frame the entry trampoline needs)
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Default task stack size when the pool config gives none
    pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

    /// Maximum workers per pool
    pub const MAX_WORKERS: usize = 64;

    /// Capacity of the task-local value table (entries per task)
    pub const TASK_LOCAL_SLOTS: usize = 128;

    /// Global channel capacity multiplier per worker
    pub const CHANNEL_LOAD_FACTOR: usize = 4;

    /// Maximum number of keys accepted by a single `park_multiple` call
    pub const MAX_PARK_MULTIPLE_KEYS: usize = 16;

    /// Cache line size for alignment
    pub const CACHE_LINE_SIZE: usize = 64;
}
