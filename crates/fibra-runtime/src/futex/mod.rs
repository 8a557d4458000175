//! Futex wrappers: wait, wake and vectored wait on 32-bit words
//!
//! Linux gets the real syscalls (including `futex_waitv` for blocking on
//! several words at once). Other Unixes use a registration-table fallback
//! built on thread parking. Both expose the same interface, so everything
//! above this module is platform-independent.

use std::sync::atomic::AtomicU32;
use std::time::Instant;

/// One word of a vectored wait: sleep while `*word == expected`
pub struct WaitSource<'a> {
    pub word: &'a AtomicU32,
    pub expected: u32,
}

/// Outcome of a blocking wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken (or the word already differed); index of the ready source
    Ready(usize),
    /// The deadline passed first
    TimedOut,
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::{wait, wake, wait_multiple};
    } else {
        mod fallback;
        pub use fallback::{wait, wake, wait_multiple};
    }
}
