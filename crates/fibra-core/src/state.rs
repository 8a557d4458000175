//! Command-buffer state words and status enums
//!
//! The shared completion word doubles as a futex: OS threads blocked in
//! `wait_on` sleep on it directly, while tasks go through their pool's
//! wait map using the word's address as the key.

/// Buffer still being processed
pub const BUFFER_RUNNING: u32 = 0;
/// Every entry reached `Processed` without an abort
pub const BUFFER_COMPLETED: u32 = 1;
/// At least one entry aborted and the policy forwarded it
pub const BUFFER_ABORTED: u32 = 2;
/// Mask extracting the lifecycle bits from the state word
pub const BUFFER_STATE_MASK: u32 = 0b11;
/// Set by a sleeper before blocking so completion knows to wake the futex
pub const BUFFER_HAS_WAITERS: u32 = 0b100;

/// Final status of a command buffer, surfaced through `wait_on`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Completed,
    Aborted,
}

impl BufferStatus {
    /// Decode a state word; `None` while the buffer is still running
    #[inline]
    pub fn from_state_word(word: u32) -> Option<BufferStatus> {
        match word & BUFFER_STATE_MASK {
            BUFFER_COMPLETED => Some(BufferStatus::Completed),
            BUFFER_ABORTED => Some(BufferStatus::Aborted),
            _ => None,
        }
    }

    /// Encode as lifecycle bits
    #[inline]
    pub fn to_state_bits(self) -> u32 {
        match self {
            BufferStatus::Completed => BUFFER_COMPLETED,
            BufferStatus::Aborted => BUFFER_ABORTED,
        }
    }
}

/// Processing state of a single command-buffer entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Cursor has not reached the entry yet
    NotProcessed,
    /// Entry spawned tasks that are still live
    RunningTask,
    /// Entry spawned a nested buffer that is still live
    RunningBuffer,
    /// Entry fully done (or aborted in place)
    Processed,
}

/// Where a buffer currently sits relative to the pool's process list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    /// Not on the process list and nothing pending will re-add it
    Dequeued,
    /// Removed from the list, waiting on an external event (stack, task,
    /// sub-buffer); the event's handler re-enqueues it
    Blocked,
    /// On the process list, will be driven next tick
    WillProcess,
}
