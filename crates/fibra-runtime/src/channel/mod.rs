//! Scheduler channels
//!
//! - [`MsgChannel`]: MPSC carrier for pool messages and enqueue requests
//! - [`TaskQueue`]: intrusive per-worker MPSC queue of tasks
//! - [`SumTreeChannel`]: the shared MPMC channel for "any worker" tasks
//! - [`SignalChannel`]: a bare doorbell used to nudge the pool loop
//!
//! Every channel exposes a 32-bit event word, so a consumer can block on
//! several channels at once through `futex::wait_multiple`: snapshot each
//! word with `prepare_wait`, re-poll the channels, then sleep expecting
//! the snapshots.

mod global;
mod mpsc;
mod queue;
mod signal;

pub use global::{PopError, PushError, SumTreeChannel};
pub use mpsc::MsgChannel;
pub(crate) use queue::TaskQueue;
pub use signal::SignalChannel;

use crate::futex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Event word shared by the simple channels
///
/// Bit 0: closed (sticky). Bit 1: a consumer intends to sleep. The
/// remaining bits are a wrapping sequence bumped on every publish, so a
/// sleeper comparing against a stale snapshot never misses an event.
pub(crate) struct EventWord {
    word: AtomicU32,
}

const CLOSED_BIT: u32 = 0b01;
const WAITER_BIT: u32 = 0b10;
const SEQ_STEP: u32 = 0b100;

impl EventWord {
    pub const fn new() -> Self {
        EventWord {
            word: AtomicU32::new(0),
        }
    }

    /// Publish an event and wake a sleeping consumer if one advertised
    pub fn bump(&self) {
        let old = self.word.fetch_add(SEQ_STEP, Ordering::Release);
        if old & WAITER_BIT != 0 {
            futex::wake(&self.word, 1);
        }
    }

    /// Advertise intent to sleep; returns the snapshot to expect
    pub fn prepare_wait(&self) -> u32 {
        self.word.fetch_or(WAITER_BIT, Ordering::AcqRel) | WAITER_BIT
    }

    /// Withdraw the sleep advertisement (consumer found work)
    pub fn cancel_wait(&self) {
        self.word.fetch_and(!WAITER_BIT, Ordering::Release);
    }

    pub fn close(&self) {
        self.word.fetch_or(CLOSED_BIT, Ordering::Release);
        futex::wake(&self.word, i32::MAX);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.word.load(Ordering::Acquire) & CLOSED_BIT != 0
    }

    #[inline]
    pub fn word(&self) -> &AtomicU32 {
        &self.word
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::futex::{WaitOutcome, WaitSource};
    use std::time::{Duration, Instant};

    #[test]
    fn test_bump_changes_snapshot() {
        let ev = EventWord::new();
        let snap = ev.prepare_wait();
        ev.bump();
        assert_ne!(ev.word().load(Ordering::Acquire), snap);
    }

    #[test]
    fn test_close_is_sticky_and_visible() {
        let ev = EventWord::new();
        let snap = ev.prepare_wait();
        ev.close();
        assert!(ev.is_closed());
        // A sleeper with the old snapshot must not block
        let src = [WaitSource {
            word: ev.word(),
            expected: snap,
        }];
        let outcome = futex::wait_multiple(&src, Some(Instant::now() + Duration::from_secs(1)));
        assert_eq!(outcome, WaitOutcome::Ready(0));
    }

    #[test]
    fn test_seq_wrap_preserves_flag_bits() {
        let ev = EventWord::new();
        ev.close();
        // Drive the sequence all the way around; closed must survive
        for _ in 0..1024 {
            ev.word.fetch_add(SEQ_STEP.wrapping_mul(1 << 22), Ordering::Relaxed);
        }
        assert!(ev.is_closed());
    }
}
