//! Sleep event behind a parked waiter
//!
//! One event per park operation, living on the parker's stack. An OS
//! thread sleeps on the word with a futex; a task suspends through its
//! pool's wait map instead, so the hosting worker stays free to run other
//! tasks. The waker does not care which: `set` stores the word and routes
//! the wake accordingly — a task wake is a message to the owning pool,
//! never a re-entrant call into the lot.

use crate::pool::PoolShared;
use crate::task;
use crate::tls;
use crate::{futex, worker::Worker};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

enum SleepKind {
    /// Plain OS thread: futex on the word
    Thread,
    /// Scheduled task: suspend via the owning pool
    Task { pool: Arc<PoolShared> },
}

pub(crate) struct WaitEvent {
    word: AtomicU32,
    kind: SleepKind,
}

impl WaitEvent {
    /// Build the right variant for the calling context
    pub fn for_current() -> WaitEvent {
        let kind = if tls::in_task() {
            let worker = tls::current_worker();
            debug_assert!(!worker.is_null());
            // Safety: a task always runs on a registered worker
            let shared = unsafe { Worker::shared_of(worker) };
            SleepKind::Task { pool: shared }
        } else {
            SleepKind::Thread
        };
        WaitEvent {
            word: AtomicU32::new(0),
            kind,
        }
    }

    /// Block until `set` fires or the deadline passes
    ///
    /// Spurious returns are fine; callers re-check their own state.
    pub fn wait(&self, deadline: Option<Instant>) -> bool {
        match &self.kind {
            SleepKind::Thread => {
                while self.word.load(Ordering::Acquire) == 0 {
                    if !futex::wait(&self.word, 0, deadline) {
                        return self.word.load(Ordering::Acquire) != 0;
                    }
                }
                true
            }
            SleepKind::Task { .. } => {
                while self.word.load(Ordering::Acquire) == 0 {
                    if !task::wait_on_address(&self.word, 0, deadline) {
                        return self.word.load(Ordering::Acquire) != 0;
                    }
                }
                true
            }
        }
    }

    /// Fire the event; called by the waking thread after it released the
    /// bucket lock
    pub fn set(&self) {
        self.word.store(1, Ordering::Release);
        match &self.kind {
            SleepKind::Thread => {
                futex::wake(&self.word, 1);
            }
            SleepKind::Task { pool } => {
                pool.post_wake(self.word.as_ptr() as usize, 1);
            }
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.word.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_thread_event_set_before_wait() {
        let ev = WaitEvent::for_current();
        ev.set();
        assert!(ev.wait(None));
    }

    #[test]
    fn test_thread_event_timeout() {
        let ev = WaitEvent::for_current();
        let woken = ev.wait(Some(Instant::now() + Duration::from_millis(20)));
        assert!(!woken);
        assert!(!ev.is_set());
    }

    #[test]
    fn test_thread_event_cross_thread() {
        let ev = StdArc::new(WaitEvent::for_current());
        let ev2 = StdArc::clone(&ev);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            ev2.set();
        });
        assert!(ev.wait(None));
        h.join().unwrap();
    }
}
