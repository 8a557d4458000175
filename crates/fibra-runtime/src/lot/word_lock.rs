//! Word lock guarding parking-lot buckets
//!
//! A single word encodes the held bit, a queue-locked bit and the head of
//! an intrusive list of sleeping waiters (waiter nodes live on their
//! thread's stack, so the pointer bits are always valid while queued).
//! Chosen over a plain mutex because the bucket address must stay stable
//! across table growth and the waiters must not recurse into the very
//! parking lot being implemented.

use crate::futex;
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

const LOCKED_BIT: usize = 0b01;
const QUEUE_LOCKED_BIT: usize = 0b10;
const QUEUE_MASK: usize = !0b11;

const SPIN_LIMIT: u32 = 40;

/// Stack-allocated wait node; lives until the owner leaves `lock_slow`
#[repr(align(4))]
struct Waiter {
    signal: AtomicU32,
    next: Cell<*const Waiter>,
}

pub(crate) struct WordLock {
    state: AtomicUsize,
}

impl WordLock {
    pub const fn new() -> Self {
        WordLock {
            state: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange_weak(0, LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        let state = self.state.load(Ordering::Relaxed);
        state & LOCKED_BIT == 0
            && self
                .state
                .compare_exchange(
                    state,
                    state | LOCKED_BIT,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    #[cold]
    fn lock_slow(&self) {
        let mut spins = 0u32;
        loop {
            let state = self.state.load(Ordering::Relaxed);

            if state & LOCKED_BIT == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        state,
                        state | LOCKED_BIT,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            // Briefly spin while the queue is empty; bucket sections are short
            if state & QUEUE_MASK == 0 && spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }

            // Enqueue ourselves at the head and sleep
            let waiter = Waiter {
                signal: AtomicU32::new(0),
                next: Cell::new((state & QUEUE_MASK) as *const Waiter),
            };
            if self
                .state
                .compare_exchange_weak(
                    state,
                    (&waiter as *const Waiter as usize) | (state & !QUEUE_MASK),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }
            while waiter.signal.load(Ordering::Acquire) == 0 {
                futex::wait(&waiter.signal, 0, None);
            }
            spins = 0;
        }
    }

    #[inline]
    pub fn unlock(&self) {
        let state = self.state.fetch_sub(LOCKED_BIT, Ordering::Release);
        if state & QUEUE_MASK != 0 && state & QUEUE_LOCKED_BIT == 0 {
            self.unlock_slow();
        }
    }

    #[cold]
    fn unlock_slow(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            // Nothing to do, someone else is already waking, or a new
            // holder will wake at its own unlock
            if state & QUEUE_MASK == 0
                || state & QUEUE_LOCKED_BIT != 0
                || state & LOCKED_BIT != 0
            {
                return;
            }
            if self
                .state
                .compare_exchange_weak(
                    state,
                    state | QUEUE_LOCKED_BIT,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }

        // Queue locked: wake the oldest waiter (the tail, since pushers
        // prepend). Pushers may still prepend, but inner nodes are ours.
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & LOCKED_BIT != 0 {
                // New holder appeared; hand responsibility to it
                if self
                    .state
                    .compare_exchange_weak(
                        state,
                        state & !QUEUE_LOCKED_BIT,
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            let head = (state & QUEUE_MASK) as *const Waiter;
            debug_assert!(!head.is_null());
            // Safety: queued nodes stay alive until signaled
            let (prev, tail) = unsafe {
                let mut prev: *const Waiter = std::ptr::null();
                let mut cur = head;
                while !(*cur).next.get().is_null() {
                    prev = cur;
                    cur = (*cur).next.get();
                }
                (prev, cur)
            };

            if prev.is_null() {
                // Single node: it must still be the head for the CAS to
                // succeed; a concurrent prepend retries the walk
                if self
                    .state
                    .compare_exchange_weak(state, 0, Ordering::Release, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
            } else {
                unsafe { (*prev).next.set(std::ptr::null()) };
                self.state.fetch_and(!QUEUE_LOCKED_BIT, Ordering::Release);
            }

            unsafe {
                (*tail).signal.store(1, Ordering::Release);
                futex::wake(&(*tail).signal, 1);
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_try_lock() {
        let lock = WordLock::new();
        lock.lock();
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_contended_counter() {
        struct Shared {
            lock: WordLock,
            value: std::cell::UnsafeCell<u64>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: WordLock::new(),
            value: std::cell::UnsafeCell::new(0),
        });
        let mut handles = vec![];
        for _ in 0..8 {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    shared.lock.lock();
                    unsafe { *shared.value.get() += 1 };
                    shared.lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        shared.lock.lock();
        assert_eq!(unsafe { *shared.value.get() }, 80_000);
        shared.lock.unlock();
    }
}
