//! Portable futex emulation for non-Linux Unixes
//!
//! A process-wide table maps word addresses to parked threads. `wake`
//! unparks registered waiters; `wait` registers, re-checks the word, then
//! parks. The registration-before-recheck order closes the lost-wake
//! window.

use super::{WaitOutcome, WaitSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, Thread};
use std::time::Instant;

struct Waiter {
    thread: Thread,
    woken: Arc<AtomicBool>,
}

fn table() -> &'static Mutex<HashMap<usize, Vec<Waiter>>> {
    static TABLE: OnceLock<Mutex<HashMap<usize, Vec<Waiter>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn register(addr: usize) -> Arc<AtomicBool> {
    let woken = Arc::new(AtomicBool::new(false));
    let mut map = table().lock().unwrap();
    map.entry(addr).or_default().push(Waiter {
        thread: thread::current(),
        woken: Arc::clone(&woken),
    });
    woken
}

fn deregister(addr: usize, woken: &Arc<AtomicBool>) {
    let mut map = table().lock().unwrap();
    if let Some(list) = map.get_mut(&addr) {
        list.retain(|w| !Arc::ptr_eq(&w.woken, woken));
        if list.is_empty() {
            map.remove(&addr);
        }
    }
}

/// Block while `*word == expected`; `false` only on timeout
pub fn wait(word: &AtomicU32, expected: u32, deadline: Option<Instant>) -> bool {
    let addr = word.as_ptr() as usize;
    let woken = register(addr);
    if word.load(Ordering::Acquire) != expected {
        deregister(addr, &woken);
        return true;
    }
    loop {
        if woken.load(Ordering::Acquire) {
            return true;
        }
        match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    deregister(addr, &woken);
                    return woken.load(Ordering::Acquire);
                }
                thread::park_timeout(d - now);
            }
            None => thread::park(),
        }
        if woken.load(Ordering::Acquire) {
            return true;
        }
        if word.load(Ordering::Acquire) != expected {
            deregister(addr, &woken);
            return true;
        }
    }
}

/// Wake up to `n` waiters registered on `word`
pub fn wake(word: &AtomicU32, n: i32) -> usize {
    let addr = word.as_ptr() as usize;
    let mut to_wake = Vec::new();
    {
        let mut map = table().lock().unwrap();
        if let Some(list) = map.get_mut(&addr) {
            let take = (n.max(0) as usize).min(list.len());
            to_wake.extend(list.drain(..take));
            if list.is_empty() {
                map.remove(&addr);
            }
        }
    }
    let count = to_wake.len();
    for w in to_wake {
        w.woken.store(true, Ordering::Release);
        w.thread.unpark();
    }
    count
}

/// Block until any source's word differs from its expected value
pub fn wait_multiple(sources: &[WaitSource<'_>], deadline: Option<Instant>) -> WaitOutcome {
    debug_assert!(!sources.is_empty());
    let regs: Vec<(usize, Arc<AtomicBool>)> = sources
        .iter()
        .map(|s| {
            let addr = s.word.as_ptr() as usize;
            (addr, register(addr))
        })
        .collect();

    let ready = |sources: &[WaitSource<'_>]| {
        sources
            .iter()
            .position(|s| s.word.load(Ordering::Acquire) != s.expected)
    };

    let outcome = loop {
        if let Some(idx) = ready(sources) {
            break WaitOutcome::Ready(idx);
        }
        if let Some(idx) = regs
            .iter()
            .position(|(_, woken)| woken.load(Ordering::Acquire))
        {
            break WaitOutcome::Ready(idx);
        }
        match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    break WaitOutcome::TimedOut;
                }
                thread::park_timeout(d - now);
            }
            None => thread::park(),
        }
    };
    for (addr, woken) in &regs {
        deregister(*addr, woken);
    }
    outcome
}
