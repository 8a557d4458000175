//! Linux futex implementation
//!
//! `wait`/`wake` use the classic FUTEX_WAIT/FUTEX_WAKE pair. The vectored
//! wait uses `futex_waitv` (kernel 5.16+); on older kernels it degrades to
//! a polling loop over the words, detected once via ENOSYS.

use super::{WaitOutcome, WaitSource};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

// futex_waitv is syscall 449 on every architecture (post-unification)
const SYS_FUTEX_WAITV: libc::c_long = 449;
const FUTEX2_SIZE_U32: u32 = 0x02;
const FUTEX2_PRIVATE: u32 = 0x80;

/// Kernel entry descriptor for futex_waitv
#[repr(C)]
struct FutexWaitv {
    val: u64,
    uaddr: u64,
    flags: u32,
    __reserved: u32,
}

/// Block while `*word == expected`
///
/// Returns `false` only when the deadline passed; any wake, value change
/// or signal returns `true` and the caller re-checks its predicate.
pub fn wait(word: &AtomicU32, expected: u32, deadline: Option<Instant>) -> bool {
    let timespec = match deadline {
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return word.load(Ordering::Acquire) != expected;
            }
            let rel = d - now;
            Some(libc::timespec {
                tv_sec: rel.as_secs() as libc::time_t,
                tv_nsec: rel.subsec_nanos() as libc::c_long,
            })
        }
        None => None,
    };
    let ts_ptr = timespec
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == 0 {
        return true;
    }
    match unsafe { *libc::__errno_location() } {
        libc::ETIMEDOUT => false,
        // EAGAIN: value changed before we slept; EINTR: signal
        _ => true,
    }
}

/// Wake up to `n` waiters sleeping on `word`
pub fn wake(word: &AtomicU32, n: i32) -> usize {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            n,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if rc < 0 {
        0
    } else {
        rc as usize
    }
}

static WAITV_SUPPORTED: AtomicBool = AtomicBool::new(true);

/// Block until any source's word differs from its expected value
pub fn wait_multiple(sources: &[WaitSource<'_>], deadline: Option<Instant>) -> WaitOutcome {
    debug_assert!(!sources.is_empty());

    // A source that is already ready wins without a syscall
    if let Some(idx) = scan_ready(sources) {
        return WaitOutcome::Ready(idx);
    }
    if sources.len() == 1 {
        let s = &sources[0];
        return if wait(s.word, s.expected, deadline) {
            WaitOutcome::Ready(0)
        } else {
            WaitOutcome::TimedOut
        };
    }

    if WAITV_SUPPORTED.load(Ordering::Relaxed) {
        match waitv(sources, deadline) {
            Some(outcome) => return outcome,
            None => WAITV_SUPPORTED.store(false, Ordering::Relaxed),
        }
    }
    poll_wait(sources, deadline)
}

fn scan_ready(sources: &[WaitSource<'_>]) -> Option<usize> {
    sources
        .iter()
        .position(|s| s.word.load(Ordering::Acquire) != s.expected)
}

/// Real futex_waitv; `None` means the kernel does not support it
fn waitv(sources: &[WaitSource<'_>], deadline: Option<Instant>) -> Option<WaitOutcome> {
    let mut entries: Vec<FutexWaitv> = sources
        .iter()
        .map(|s| FutexWaitv {
            val: s.expected as u64,
            uaddr: s.word.as_ptr() as usize as u64,
            flags: FUTEX2_SIZE_U32 | FUTEX2_PRIVATE,
            __reserved: 0,
        })
        .collect();

    // futex_waitv takes an absolute CLOCK_MONOTONIC timespec
    let timespec = deadline.map(|d| {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
        let rel = d.saturating_duration_since(Instant::now());
        let mut sec = now.tv_sec + rel.as_secs() as libc::time_t;
        let mut nsec = now.tv_nsec + rel.subsec_nanos() as libc::c_long;
        if nsec >= 1_000_000_000 {
            sec += 1;
            nsec -= 1_000_000_000;
        }
        libc::timespec {
            tv_sec: sec,
            tv_nsec: nsec,
        }
    });
    let ts_ptr = timespec
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

    let rc = unsafe {
        libc::syscall(
            SYS_FUTEX_WAITV,
            entries.as_mut_ptr(),
            entries.len() as u32,
            0u32,
            ts_ptr,
            libc::CLOCK_MONOTONIC,
        )
    };
    if rc >= 0 {
        return Some(WaitOutcome::Ready(rc as usize));
    }
    match unsafe { *libc::__errno_location() } {
        libc::ENOSYS => None,
        libc::ETIMEDOUT => Some(WaitOutcome::TimedOut),
        // EAGAIN: some value mismatched during setup; find it
        _ => Some(WaitOutcome::Ready(scan_ready(sources).unwrap_or(0))),
    }
}

/// Degraded path: short sleeps on the first word, re-scanning all of them
fn poll_wait(sources: &[WaitSource<'_>], deadline: Option<Instant>) -> WaitOutcome {
    const SLICE: Duration = Duration::from_millis(1);
    loop {
        if let Some(idx) = scan_ready(sources) {
            return WaitOutcome::Ready(idx);
        }
        let now = Instant::now();
        if let Some(d) = deadline {
            if now >= d {
                return WaitOutcome::TimedOut;
            }
        }
        let slice_end = now + SLICE;
        let next = match deadline {
            Some(d) if d < slice_end => d,
            _ => slice_end,
        };
        wait(sources[0].word, sources[0].expected, Some(next));
    }
}
