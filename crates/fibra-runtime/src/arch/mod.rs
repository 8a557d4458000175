//! Architecture-specific context switching
//!
//! A context is the stack pointer of a suspended execution: the switch
//! pushes the callee-saved registers onto the current stack, swaps stack
//! pointers, pops the target's registers and returns into it. Contexts
//! are one-shot — every switch consumes the handle it was given and
//! produces a fresh handle for the suspended peer, carried back in the
//! [`Transfer`] along with a data word.

use core::ptr::NonNull;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        use x86_64 as imp;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        use aarch64 as imp;
    }
}

/// Handle to a suspended execution context
///
/// Must be resumed at most once; the next suspension of that execution
/// yields a new handle.
#[repr(transparent)]
#[derive(Debug)]
pub struct RawContext(NonNull<u8>);

impl RawContext {
    #[inline]
    pub(crate) unsafe fn from_sp(sp: *mut u8) -> Self {
        RawContext(NonNull::new_unchecked(sp))
    }

    #[inline]
    pub(crate) fn sp(&self) -> *mut u8 {
        self.0.as_ptr()
    }
}

// Safety: a suspended context is inert data; it only runs again on the
// thread that resumes it
unsafe impl Send for RawContext {}

/// Result of a context switch: the peer's new handle plus a data word
#[repr(C)]
#[derive(Debug)]
pub struct Transfer {
    pub ctx: RawContext,
    pub data: usize,
}

/// First function of a new context; never returns normally
pub type ContextEntry = unsafe extern "C" fn(Transfer) -> !;

/// Prepare a context on `stack_top` whose first resumption runs `entry`
///
/// # Safety
///
/// `stack_top` must be the upper end of a live, writable stack with
/// enough room below it; `entry` must never return.
#[inline]
pub unsafe fn make_context(stack_top: *mut u8, entry: ContextEntry) -> RawContext {
    imp::make_context(stack_top, entry)
}

/// Suspend the current execution and resume `target`
///
/// `data` is handed to the peer; the value the peer later passes back
/// arrives in the returned [`Transfer`].
///
/// # Safety
///
/// `target` must be a context produced by [`make_context`] or a previous
/// switch and not yet resumed.
#[inline]
pub unsafe fn switch_context(target: RawContext, data: usize) -> Transfer {
    imp::switch_context(target, data)
}
