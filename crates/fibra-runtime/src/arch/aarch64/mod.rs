//! aarch64 context switching (AAPCS64)
//!
//! Suspended frame layout, from the context's stack pointer upward:
//!
//! ```text
//! sp + 0x00  x19, x20
//! sp + 0x10  x21, x22
//! sp + 0x20  x23, x24
//! sp + 0x30  x25, x26
//! sp + 0x40  x27, x28
//! sp + 0x50  x29, x30  (x30 carries the entry function for a fresh context)
//! sp + 0x60  d8,  d9
//! sp + 0x70  d10, d11
//! sp + 0x80  d12, d13
//! sp + 0x90  d14, d15
//! ```
//!
//! No trampoline is needed: `ret` into the entry already has the previous
//! context in x0 and the data word in x1, which is exactly the AAPCS64
//! layout of `entry(Transfer)`.

use super::{ContextEntry, RawContext, Transfer};
use std::arch::naked_asm;

const FRAME: usize = 160;

/// Initialize a context whose first resumption calls `entry`
///
/// # Safety
///
/// See [`super::make_context`].
pub unsafe fn make_context(stack_top: *mut u8, entry: ContextEntry) -> RawContext {
    let top = (stack_top as usize) & !0xF;
    let sp = (top - FRAME) as *mut usize;
    core::ptr::write_bytes(sp, 0, FRAME / 8);
    sp.add(11).write(entry as usize); // restored into x30
    RawContext::from_sp(sp as *mut u8)
}

/// Suspend the caller, resume `target`, pass `data` across
///
/// # Safety
///
/// See [`super::switch_context`].
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(target: RawContext, data: usize) -> Transfer {
    naked_asm!(
        // Save callee-saved registers on the current stack
        "sub sp, sp, 160",
        "stp x19, x20, [sp, 0]",
        "stp x21, x22, [sp, 16]",
        "stp x23, x24, [sp, 32]",
        "stp x25, x26, [sp, 48]",
        "stp x27, x28, [sp, 64]",
        "stp x29, x30, [sp, 80]",
        "stp d8,  d9,  [sp, 96]",
        "stp d10, d11, [sp, 112]",
        "stp d12, d13, [sp, 128]",
        "stp d14, d15, [sp, 144]",
        // Hand our suspended context to the peer, adopt its stack
        "mov x2, sp",
        "mov x3, x0",
        "mov sp, x3",
        // Restore the peer's registers
        "ldp x19, x20, [sp, 0]",
        "ldp x21, x22, [sp, 16]",
        "ldp x23, x24, [sp, 32]",
        "ldp x25, x26, [sp, 48]",
        "ldp x27, x28, [sp, 64]",
        "ldp x29, x30, [sp, 80]",
        "ldp d8,  d9,  [sp, 96]",
        "ldp d10, d11, [sp, 112]",
        "ldp d12, d13, [sp, 128]",
        "ldp d14, d15, [sp, 144]",
        "add sp, sp, 160",
        // Transfer { ctx: x0, data: x1 }; x1 already holds data
        "mov x0, x2",
        "ret",
    );
}
