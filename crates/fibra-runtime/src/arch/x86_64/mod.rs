//! x86_64 context switching (System V ABI)
//!
//! Suspended frame layout, from the context's stack pointer upward:
//!
//! ```text
//! sp + 0x00  r15
//! sp + 0x08  r14
//! sp + 0x10  r13
//! sp + 0x18  r12   (carries the entry function for a fresh context)
//! sp + 0x20  rbx
//! sp + 0x28  rbp
//! sp + 0x30  return address
//! ```
//!
//! XMM registers are caller-saved under System V, so only the integer
//! callee-saved set is preserved.

use super::{ContextEntry, RawContext, Transfer};
use std::arch::naked_asm;

/// Initialize a context whose first resumption calls `entry`
///
/// # Safety
///
/// See [`super::make_context`].
pub unsafe fn make_context(stack_top: *mut u8, entry: ContextEntry) -> RawContext {
    // 16-byte alignment per System V, 7 slots for regs + return address
    let top = (stack_top as usize) & !0xF;
    let sp = (top - 7 * 8) as *mut usize;
    core::ptr::write_bytes(sp, 0, 7);
    sp.add(3).write(entry as usize); // restored into r12
    sp.add(6).write(entry_trampoline as usize);
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
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Hand our suspended context to the peer, adopt its stack
        "mov rax, rsp",
        "mov rsp, rdi",
        // Restore the peer's registers
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        // Transfer { ctx: rax, data: rdx }
        "mov rdx, rsi",
        "ret",
    );
}

/// Shim between the raw switch and the Rust entry function
///
/// Reached via `ret` with the previous context in rax and the data word
/// in rdx; moves them into the argument registers for `entry(Transfer)`.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, rax",
        "mov rsi, rdx",
        "call r12",
        // entry never returns
        "ud2",
    );
}
