//! Unix stack mapping using mmap
//!
//! The whole reservation starts `PROT_NONE`; everything above the guard
//! page is then flipped to read-write. Physical pages arrive on first
//! touch and are handed back with `madvise(MADV_DONTNEED)` when the
//! allocator parks a stack cold.

use super::{page_size, round_to_pages};
use fibra_core::constants::MIN_STACK_SIZE;
use fibra_core::{PoolError, PoolResult};
use std::ptr::NonNull;

/// One reserved task stack: guard page at the bottom, usable range above
pub struct StackMapping {
    base: NonNull<u8>,
    total: usize,
    usable: usize,
}

// Safety: the mapping is plain memory; ownership moves between the pool
// and the task that borrows it, never shared
unsafe impl Send for StackMapping {}

impl StackMapping {
    /// Reserve a stack with at least `requested` usable bytes
    pub fn map(requested: usize) -> PoolResult<StackMapping> {
        let usable = round_to_pages(requested.max(MIN_STACK_SIZE));
        let total = usable + page_size();

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(PoolError::OutOfMemory);
        }

        // Everything above the guard page becomes usable
        let ret = unsafe {
            libc::mprotect(
                (base as *mut u8).add(page_size()) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(PoolError::OutOfMemory);
        }

        Ok(StackMapping {
            // Safety: mmap success is non-null
            base: unsafe { NonNull::new_unchecked(base as *mut u8) },
            total,
            usable,
        })
    }

    /// Upper end of the usable range; initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.total) }
    }

    /// Usable bytes between guard page and top
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.usable
    }

    /// Release physical pages while keeping the reservation
    ///
    /// The stack stays mapped; pages fault back in on next use.
    pub fn decommit(&self) {
        unsafe {
            libc::madvise(
                self.base.as_ptr().add(page_size()) as *mut libc::c_void,
                self.usable,
                libc::MADV_DONTNEED,
            );
        }
    }

    /// Whether `addr` falls inside the guard page
    pub fn in_guard_page(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + page_size()
    }
}

impl Drop for StackMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_touch() {
        let stack = StackMapping::map(64 * 1024).unwrap();
        assert!(stack.usable_size() >= 64 * 1024);
        // The usable range must be writable end to end
        unsafe {
            let top = stack.top();
            top.sub(1).write(0xAB);
            top.sub(stack.usable_size()).write(0xCD);
            assert_eq!(top.sub(1).read(), 0xAB);
        }
    }

    #[test]
    fn test_minimum_size_enforced() {
        let stack = StackMapping::map(1).unwrap();
        assert!(stack.usable_size() >= MIN_STACK_SIZE);
    }

    #[test]
    fn test_decommit_keeps_mapping_usable() {
        let stack = StackMapping::map(32 * 1024).unwrap();
        unsafe { stack.top().sub(8).write(1) };
        stack.decommit();
        // Pages fault back in zeroed
        unsafe {
            stack.top().sub(8).write(2);
            assert_eq!(stack.top().sub(8).read(), 2);
        }
    }

    #[test]
    fn test_guard_page_detection() {
        let stack = StackMapping::map(32 * 1024).unwrap();
        let base = stack.base.as_ptr() as usize;
        assert!(stack.in_guard_page(base));
        assert!(!stack.in_guard_page(base + page_size()));
    }
}
