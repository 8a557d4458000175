//! Task stack memory
//!
//! Each task stack is a private anonymous mapping: a guard page at the
//! low end (kept `PROT_NONE`, so overflow faults instead of corrupting a
//! neighbor) and a usable region that the kernel commits on demand.
//! Mappings are recycled through the per-class [`alloc::StackAllocator`].

pub(crate) mod alloc;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::StackMapping;
    }
}

use std::sync::OnceLock;

/// System page size, queried once
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 {
            4096
        } else {
            sz as usize
        }
    })
}

/// Round `n` up to a multiple of the page size
#[inline]
pub fn round_to_pages(n: usize) -> usize {
    let page = page_size();
    (n + page - 1) & !(page - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        let page = page_size();
        assert_eq!(round_to_pages(1), page);
        assert_eq!(round_to_pages(page), page);
        assert_eq!(round_to_pages(page + 1), 2 * page);
    }
}
