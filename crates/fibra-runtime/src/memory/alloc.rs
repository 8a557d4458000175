//! Per-class stack allocator
//!
//! One allocator per configured stack size class, owned by the pool event
//! loop (so no internal locking). Freed stacks pass through a small
//! deallocation cache, then a hot list (pages still committed), then a
//! cold list (decommitted); a fresh mapping is made only while under the
//! class's `max_allocated` budget. When the budget is exhausted the
//! requesting command buffer parks on the waiter list and is re-enqueued
//! by the next deallocation.

use super::StackMapping;
use crate::command::BufferKey;
use crate::config::StackClassConfig;
use fibra_core::{PoolError, PoolResult};
use std::collections::VecDeque;

/// Result of an allocation attempt
pub enum Allocation {
    Stack(StackMapping),
    /// Budget exhausted; caller must park the buffer via `enqueue_waiter`
    Blocked,
    /// The OS refused a mapping
    OutOfMemory,
}

pub struct StackAllocator {
    usable_size: usize,
    max_allocated: usize,
    hot_target: usize,
    cold_target: usize,
    cache_capacity: usize,

    /// Mappings currently in existence (in any list or lent out)
    allocated: usize,
    dealloc_cache: Vec<StackMapping>,
    hot: Vec<StackMapping>,
    cold: Vec<StackMapping>,

    /// Buffers blocked until a stack frees up, FIFO
    waiters: VecDeque<BufferKey>,
}

impl StackAllocator {
    /// Build an allocator for one size class, pre-warming `preallocated`
    /// mappings
    pub fn new(class: &StackClassConfig, worker_count: usize) -> PoolResult<StackAllocator> {
        let mut alloc = StackAllocator {
            usable_size: class.size,
            max_allocated: class.max_allocated,
            hot_target: class.hot,
            cold_target: class.cold,
            cache_capacity: 2 * worker_count.max(1),
            allocated: 0,
            dealloc_cache: Vec::new(),
            hot: Vec::with_capacity(class.hot),
            cold: Vec::with_capacity(class.cold),
            waiters: VecDeque::new(),
        };
        for i in 0..class.preallocated {
            let stack = StackMapping::map(class.size).map_err(|_| PoolError::OutOfMemory)?;
            if i < class.hot {
                alloc.hot.push(stack);
            } else {
                stack.decommit();
                alloc.cold.push(stack);
            }
            alloc.allocated += 1;
        }
        Ok(alloc)
    }

    /// Stack size this class serves
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.usable_size
    }

    /// Take a stack: cache, then hot, then cold, then a fresh mapping
    pub fn allocate(&mut self) -> Allocation {
        if let Some(stack) = self
            .dealloc_cache
            .pop()
            .or_else(|| self.hot.pop())
            .or_else(|| self.cold.pop())
        {
            return Allocation::Stack(stack);
        }
        if self.allocated >= self.max_allocated {
            return Allocation::Blocked;
        }
        match StackMapping::map(self.usable_size) {
            Ok(stack) => {
                self.allocated += 1;
                Allocation::Stack(stack)
            }
            Err(_) => Allocation::OutOfMemory,
        }
    }

    /// Return a stack; yields the next waiting buffer to re-enqueue
    pub fn deallocate(&mut self, stack: StackMapping) -> Option<BufferKey> {
        if self.dealloc_cache.len() < self.cache_capacity {
            self.dealloc_cache.push(stack);
        } else if self.hot.len() < self.hot_target {
            self.hot.push(stack);
        } else if self.cold.len() < self.cold_target {
            stack.decommit();
            self.cold.push(stack);
        } else {
            // Over every target: give it back to the OS
            drop(stack);
            self.allocated -= 1;
        }
        self.waiters.pop_front()
    }

    /// Park a buffer until `deallocate` hands a stack back
    pub fn enqueue_waiter(&mut self, key: BufferKey) {
        self.waiters.push_back(key);
    }

    /// Drop a parked buffer (it aborted while waiting)
    pub fn remove_waiter(&mut self, key: BufferKey) {
        self.waiters.retain(|k| *k != key);
    }

    #[inline]
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Mappings currently lent out to live tasks
    #[inline]
    pub fn in_use(&self) -> usize {
        self.allocated - self.hot.len() - self.cold.len() - self.dealloc_cache.len()
    }

    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(size: usize, pre: usize, cold: usize, hot: usize, max: usize) -> StackClassConfig {
        StackClassConfig {
            size,
            preallocated: pre,
            cold,
            hot,
            max_allocated: max,
        }
    }

    #[test]
    fn test_prealloc_split() {
        let alloc = StackAllocator::new(&class(64 * 1024, 3, 2, 1, 8), 2).unwrap();
        assert_eq!(alloc.allocated(), 3);
        assert_eq!(alloc.hot.len(), 1);
        assert_eq!(alloc.cold.len(), 2);
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn test_allocate_prefers_cache() {
        let mut alloc = StackAllocator::new(&class(64 * 1024, 0, 2, 2, 4), 1).unwrap();
        let a = match alloc.allocate() {
            Allocation::Stack(s) => s,
            _ => panic!("expected a stack"),
        };
        assert_eq!(alloc.allocated(), 1);
        assert_eq!(alloc.in_use(), 1);
        assert!(alloc.deallocate(a).is_none());
        assert_eq!(alloc.dealloc_cache.len(), 1);
        // Next allocation reuses the cached stack
        match alloc.allocate() {
            Allocation::Stack(_) => {}
            _ => panic!("expected a stack"),
        }
        assert_eq!(alloc.allocated(), 1);
    }

    #[test]
    fn test_blocks_at_budget() {
        let mut alloc = StackAllocator::new(&class(64 * 1024, 0, 0, 0, 1), 1).unwrap();
        let first = match alloc.allocate() {
            Allocation::Stack(s) => s,
            _ => panic!("expected a stack"),
        };
        assert!(matches!(alloc.allocate(), Allocation::Blocked));
        alloc.enqueue_waiter(9);
        let woken = alloc.deallocate(first);
        assert_eq!(woken, Some(9));
        assert!(matches!(alloc.allocate(), Allocation::Stack(_)));
    }

    #[test]
    fn test_accounting_balances() {
        let mut alloc = StackAllocator::new(&class(64 * 1024, 2, 1, 1, 6), 1).unwrap();
        let mut held = Vec::new();
        for _ in 0..4 {
            match alloc.allocate() {
                Allocation::Stack(s) => held.push(s),
                _ => panic!("expected a stack"),
            }
        }
        assert_eq!(alloc.in_use(), 4);
        for s in held.drain(..) {
            alloc.deallocate(s);
        }
        assert_eq!(alloc.in_use(), 0);
        assert_eq!(
            alloc.allocated(),
            alloc.hot.len() + alloc.cold.len() + alloc.dealloc_cache.len()
        );
    }

    #[test]
    fn test_overflow_releases_to_os() {
        // cache cap = 2 * worker_count = 2, hot 0, cold 0
        let mut alloc = StackAllocator::new(&class(64 * 1024, 0, 0, 0, 8), 1).unwrap();
        let mut held = Vec::new();
        for _ in 0..4 {
            match alloc.allocate() {
                Allocation::Stack(s) => held.push(s),
                _ => panic!("expected a stack"),
            }
        }
        for s in held.drain(..) {
            alloc.deallocate(s);
        }
        // Two fit the cache, the rest were unmapped
        assert_eq!(alloc.allocated(), 2);
        assert_eq!(alloc.in_use(), 0);
    }
}
