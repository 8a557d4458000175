//! Identifier types for pools, workers and tasks

use core::fmt;

/// Index of a worker thread within its pool
///
/// A 32-bit value indexing the pool's worker vector. The maximum value
/// (u32::MAX) is reserved as a sentinel for "any worker".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    /// Sentinel value indicating no worker binding
    pub const ANY: WorkerId = WorkerId(u32::MAX);

    /// Create a new WorkerId from a raw index
    #[inline]
    pub const fn new(id: u32) -> Self {
        WorkerId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get as usize for indexing
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Check if this is the ANY sentinel
    #[inline]
    pub const fn is_any(self) -> bool {
        self.0 == u32::MAX
    }

    /// Convert to Option
    #[inline]
    pub const fn to_option(self) -> Option<WorkerId> {
        if self.is_any() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u32> for WorkerId {
    #[inline]
    fn from(id: u32) -> Self {
        WorkerId(id)
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "WorkerId(ANY)")
        } else {
            write!(f, "WorkerId({})", self.0)
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "any")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        WorkerId::ANY
    }
}

/// Unique identifier of a pool within the process
///
/// Assigned from a process-wide counter when the pool is spawned; never
/// reused, so a stale id simply fails the registry lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PoolId(u64);

impl PoolId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        PoolId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Diagnostic identifier of a task, assigned per pool in spawn order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TaskId(u64);

impl TaskId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        TaskId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_basics() {
        let id = WorkerId::new(3);
        assert_eq!(id.as_u32(), 3);
        assert_eq!(id.as_usize(), 3);
        assert!(!id.is_any());
        assert_eq!(id.to_option(), Some(id));
    }

    #[test]
    fn test_worker_id_any() {
        let any = WorkerId::ANY;
        assert!(any.is_any());
        assert_eq!(any.to_option(), None);
        assert_eq!(format!("{}", any), "any");
    }

    #[test]
    fn test_pool_id_ordering() {
        assert!(PoolId::new(1) < PoolId::new(2));
        assert_eq!(PoolId::new(7).as_u64(), 7);
    }
}
