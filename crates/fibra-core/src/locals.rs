//! Fixed-capacity task-local value table
//!
//! Every task carries one of these. Keys are arbitrary addresses compared
//! by identity (callers typically use the address of a static). The table
//! is open-addressed with linear probing and never grows; a full table
//! rejects the insert.
//!
//! Destructors registered with a value run when the owning task completes
//! or aborts, and on `clear`.

use crate::constants::TASK_LOCAL_SLOTS;

/// Destructor invoked with the stored value pointer
pub type LocalDtor = unsafe fn(*mut ());

const EMPTY: usize = 0;
const TOMBSTONE: usize = usize::MAX;

#[derive(Clone, Copy)]
struct Slot {
    /// Key address; EMPTY and TOMBSTONE are reserved
    key: usize,
    value: *mut (),
    dtor: Option<LocalDtor>,
}

impl Slot {
    const VACANT: Slot = Slot {
        key: EMPTY,
        value: core::ptr::null_mut(),
        dtor: None,
    };
}

/// Open-addressed pointer-keyed map with a fixed number of slots
pub struct TaskLocalMap {
    slots: [Slot; TASK_LOCAL_SLOTS],
    len: usize,
}

impl TaskLocalMap {
    pub fn new() -> Self {
        TaskLocalMap {
            slots: [Slot::VACANT; TASK_LOCAL_SLOTS],
            len: 0,
        }
    }

    #[inline]
    fn probe_start(key: usize) -> usize {
        // Fibonacci hash of the address, folded into the table
        key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (usize::BITS as usize - 7)
    }

    /// Insert or replace the value for `key`
    ///
    /// Replacing runs the old value's destructor first. Returns `false`
    /// if the table is full.
    ///
    /// # Safety
    ///
    /// `key` must be a real address (neither 0 nor usize::MAX); `dtor`,
    /// if given, must be safe to call with `value` exactly once.
    pub unsafe fn set(&mut self, key: usize, value: *mut (), dtor: Option<LocalDtor>) -> bool {
        debug_assert!(key != EMPTY && key != TOMBSTONE);
        let start = Self::probe_start(key);
        let mut first_tombstone = None;
        for i in 0..TASK_LOCAL_SLOTS {
            let idx = (start + i) & (TASK_LOCAL_SLOTS - 1);
            let slot = &mut self.slots[idx];
            if slot.key == key {
                if let Some(d) = slot.dtor {
                    d(slot.value);
                }
                slot.value = value;
                slot.dtor = dtor;
                return true;
            }
            if slot.key == TOMBSTONE {
                if first_tombstone.is_none() {
                    first_tombstone = Some(idx);
                }
                continue;
            }
            if slot.key == EMPTY {
                let idx = first_tombstone.unwrap_or(idx);
                self.slots[idx] = Slot {
                    key,
                    value,
                    dtor,
                };
                self.len += 1;
                return true;
            }
        }
        // Probed the whole table; a recycled tombstone is still usable
        if let Some(idx) = first_tombstone {
            self.slots[idx] = Slot { key, value, dtor };
            self.len += 1;
            return true;
        }
        false
    }

    /// Look up the value stored for `key`
    pub fn get(&self, key: usize) -> Option<*mut ()> {
        let start = Self::probe_start(key);
        for i in 0..TASK_LOCAL_SLOTS {
            let idx = (start + i) & (TASK_LOCAL_SLOTS - 1);
            let slot = &self.slots[idx];
            if slot.key == key {
                return Some(slot.value);
            }
            if slot.key == EMPTY {
                return None;
            }
        }
        None
    }

    /// Remove `key`, running its destructor; returns whether it existed
    pub fn clear(&mut self, key: usize) -> bool {
        let start = Self::probe_start(key);
        for i in 0..TASK_LOCAL_SLOTS {
            let idx = (start + i) & (TASK_LOCAL_SLOTS - 1);
            let slot = &mut self.slots[idx];
            if slot.key == key {
                if let Some(d) = slot.dtor {
                    // Safety: registered by `set` with this value
                    unsafe { d(slot.value) };
                }
                slot.key = TOMBSTONE;
                slot.value = core::ptr::null_mut();
                slot.dtor = None;
                self.len -= 1;
                return true;
            }
            if slot.key == EMPTY {
                return false;
            }
        }
        false
    }

    /// Run every remaining destructor and empty the table
    ///
    /// Called once when the owning task completes.
    pub fn run_dtors(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.key != EMPTY && slot.key != TOMBSTONE {
                if let Some(d) = slot.dtor {
                    // Safety: registered by `set` with this value
                    unsafe { d(slot.value) };
                }
            }
            *slot = Slot::VACANT;
        }
        self.len = 0;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for TaskLocalMap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskLocalMap {
    fn drop(&mut self) {
        self.run_dtors();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static KEY_A: u8 = 0;
    static KEY_B: u8 = 0;

    fn key(r: &'static u8) -> usize {
        r as *const u8 as usize
    }

    #[test]
    fn test_set_get_clear() {
        let mut map = TaskLocalMap::new();
        let mut v = 7usize;
        unsafe {
            assert!(map.set(key(&KEY_A), &mut v as *mut usize as *mut (), None));
        }
        assert_eq!(map.len(), 1);
        let got = map.get(key(&KEY_A)).unwrap();
        assert_eq!(unsafe { *(got as *mut usize) }, 7);

        assert!(map.clear(key(&KEY_A)));
        assert!(map.get(key(&KEY_A)).is_none());
        assert!(!map.clear(key(&KEY_A)));
        assert!(map.is_empty());
    }

    #[test]
    fn test_replace_runs_dtor() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        unsafe fn count_drop(_v: *mut ()) {
            DROPS.fetch_add(1, Ordering::Relaxed);
        }

        let mut map = TaskLocalMap::new();
        unsafe {
            map.set(key(&KEY_A), core::ptr::null_mut(), Some(count_drop));
            map.set(key(&KEY_A), core::ptr::null_mut(), Some(count_drop));
        }
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);
        assert_eq!(map.len(), 1);
        map.run_dtors();
        assert_eq!(DROPS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_distinct_keys() {
        let mut map = TaskLocalMap::new();
        unsafe {
            map.set(key(&KEY_A), 1 as *mut (), None);
            map.set(key(&KEY_B), 2 as *mut (), None);
        }
        assert_eq!(map.get(key(&KEY_A)), Some(1 as *mut ()));
        assert_eq!(map.get(key(&KEY_B)), Some(2 as *mut ()));
    }

    #[test]
    fn test_fills_up() {
        let mut map = TaskLocalMap::new();
        // Synthetic aligned keys; the table holds exactly TASK_LOCAL_SLOTS
        for i in 0..TASK_LOCAL_SLOTS {
            let k = (i + 1) * 8;
            assert!(unsafe { map.set(k, core::ptr::null_mut(), None) });
        }
        let overflow = (TASK_LOCAL_SLOTS + 1) * 8;
        assert!(!unsafe { map.set(overflow, core::ptr::null_mut(), None) });

        // Clearing one slot makes room again
        assert!(map.clear(8));
        assert!(unsafe { map.set(overflow, core::ptr::null_mut(), None) });
    }

    #[test]
    fn test_tombstone_probe_continues() {
        let mut map = TaskLocalMap::new();
        let a = key(&KEY_A);
        // Force two keys with the same probe start by reusing the table
        // index math: same start, different key values
        let start = a;
        let clash = a + TASK_LOCAL_SLOTS * 8; // may or may not collide; harmless
        unsafe {
            map.set(start, 1 as *mut (), None);
            map.set(clash, 2 as *mut (), None);
        }
        map.clear(start);
        // The second key must still be reachable past the tombstone
        assert_eq!(map.get(clash), Some(2 as *mut ()));
    }
}
