//! Address-keyed parking lot
//!
//! A process-wide wait-queue service: any thread or task can park on an
//! arbitrary address and be woken by key. The queue state lives in a
//! growable hash table of word-locked buckets; each parked waiter
//! contributes a stack-allocated entry, so the lot itself allocates only
//! when the table grows.
//!
//! Waking is two-phase. The waker claims a waiter's shared record under
//! the bucket lock (which linearizes against timeout removal), releases
//! the bucket, and only then stores the unpark token, flips the record to
//! signaled and fires the sleep event. A waiter that observes its record
//! claimed therefore always waits for the signal and never misreads the
//! token. Task waiters are woken by posting a message to their pool, so
//! the lot never re-enters itself from the wake path.

mod event;
mod word_lock;

use event::WaitEvent;
use fibra_core::constants::MAX_PARK_MULTIPLE_KEYS;
use fibra_core::SpinLock;
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use word_lock::WordLock;

/// Caller-chosen word stored with a parked waiter, visible to filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParkToken(pub usize);

/// Caller-chosen word handed from the waker to the woken waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnparkToken(pub usize);

pub const DEFAULT_PARK_TOKEN: ParkToken = ParkToken(0);
pub const DEFAULT_UNPARK_TOKEN: UnparkToken = UnparkToken(0);

/// Outcome of [`park`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkResult {
    /// Woken by an unpark; carries the waker's token
    Unparked(UnparkToken),
    /// The validate callback refused the park
    Invalid,
    /// The deadline passed
    TimedOut,
}

/// Outcome of [`park_multiple`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiParkResult {
    /// Woken through `keys[key_index]`
    Unparked {
        key_index: usize,
        token: UnparkToken,
    },
    /// Validation refused `keys[key_index]`
    Invalid { key_index: usize },
    TimedOut,
}

/// Summary handed to unpark callbacks and returned from unpark calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnparkResult {
    pub unparked_tasks: usize,
    pub requeued_tasks: usize,
    /// More waiters with the same key remain queued
    pub have_more_tasks: bool,
    /// The bucket's fair timeout fired; hand the resource off directly
    pub be_fair: bool,
}

/// Decision per waiter in [`unpark_filter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Unpark,
    Skip,
    Stop,
}

/// Decision returned by the [`unpark_requeue`] validate callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOp {
    Abort,
    /// Wake up to `unpark` waiters, move up to `requeue` to the new key
    Do { unpark: usize, requeue: usize },
}

// Shared record states
const MQ_EMPTY: u32 = 0;
const MQ_CLAIMED: u32 = 1;
const MQ_SIGNALED: u32 = 2;
const MQ_TIMED_OUT: u32 = 3;

struct MqInner {
    /// Key the waker fired through; zero while unset
    consumer_key: usize,
    token: UnparkToken,
}

/// Record shared by every bucket entry of one park operation
struct MultiQueue {
    state: AtomicU32,
    inner: SpinLock<MqInner>,
    event: WaitEvent,
    park_token: ParkToken,
}

impl MultiQueue {
    fn new(park_token: ParkToken) -> MultiQueue {
        MultiQueue {
            state: AtomicU32::new(MQ_EMPTY),
            inner: SpinLock::new(MqInner {
                consumer_key: 0,
                token: DEFAULT_UNPARK_TOKEN,
            }),
            event: WaitEvent::for_current(),
            park_token,
        }
    }

    /// Reserve this record for waking; bucket lock must be held
    fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(MQ_EMPTY, MQ_CLAIMED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Complete a claim; called after the bucket lock is released
    fn signal(&self, consumer_key: usize, token: UnparkToken) {
        {
            let mut inner = self.inner.lock();
            inner.consumer_key = consumer_key;
            inner.token = token;
        }
        self.state.store(MQ_SIGNALED, Ordering::Release);
        self.event.set();
    }

    /// Wait out the claim-to-signal window, then read the result
    fn consume_signal(&self) -> (usize, UnparkToken) {
        while self.state.load(Ordering::Acquire) != MQ_SIGNALED {
            std::hint::spin_loop();
        }
        let inner = self.inner.lock();
        (inner.consumer_key, inner.token)
    }
}

/// One bucket entry; lives on the parking caller's stack (or in the
/// `park_multiple` entry array) for the duration of the operation
struct ParkEntry {
    key: AtomicUsize,
    next: Cell<*const ParkEntry>,
    /// Guarded by the owning bucket's lock
    queued: Cell<bool>,
    mq: *const MultiQueue,
}

impl ParkEntry {
    fn new(key: usize, mq: &MultiQueue) -> ParkEntry {
        ParkEntry {
            key: AtomicUsize::new(key),
            next: Cell::new(ptr::null()),
            queued: Cell::new(false),
            mq,
        }
    }
}

struct Bucket {
    lock: WordLock,
    // Guarded by `lock`
    head: Cell<*const ParkEntry>,
    tail: Cell<*const ParkEntry>,
    fair_deadline: Cell<Instant>,
    fair_seed: Cell<u32>,
}

// Safety: the interior cells are only touched under `lock`
unsafe impl Send for Bucket {}
unsafe impl Sync for Bucket {}

impl Bucket {
    fn new(seed: u32) -> Bucket {
        Bucket {
            lock: WordLock::new(),
            head: Cell::new(ptr::null()),
            tail: Cell::new(ptr::null()),
            fair_deadline: Cell::new(Instant::now()),
            fair_seed: Cell::new(seed | 1),
        }
    }

    /// Append at the tail; lock must be held
    unsafe fn append(&self, entry: *const ParkEntry) {
        (*entry).next.set(ptr::null());
        (*entry).queued.set(true);
        let tail = self.tail.get();
        if tail.is_null() {
            self.head.set(entry);
        } else {
            (*tail).next.set(entry);
        }
        self.tail.set(entry);
    }

    /// Unlink a known-queued entry; lock must be held
    unsafe fn remove(&self, entry: *const ParkEntry) {
        let mut prev: *const ParkEntry = ptr::null();
        let mut cur = self.head.get();
        while !cur.is_null() {
            let next = (*cur).next.get();
            if cur == entry {
                if prev.is_null() {
                    self.head.set(next);
                } else {
                    (*prev).next.set(next);
                }
                if self.tail.get() == cur {
                    self.tail.set(prev);
                }
                (*cur).queued.set(false);
                (*cur).next.set(ptr::null());
                return;
            }
            prev = cur;
            cur = next;
        }
        debug_assert!(false, "entry not found in bucket");
    }

    /// Any queued entry with this key? Lock must be held
    unsafe fn contains_key(&self, key: usize) -> bool {
        let mut cur = self.head.get();
        while !cur.is_null() {
            if (*cur).key.load(Ordering::Relaxed) == key {
                return true;
            }
            cur = (*cur).next.get();
        }
        false
    }

    /// Randomized fairness pulse; lock must be held
    fn should_be_fair(&self, now: Instant) -> bool {
        if now < self.fair_deadline.get() {
            return false;
        }
        let mut x = self.fair_seed.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.fair_seed.set(x);
        self.fair_deadline
            .set(now + Duration::from_nanos((x % 1_000_000) as u64));
        true
    }
}

const LOAD_FACTOR: usize = 3;
const INITIAL_BUCKETS: usize = 16;

struct HashTable {
    buckets: Box<[Bucket]>,
    hash_bits: u32,
    /// Retired predecessor, kept alive so late readers stay safe
    prev: *const HashTable,
}

impl HashTable {
    fn alloc(num_buckets: usize, prev: *const HashTable) -> *mut HashTable {
        let num_buckets = num_buckets.next_power_of_two();
        let buckets = (0..num_buckets)
            .map(|i| Bucket::new((i as u32).wrapping_mul(0x9E37_79B9).wrapping_add(1)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(HashTable {
            buckets,
            hash_bits: num_buckets.trailing_zeros(),
            prev,
        }))
    }

    #[inline]
    fn bucket_for(&self, key: usize) -> &Bucket {
        let idx = (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (64 - self.hash_bits)) as usize;
        &self.buckets[idx & (self.buckets.len() - 1)]
    }
}

static TABLE: AtomicPtr<HashTable> = AtomicPtr::new(ptr::null_mut());
static NUM_WAITERS: AtomicUsize = AtomicUsize::new(0);

fn table() -> &'static HashTable {
    let t = TABLE.load(Ordering::Acquire);
    if !t.is_null() {
        return unsafe { &*t };
    }
    let fresh = HashTable::alloc(INITIAL_BUCKETS, ptr::null());
    match TABLE.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => unsafe { &*fresh },
        Err(existing) => {
            // Lost the race; nobody has seen ours
            drop(unsafe { Box::from_raw(fresh) });
            unsafe { &*existing }
        }
    }
}

/// Lock the bucket for `key` in the currently published table
fn lock_bucket(key: usize) -> &'static Bucket {
    loop {
        let t = table();
        let bucket = t.bucket_for(key);
        bucket.lock.lock();
        if TABLE.load(Ordering::Acquire) == t as *const _ as *mut _ {
            return bucket;
        }
        // Table grew under us; retry against the new one
        bucket.lock.unlock();
    }
}

/// Lock the bucket an entry currently hashes to, re-reading the key in
/// case a requeue rewrote it between the load and the lock
fn lock_bucket_checked(entry: &ParkEntry) -> (usize, &'static Bucket) {
    loop {
        let key = entry.key.load(Ordering::Acquire);
        let bucket = lock_bucket(key);
        if entry.key.load(Ordering::Relaxed) == key {
            return (key, bucket);
        }
        bucket.lock.unlock();
    }
}

/// Lock the buckets for two keys in address order
fn lock_bucket_pair(key_from: usize, key_to: usize) -> (&'static Bucket, &'static Bucket) {
    loop {
        let t = table();
        let from = t.bucket_for(key_from);
        let to = t.bucket_for(key_to);
        if ptr::eq(from, to) {
            from.lock.lock();
        } else if (from as *const Bucket) < (to as *const Bucket) {
            from.lock.lock();
            to.lock.lock();
        } else {
            to.lock.lock();
            from.lock.lock();
        }
        if TABLE.load(Ordering::Acquire) == t as *const _ as *mut _ {
            return (from, to);
        }
        from.lock.unlock();
        if !ptr::eq(from, to) {
            to.lock.unlock();
        }
    }
}

fn unlock_bucket_pair(from: &Bucket, to: &Bucket) {
    from.lock.unlock();
    if !ptr::eq(from, to) {
        to.lock.unlock();
    }
}

/// Grow the table when the waiter population exceeds the load factor
fn grow_if_needed() {
    let waiters = NUM_WAITERS.load(Ordering::Relaxed);
    let t = table();
    if waiters <= LOAD_FACTOR * t.buckets.len() {
        return;
    }

    // Quiesce the whole current table, in array order
    for bucket in t.buckets.iter() {
        bucket.lock.lock();
    }
    // Someone may have grown while we were locking
    if TABLE.load(Ordering::Acquire) != t as *const _ as *mut _ {
        for bucket in t.buckets.iter() {
            bucket.lock.unlock();
        }
        return;
    }

    let new_table = HashTable::alloc(waiters * LOAD_FACTOR, t);
    unsafe {
        // Rehash preserving per-key FIFO order
        for bucket in t.buckets.iter() {
            let mut cur = bucket.head.get();
            while !cur.is_null() {
                let next = (*cur).next.get();
                let key = (*cur).key.load(Ordering::Relaxed);
                (*new_table).bucket_for(key).append(cur);
                cur = next;
            }
            bucket.head.set(ptr::null());
            bucket.tail.set(ptr::null());
        }
    }
    TABLE.store(new_table, Ordering::Release);
    for bucket in t.buckets.iter() {
        bucket.lock.unlock();
    }
}

/// Park the caller on `key`
///
/// Under the bucket lock `validate` decides whether to queue at all;
/// `before_sleep` runs after the bucket is released; `timed_out` runs
/// under the bucket lock if the deadline fires, receiving the (possibly
/// requeued) key and whether the caller was the last waiter on it.
///
/// # Safety
///
/// `validate` and `timed_out` run under a bucket lock and must not call
/// back into the parking lot or park themselves.
pub unsafe fn park(
    key: usize,
    validate: impl FnOnce() -> bool,
    before_sleep: impl FnOnce(),
    timed_out: impl FnOnce(usize, bool),
    park_token: ParkToken,
    deadline: Option<Instant>,
) -> ParkResult {
    let mq = MultiQueue::new(park_token);
    let entry = ParkEntry::new(key, &mq);

    NUM_WAITERS.fetch_add(1, Ordering::Relaxed);
    grow_if_needed();

    let bucket = lock_bucket(key);
    if !validate() {
        bucket.lock.unlock();
        NUM_WAITERS.fetch_sub(1, Ordering::Relaxed);
        return ParkResult::Invalid;
    }
    bucket.append(&entry);
    bucket.lock.unlock();

    before_sleep();

    loop {
        mq.event.wait(deadline);

        match mq.state.load(Ordering::Acquire) {
            MQ_SIGNALED | MQ_CLAIMED => {
                let (_, token) = mq.consume_signal();
                NUM_WAITERS.fetch_sub(1, Ordering::Relaxed);
                return ParkResult::Unparked(token);
            }
            _ => {}
        }

        let expired = deadline.is_some_and(|d| Instant::now() >= d);
        if !expired {
            // Spurious wake
            continue;
        }

        // Timeout: remove ourselves, unless a waker claimed us first.
        // The key may have been rewritten by a requeue, hence the
        // checked lock.
        let (current_key, bucket) = lock_bucket_checked(&entry);
        if mq.state.load(Ordering::Relaxed) != MQ_EMPTY {
            bucket.lock.unlock();
            let (_, token) = mq.consume_signal();
            NUM_WAITERS.fetch_sub(1, Ordering::Relaxed);
            return ParkResult::Unparked(token);
        }
        mq.state.store(MQ_TIMED_OUT, Ordering::Relaxed);
        bucket.remove(&entry);
        let was_last = !bucket.contains_key(current_key);
        timed_out(current_key, was_last);
        bucket.lock.unlock();
        NUM_WAITERS.fetch_sub(1, Ordering::Relaxed);
        return ParkResult::TimedOut;
    }
}

/// Park the caller on several keys at once; woken through whichever key
/// an unpark fires first
///
/// # Safety
///
/// Same contract as [`park`]; `validate(i)` runs under the bucket lock
/// of `keys[i]`.
pub unsafe fn park_multiple(
    keys: &[usize],
    mut validate: impl FnMut(usize) -> bool,
    before_sleep: impl FnOnce(),
    park_token: ParkToken,
    deadline: Option<Instant>,
) -> MultiParkResult {
    assert!(
        !keys.is_empty() && keys.len() <= MAX_PARK_MULTIPLE_KEYS,
        "park_multiple accepts 1..={} keys",
        MAX_PARK_MULTIPLE_KEYS
    );

    let mq = MultiQueue::new(park_token);
    let entries: Vec<ParkEntry> = keys.iter().map(|&k| ParkEntry::new(k, &mq)).collect();

    NUM_WAITERS.fetch_add(keys.len(), Ordering::Relaxed);
    grow_if_needed();

    let release = |outcome| {
        NUM_WAITERS.fetch_sub(keys.len(), Ordering::Relaxed);
        outcome
    };

    // Insert bucket by bucket; stop early if a validate refuses or an
    // unpark already consumed us through an earlier key
    for (i, &key) in keys.iter().enumerate() {
        let bucket = lock_bucket(key);
        if mq.state.load(Ordering::Acquire) != MQ_EMPTY {
            bucket.lock.unlock();
            break;
        }
        if !validate(i) {
            bucket.lock.unlock();
            dequeue_surviving(&entries);
            return release(MultiParkResult::Invalid { key_index: i });
        }
        bucket.append(&entries[i]);
        bucket.lock.unlock();
    }

    before_sleep();

    loop {
        if mq.state.load(Ordering::Acquire) != MQ_EMPTY {
            dequeue_surviving(&entries);
            let (consumer_key, token) = mq.consume_signal();
            let key_index = keys.iter().position(|&k| k == consumer_key).unwrap_or(0);
            return release(MultiParkResult::Unparked { key_index, token });
        }

        let expired = deadline.is_some_and(|d| Instant::now() >= d);
        if expired {
            dequeue_surviving(&entries);
            // With every entry out of its bucket no new claim can start;
            // either we beat the last claimer or we wait out its signal
            if mq
                .state
                .compare_exchange(MQ_EMPTY, MQ_TIMED_OUT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return release(MultiParkResult::TimedOut);
            }
            let (consumer_key, token) = mq.consume_signal();
            let key_index = keys.iter().position(|&k| k == consumer_key).unwrap_or(0);
            return release(MultiParkResult::Unparked { key_index, token });
        }

        mq.event.wait(deadline);
    }
}

/// Remove every entry that is still queued somewhere
unsafe fn dequeue_surviving(entries: &[ParkEntry]) {
    for entry in entries {
        let (_, bucket) = lock_bucket_checked(entry);
        if entry.queued.get() {
            bucket.remove(entry);
        }
        bucket.lock.unlock();
    }
}

/// Wake the oldest waiter parked on `key`
///
/// The callback runs under the bucket lock with the result it is about
/// to cause and chooses the unpark token.
///
/// # Safety
///
/// The callback must not call back into the parking lot.
pub unsafe fn unpark_one(
    key: usize,
    callback: impl FnOnce(UnparkResult) -> UnparkToken,
) -> UnparkResult {
    let bucket = lock_bucket(key);
    let mut result = UnparkResult::default();
    let mut target: *const ParkEntry = ptr::null();

    let mut prev: *const ParkEntry = ptr::null();
    let mut cur = bucket.head.get();
    while !cur.is_null() {
        let next = (*cur).next.get();
        if (*cur).key.load(Ordering::Relaxed) == key {
            if target.is_null() && (*(*cur).mq).try_claim() {
                // Unlink the claimed entry
                if prev.is_null() {
                    bucket.head.set(next);
                } else {
                    (*prev).next.set(next);
                }
                if bucket.tail.get() == cur {
                    bucket.tail.set(prev);
                }
                (*cur).queued.set(false);
                target = cur;
                cur = next;
                continue;
            }
            if !target.is_null() {
                result.have_more_tasks = true;
                break;
            }
        }
        prev = cur;
        cur = next;
    }

    if !target.is_null() {
        result.unparked_tasks = 1;
        result.be_fair = bucket.should_be_fair(Instant::now());
    }
    let token = callback(result);
    bucket.lock.unlock();

    if !target.is_null() {
        (*(*target).mq).signal(key, token);
    }
    result
}

/// Wake every waiter parked on `key`; returns how many were woken
pub unsafe fn unpark_all(key: usize, token: UnparkToken) -> usize {
    let bucket = lock_bucket(key);
    let mut woken: Vec<*const MultiQueue> = Vec::new();

    let mut prev: *const ParkEntry = ptr::null();
    let mut cur = bucket.head.get();
    while !cur.is_null() {
        let next = (*cur).next.get();
        if (*cur).key.load(Ordering::Relaxed) == key && (*(*cur).mq).try_claim() {
            if prev.is_null() {
                bucket.head.set(next);
            } else {
                (*prev).next.set(next);
            }
            if bucket.tail.get() == cur {
                bucket.tail.set(prev);
            }
            (*cur).queued.set(false);
            woken.push((*cur).mq);
        } else {
            prev = cur;
        }
        cur = next;
    }
    if !woken.is_empty() {
        bucket.should_be_fair(Instant::now());
    }
    bucket.lock.unlock();

    for mq in &woken {
        (**mq).signal(key, token);
    }
    woken.len()
}

/// Wake waiters on `key` selected by `filter`, in queue order
///
/// # Safety
///
/// Neither callback may call back into the parking lot.
pub unsafe fn unpark_filter(
    key: usize,
    mut filter: impl FnMut(ParkToken) -> FilterOp,
    callback: impl FnOnce(UnparkResult) -> UnparkToken,
) -> UnparkResult {
    let bucket = lock_bucket(key);
    let mut result = UnparkResult::default();
    let mut woken: Vec<*const MultiQueue> = Vec::new();

    let mut prev: *const ParkEntry = ptr::null();
    let mut cur = bucket.head.get();
    while !cur.is_null() {
        let next = (*cur).next.get();
        if (*cur).key.load(Ordering::Relaxed) == key {
            let mq = (*cur).mq;
            match filter((*mq).park_token) {
                FilterOp::Unpark => {
                    if (*mq).try_claim() {
                        if prev.is_null() {
                            bucket.head.set(next);
                        } else {
                            (*prev).next.set(next);
                        }
                        if bucket.tail.get() == cur {
                            bucket.tail.set(prev);
                        }
                        (*cur).queued.set(false);
                        woken.push(mq);
                        cur = next;
                        continue;
                    }
                }
                FilterOp::Skip => {
                    result.have_more_tasks = true;
                }
                FilterOp::Stop => {
                    result.have_more_tasks = true;
                    break;
                }
            }
        }
        prev = cur;
        cur = next;
    }

    result.unparked_tasks = woken.len();
    if !woken.is_empty() {
        result.be_fair = bucket.should_be_fair(Instant::now());
    }
    let token = callback(result);
    bucket.lock.unlock();

    for mq in &woken {
        (**mq).signal(key, token);
    }
    result
}

/// Wake some waiters on `key_from` and move others to `key_to`
///
/// `validate` runs with both buckets locked and decides how many to wake
/// and how many to requeue (or aborts). Requeued waiters keep sleeping
/// under the new key.
///
/// # Safety
///
/// Neither callback may call back into the parking lot.
pub unsafe fn unpark_requeue(
    key_from: usize,
    key_to: usize,
    validate: impl FnOnce() -> RequeueOp,
    callback: impl FnOnce(UnparkResult) -> UnparkToken,
) -> UnparkResult {
    let (from, to) = lock_bucket_pair(key_from, key_to);
    let mut result = UnparkResult::default();

    let (max_unpark, max_requeue) = match validate() {
        RequeueOp::Abort => {
            unlock_bucket_pair(from, to);
            return result;
        }
        RequeueOp::Do { unpark, requeue } => (unpark, requeue),
    };

    let mut woken: Vec<*const MultiQueue> = Vec::new();
    let mut prev: *const ParkEntry = ptr::null();
    let mut cur = from.head.get();
    while !cur.is_null() {
        let next = (*cur).next.get();
        if (*cur).key.load(Ordering::Relaxed) == key_from {
            if woken.len() < max_unpark {
                if (*(*cur).mq).try_claim() {
                    if prev.is_null() {
                        from.head.set(next);
                    } else {
                        (*prev).next.set(next);
                    }
                    if from.tail.get() == cur {
                        from.tail.set(prev);
                    }
                    (*cur).queued.set(false);
                    woken.push((*cur).mq);
                    cur = next;
                    continue;
                }
            } else if result.requeued_tasks < max_requeue {
                (*cur).key.store(key_to, Ordering::Release);
                if !ptr::eq(from, to) {
                    // Move to the target bucket; order among requeued
                    // waiters is preserved
                    if prev.is_null() {
                        from.head.set(next);
                    } else {
                        (*prev).next.set(next);
                    }
                    if from.tail.get() == cur {
                        from.tail.set(prev);
                    }
                    (*cur).queued.set(false);
                    to.append(cur);
                    result.requeued_tasks += 1;
                    cur = next;
                    continue;
                }
                // Same bucket: the key rewrite is the whole move
                result.requeued_tasks += 1;
            } else {
                result.have_more_tasks = true;
                break;
            }
        }
        prev = cur;
        cur = next;
    }

    result.unparked_tasks = woken.len();
    if !woken.is_empty() {
        result.be_fair = from.should_be_fair(Instant::now());
    }
    let token = callback(result);
    unlock_bucket_pair(from, to);

    for mq in &woken {
        (**mq).signal(key_from, token);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn key_of(x: &StdAtomicUsize) -> usize {
        x as *const _ as usize
    }

    #[test]
    fn test_park_invalid() {
        let word = StdAtomicUsize::new(0);
        let res = unsafe {
            park(
                key_of(&word),
                || false,
                || panic!("must not sleep"),
                |_, _| panic!("must not time out"),
                DEFAULT_PARK_TOKEN,
                None,
            )
        };
        assert_eq!(res, ParkResult::Invalid);
    }

    #[test]
    fn test_park_timeout_runs_callback() {
        let word = StdAtomicUsize::new(0);
        let saw = StdAtomicUsize::new(0);
        let res = unsafe {
            park(
                key_of(&word),
                || true,
                || {},
                |k, was_last| {
                    assert_eq!(k, key_of(&word));
                    assert!(was_last);
                    saw.store(1, Ordering::SeqCst);
                },
                DEFAULT_PARK_TOKEN,
                Some(Instant::now() + Duration::from_millis(30)),
            )
        };
        assert_eq!(res, ParkResult::TimedOut);
        assert_eq!(saw.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unpark_one_token_roundtrip() {
        let word = Arc::new(StdAtomicUsize::new(0));
        let w = Arc::clone(&word);
        let h = thread::spawn(move || unsafe {
            park(
                key_of(&w),
                || true,
                || w.store(1, Ordering::SeqCst),
                |_, _| {},
                ParkToken(5),
                None,
            )
        });
        while word.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        // Give the parker a moment to actually block
        thread::sleep(Duration::from_millis(10));
        let result = unsafe {
            unpark_one(key_of(&word), |r| {
                assert_eq!(r.unparked_tasks, 1);
                assert!(!r.have_more_tasks);
                UnparkToken(77)
            })
        };
        assert_eq!(result.unparked_tasks, 1);
        assert_eq!(h.join().unwrap(), ParkResult::Unparked(UnparkToken(77)));
    }

    #[test]
    fn test_fifo_per_key() {
        let word = Arc::new(StdAtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = vec![];
        for i in 0..2usize {
            let w = Arc::clone(&word);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                // Serialize park order: waiter 0 first, then waiter 1
                while w.load(Ordering::SeqCst) != i {
                    thread::yield_now();
                }
                let res = unsafe {
                    park(
                        key_of(&w),
                        || true,
                        || {
                            w.fetch_add(1, Ordering::SeqCst);
                        },
                        |_, _| {},
                        DEFAULT_PARK_TOKEN,
                        None,
                    )
                };
                assert!(matches!(res, ParkResult::Unparked(_)));
                order.lock().unwrap().push(i);
            }));
        }
        while word.load(Ordering::SeqCst) != 2 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));
        for _ in 0..2 {
            unsafe { unpark_one(key_of(&word), |_| DEFAULT_UNPARK_TOKEN) };
            thread::sleep(Duration::from_millis(10));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_unpark_all_counts() {
        let word = Arc::new(StdAtomicUsize::new(0));
        assert_eq!(
            unsafe { unpark_all(key_of(&word), DEFAULT_UNPARK_TOKEN) },
            0
        );
        let mut handles = vec![];
        for _ in 0..3 {
            let w = Arc::clone(&word);
            handles.push(thread::spawn(move || unsafe {
                park(
                    key_of(&w),
                    || true,
                    || {
                        w.fetch_add(1, Ordering::SeqCst);
                    },
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    None,
                )
            }));
        }
        while word.load(Ordering::SeqCst) != 3 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));
        assert_eq!(unsafe { unpark_all(key_of(&word), UnparkToken(9)) }, 3);
        for h in handles {
            assert_eq!(h.join().unwrap(), ParkResult::Unparked(UnparkToken(9)));
        }
    }

    #[test]
    fn test_unpark_filter_skip_and_stop() {
        let word = Arc::new(StdAtomicUsize::new(0));
        let mut handles = vec![];
        for i in 0..3usize {
            let w = Arc::clone(&word);
            handles.push(thread::spawn(move || {
                while w.load(Ordering::SeqCst) != i {
                    thread::yield_now();
                }
                unsafe {
                    park(
                        key_of(&w),
                        || true,
                        || {
                            w.fetch_add(1, Ordering::SeqCst);
                        },
                        |_, _| {},
                        ParkToken(i),
                        None,
                    )
                }
            }));
        }
        while word.load(Ordering::SeqCst) != 3 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));
        // Skip waiter 0, wake waiter 1, stop before waiter 2
        let result = unsafe {
            unpark_filter(
                key_of(&word),
                |token| match token.0 {
                    0 => FilterOp::Skip,
                    1 => FilterOp::Unpark,
                    _ => FilterOp::Stop,
                },
                |r| {
                    assert_eq!(r.unparked_tasks, 1);
                    assert!(r.have_more_tasks);
                    UnparkToken(42)
                },
            )
        };
        assert_eq!(result.unparked_tasks, 1);
        // Wake the rest and confirm only waiter 1 saw token 42
        thread::sleep(Duration::from_millis(10));
        unsafe { unpark_all(key_of(&word), UnparkToken(0)) };
        let mut results = vec![];
        for h in handles {
            results.push(h.join().unwrap());
        }
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, ParkResult::Unparked(UnparkToken(42))))
                .count(),
            1
        );
    }

    #[test]
    fn test_requeue_splits_waiters() {
        let k1 = Arc::new(StdAtomicUsize::new(0));
        let k2 = Arc::new(StdAtomicUsize::new(0));
        let mut handles = vec![];
        for i in 0..4usize {
            let k1 = Arc::clone(&k1);
            handles.push(thread::spawn(move || {
                while k1.load(Ordering::SeqCst) != i {
                    thread::yield_now();
                }
                unsafe {
                    park(
                        key_of(&k1),
                        || true,
                        || {
                            k1.fetch_add(1, Ordering::SeqCst);
                        },
                        |_, _| {},
                        DEFAULT_PARK_TOKEN,
                        None,
                    )
                }
            }));
        }
        while k1.load(Ordering::SeqCst) != 4 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));

        let result = unsafe {
            unpark_requeue(
                key_of(&k1),
                key_of(&k2),
                || RequeueOp::Do {
                    unpark: 1,
                    requeue: 2,
                },
                |_| DEFAULT_UNPARK_TOKEN,
            )
        };
        assert_eq!(result.unparked_tasks, 1);
        assert_eq!(result.requeued_tasks, 2);
        assert!(result.have_more_tasks);

        thread::sleep(Duration::from_millis(10));
        assert_eq!(unsafe { unpark_all(key_of(&k2), DEFAULT_UNPARK_TOKEN) }, 2);
        assert_eq!(unsafe { unpark_all(key_of(&k1), DEFAULT_UNPARK_TOKEN) }, 1);
        for h in handles {
            assert!(matches!(h.join().unwrap(), ParkResult::Unparked(_)));
        }
    }

    #[test]
    fn test_park_multiple_woken_by_second_key() {
        let k1 = Arc::new(StdAtomicUsize::new(0));
        let k2 = Arc::new(StdAtomicUsize::new(0));
        let (a, b) = (Arc::clone(&k1), Arc::clone(&k2));
        let h = thread::spawn(move || unsafe {
            park_multiple(
                &[key_of(&a), key_of(&b)],
                |_| true,
                || a.store(1, Ordering::SeqCst),
                DEFAULT_PARK_TOKEN,
                None,
            )
        });
        while k1.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));
        let result = unsafe { unpark_one(key_of(&k2), |_| UnparkToken(3)) };
        assert_eq!(result.unparked_tasks, 1);
        match h.join().unwrap() {
            MultiParkResult::Unparked { key_index, token } => {
                assert_eq!(key_index, 1);
                assert_eq!(token, UnparkToken(3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_park_multiple_timeout_cleans_up() {
        let k1 = StdAtomicUsize::new(0);
        let k2 = StdAtomicUsize::new(0);
        let res = unsafe {
            park_multiple(
                &[key_of(&k1), key_of(&k2)],
                |_| true,
                || {},
                DEFAULT_PARK_TOKEN,
                Some(Instant::now() + Duration::from_millis(30)),
            )
        };
        assert_eq!(res, MultiParkResult::TimedOut);
        // Both keys must be empty again
        assert_eq!(unsafe { unpark_all(key_of(&k1), DEFAULT_UNPARK_TOKEN) }, 0);
        assert_eq!(unsafe { unpark_all(key_of(&k2), DEFAULT_UNPARK_TOKEN) }, 0);
    }

    #[test]
    fn test_growth_under_many_waiters() {
        let words: Vec<Arc<StdAtomicUsize>> =
            (0..64).map(|_| Arc::new(StdAtomicUsize::new(0))).collect();
        let ready = Arc::new(Barrier::new(65));
        let mut handles = vec![];
        for w in &words {
            let w = Arc::clone(w);
            let ready = Arc::clone(&ready);
            handles.push(thread::spawn(move || {
                ready.wait();
                unsafe {
                    park(
                        key_of(&w),
                        || true,
                        || {
                            w.store(1, Ordering::SeqCst);
                        },
                        |_, _| {},
                        DEFAULT_PARK_TOKEN,
                        None,
                    )
                }
            }));
        }
        ready.wait();
        for w in &words {
            while w.load(Ordering::SeqCst) == 0 {
                thread::yield_now();
            }
        }
        thread::sleep(Duration::from_millis(20));
        let mut woken = 0;
        for w in &words {
            woken += unsafe { unpark_all(key_of(w), DEFAULT_UNPARK_TOKEN) };
        }
        assert_eq!(woken, 64);
        for h in handles {
            assert!(matches!(h.join().unwrap(), ParkResult::Unparked(_)));
        }
    }
}
