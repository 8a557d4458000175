//! Intrusive per-worker task queue
//!
//! MPSC: the pool loop (and anyone re-enqueueing) pushes onto a lock-free
//! LIFO list through each task's embedded link; the owning worker pops in
//! FIFO order by grabbing the whole list and reversing it into a private
//! chain. Only the worker thread touches the private chain.

use super::EventWord;
use crate::task::Task;
use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

pub struct TaskQueue {
    /// Push side: newest first, linked through `Task::queue_next`
    head: AtomicPtr<Task>,

    /// Consumer side: oldest first; worker thread only
    local: UnsafeCell<*mut Task>,

    /// Tasks currently queued (either side), for the fetch heuristic
    len: AtomicUsize,

    event: EventWord,
}

// Safety: `local` is only dereferenced by the single consumer (the
// owning worker); the push side is lock-free
unsafe impl Send for TaskQueue {}
unsafe impl Sync for TaskQueue {}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            head: AtomicPtr::new(ptr::null_mut()),
            local: UnsafeCell::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            event: EventWord::new(),
        }
    }

    /// Push a task; any thread
    ///
    /// The task must not sit in any other queue (single-queue invariant).
    pub fn push(&self, task: NonNull<Task>) {
        let task_ptr = task.as_ptr();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*task_ptr).queue_next.store(head, Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                head,
                task_ptr,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        self.event.bump();
    }

    /// Pop the oldest task; consumer (worker) thread only
    pub fn pop(&self) -> Option<NonNull<Task>> {
        // Safety: single consumer by contract
        let local = unsafe { &mut *self.local.get() };
        if local.is_null() {
            let mut grabbed = self.head.swap(ptr::null_mut(), Ordering::Acquire);
            // Newest-first; reverse into oldest-first
            let mut reversed: *mut Task = ptr::null_mut();
            while !grabbed.is_null() {
                let next = unsafe { (*grabbed).queue_next.load(Ordering::Relaxed) };
                unsafe { (*grabbed).queue_next.store(reversed, Ordering::Relaxed) };
                reversed = grabbed;
                grabbed = next;
            }
            *local = reversed;
        }
        if local.is_null() {
            return None;
        }
        let task = *local;
        *local = unsafe { (*task).queue_next.load(Ordering::Relaxed) };
        unsafe { (*task).queue_next.store(ptr::null_mut(), Ordering::Relaxed) };
        self.len.fetch_sub(1, Ordering::Relaxed);
        // Safety: pushed as NonNull
        Some(unsafe { NonNull::new_unchecked(task) })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.event.close();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.event.is_closed()
    }

    pub fn prepare_wait(&self) -> u32 {
        self.event.prepare_wait()
    }

    pub fn cancel_wait(&self) {
        self.event.cancel_wait()
    }

    #[inline]
    pub fn wait_word(&self) -> &AtomicU32 {
        self.event.word()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
