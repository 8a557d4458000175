//! Thread-local scheduler context
//!
//! Each worker thread registers itself here for its lifetime; the running
//! task is swapped in and out around every context switch. The parking
//! lot consults these cells to decide between a thread sleep and a task
//! suspension, and the task API routes through them.

use crate::task::Task;
use crate::worker::Worker;
use std::cell::Cell;
use std::ptr;

thread_local! {
    /// Worker hosted by this OS thread, if any
    static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(ptr::null()) };

    /// Task currently executing on this thread's worker
    static CURRENT_TASK: Cell<*mut Task> = const { Cell::new(ptr::null_mut()) };
}

pub(crate) fn set_current_worker(worker: *const Worker) {
    CURRENT_WORKER.with(|cell| cell.set(worker));
}

pub(crate) fn clear_current_worker() {
    CURRENT_WORKER.with(|cell| cell.set(ptr::null()));
}

#[inline]
pub(crate) fn current_worker() -> *const Worker {
    CURRENT_WORKER.with(|cell| cell.get())
}

pub(crate) fn set_current_task(task: *mut Task) {
    CURRENT_TASK.with(|cell| cell.set(task));
}

pub(crate) fn clear_current_task() {
    CURRENT_TASK.with(|cell| cell.set(ptr::null_mut()));
}

#[inline]
pub(crate) fn current_task() -> *mut Task {
    CURRENT_TASK.with(|cell| cell.get())
}

/// Whether the calling thread hosts a worker
#[inline]
pub fn on_worker_thread() -> bool {
    !current_worker().is_null()
}

/// Whether the caller is running inside a task
#[inline]
pub fn in_task() -> bool {
    !current_task().is_null()
}
