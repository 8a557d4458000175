//! Task records and the in-task API
//!
//! A task is a user function plus a private stack plus scheduler state.
//! The record is heap-allocated, owned by the pool, and lent to exactly
//! one queue or worker at a time. Control transfers out of a task go
//! through [`WorkerMessage`]: the task fills its message slot and
//! switches back to the hosting worker, which forwards the message to
//! the pool loop.

use crate::arch::{switch_context, RawContext, Transfer};
use crate::command::BufferKey;
use crate::futex;
use crate::memory::StackMapping;
use crate::tls;
use crate::worker::Worker;
use fibra_core::locals::LocalDtor;
use fibra_core::{ferror, ftrace};
use fibra_core::{TaskId, TaskLocalMap, WorkerId};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared task function: called once per batch index
pub type TaskFn = Arc<dyn Fn(usize) + Send + Sync>;

/// Hook invoked when an entry is aborted before its tasks ran
pub type AbortFn = Arc<dyn Fn(usize) + Send + Sync>;

/// Panic payload used by [`abort`]; unwinds the task without tripping
/// the panic hook
pub struct TaskAbortSignal;

/// Control transfer from a task back to its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerMessage {
    None,
    /// User function returned
    Complete,
    /// User function aborted or panicked
    Abort,
    Yield,
    Sleep {
        deadline: Instant,
    },
    Wait {
        addr: usize,
        expect: u32,
        deadline: Option<Instant>,
    },
}

/// Minimal tracing call stack, swapped between worker and task around
/// every context switch
pub(crate) struct TraceStack {
    pub id: Option<u64>,
    pub blocked: bool,
}

impl TraceStack {
    pub fn for_worker() -> TraceStack {
        TraceStack {
            id: None,
            blocked: false,
        }
    }

    pub fn for_task(id: TaskId) -> TraceStack {
        TraceStack {
            id: Some(id.as_u64()),
            blocked: false,
        }
    }

    /// Make this the thread's active call stack
    pub fn resume(&mut self) {
        self.blocked = false;
        fibra_core::flog::set_log_task(self.id);
    }

    /// Deactivate; `blocked` records that the owner is waiting rather
    /// than runnable
    pub fn suspend(&mut self, blocked: bool) {
        self.blocked = blocked;
    }
}

pub(crate) struct Task {
    pub id: TaskId,
    /// Owning command buffer (arena key) and position within it
    pub buffer: BufferKey,
    pub entry_index: usize,
    pub batch_index: usize,
    /// Shared buffer state, consulted by workers for abort forwarding
    pub buffer_shared: Arc<crate::command::BufferShared>,

    pub run: TaskFn,

    /// Borrowed from the pool's allocator; reclaimed on completion
    pub stack: Option<StackMapping>,
    pub class_index: usize,

    /// Sticky binding: None until first executed, then fixed
    pub worker: Option<WorkerId>,
    pub bound: bool,
    pub enqueued: bool,

    /// The task's suspended context (scheduler side) and, while the task
    /// runs, the hosting worker's suspended context (task side)
    pub context: Option<RawContext>,
    pub worker_ctx: Option<RawContext>,

    pub msg: WorkerMessage,
    /// Result of the last wait, written by the pool before re-enqueue
    pub wait_timed_out: bool,
    /// Active entry in the pool's timeout queue, for cancellation
    pub timeout_handle: Option<u64>,

    pub locals: TaskLocalMap,
    pub trace: TraceStack,

    /// Intrusive link for the worker queue
    pub queue_next: AtomicPtr<Task>,
}

// Safety: the record is handed between the pool and one worker with
// exclusive ownership at every point (single-queue invariant)
unsafe impl Send for Task {}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TaskId,
        buffer: BufferKey,
        entry_index: usize,
        batch_index: usize,
        buffer_shared: Arc<crate::command::BufferShared>,
        run: TaskFn,
        stack: StackMapping,
        class_index: usize,
        worker: Option<WorkerId>,
    ) -> NonNull<Task> {
        let task = Box::new(Task {
            id,
            buffer,
            entry_index,
            batch_index,
            buffer_shared,
            run,
            stack: Some(stack),
            class_index,
            worker,
            bound: false,
            enqueued: false,
            context: None,
            worker_ctx: None,
            msg: WorkerMessage::None,
            wait_timed_out: false,
            timeout_handle: None,
            locals: TaskLocalMap::new(),
            trace: TraceStack::for_task(id),
            queue_next: AtomicPtr::new(std::ptr::null_mut()),
        });
        // Safety: Box::into_raw is non-null
        unsafe { NonNull::new_unchecked(Box::into_raw(task)) }
    }

    /// Lazily set up the execution context on the task's own stack
    pub fn ensure_context(&mut self) {
        if self.context.is_none() {
            let stack = self.stack.as_ref().expect("task without stack");
            // Safety: the stack is mapped and exclusively ours
            self.context = Some(unsafe { crate::arch::make_context(stack.top(), task_entry) });
        }
    }

    /// Reclaim the record and return the stack for recycling
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Task::new`] and must not be referenced by
    /// any queue or worker.
    pub unsafe fn into_stack(ptr: NonNull<Task>) -> Option<StackMapping> {
        let mut task = Box::from_raw(ptr.as_ptr());
        task.stack.take()
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(id: u64) -> NonNull<Task> {
        let task = Box::new(Task {
            id: TaskId::new(id),
            buffer: 0,
            entry_index: 0,
            batch_index: 0,
            buffer_shared: crate::command::BufferShared::new(fibra_core::PoolId::new(0)),
            run: Arc::new(|_| {}),
            stack: None,
            class_index: 0,
            worker: None,
            bound: false,
            enqueued: false,
            context: None,
            worker_ctx: None,
            msg: WorkerMessage::None,
            wait_timed_out: false,
            timeout_handle: None,
            locals: TaskLocalMap::new(),
            trace: TraceStack::for_worker(),
            queue_next: AtomicPtr::new(std::ptr::null_mut()),
        });
        unsafe { NonNull::new_unchecked(Box::into_raw(task)) }
    }

    #[cfg(test)]
    pub(crate) unsafe fn drop_for_test(ptr: NonNull<Task>) {
        drop(Box::from_raw(ptr.as_ptr()));
    }
}

/// First (and only) frame of every task fiber
///
/// Runs the user function under `catch_unwind`, so both `abort` and
/// stray panics turn into an abort message instead of crossing the
/// context switch.
pub(crate) unsafe extern "C" fn task_entry(t: Transfer) -> ! {
    let task = t.data as *mut Task;
    (*task).worker_ctx = Some(t.ctx);

    let run = Arc::clone(&(*task).run);
    let batch = (*task).batch_index;
    let result = panic::catch_unwind(AssertUnwindSafe(|| run(batch)));

    let msg = match result {
        Ok(()) => WorkerMessage::Complete,
        Err(payload) => {
            if payload.downcast_ref::<TaskAbortSignal>().is_none() {
                ferror!("task panicked, treating as abort");
            }
            WorkerMessage::Abort
        }
    };

    // Destructors run on the fiber, while the task context is current
    (*task).locals.run_dtors();

    (*task).msg = msg;
    let worker_ctx = (*task).worker_ctx.take().expect("lost worker context");
    switch_context(worker_ctx, &(*task).msg as *const _ as usize);
    unreachable!("completed task resumed");
}

/// Hand control back to the worker; resumes when rescheduled
fn suspend_current(task: *mut Task) {
    unsafe {
        let worker_ctx = (*task).worker_ctx.take().expect("suspend outside task");
        let transfer = switch_context(worker_ctx, &(*task).msg as *const _ as usize);
        (*task).worker_ctx = Some(transfer.ctx);
    }
}

/// Cooperatively yield the current task
///
/// Outside a task this degrades to an OS-level yield.
pub fn yield_now() {
    let task = tls::current_task();
    if task.is_null() {
        std::thread::yield_now();
        return;
    }
    unsafe { (*task).msg = WorkerMessage::Yield };
    suspend_current(task);
}

/// Suspend the current task for at least `duration`
pub fn sleep(duration: Duration) {
    let task = tls::current_task();
    if task.is_null() {
        std::thread::sleep(duration);
        return;
    }
    if duration.is_zero() {
        yield_now();
        return;
    }
    unsafe {
        (*task).msg = WorkerMessage::Sleep {
            deadline: Instant::now() + duration,
        };
    }
    suspend_current(task);
}

/// Abort the current task; its command buffer applies the abort policy
///
/// # Panics
///
/// Panics if called outside a task.
pub fn abort() -> ! {
    assert!(tls::in_task(), "abort called outside a task");
    ftrace!("task abort requested");
    panic::resume_unwind(Box::new(TaskAbortSignal))
}

/// Suspend until `*addr != expect` and a wake arrives
///
/// Address waits are scoped to the caller's pool. Outside a task this
/// falls back to a plain futex wait.
pub fn wait(addr: &AtomicU32, expect: u32) {
    wait_on_address(addr, expect, None);
}

/// Like [`wait`] with a timeout; `false` means the deadline fired
pub fn timed_wait(addr: &AtomicU32, expect: u32, timeout: Duration) -> bool {
    wait_on_address(addr, expect, Some(Instant::now() + timeout))
}

/// Internal wait primitive shared with the parking lot
pub(crate) fn wait_on_address(addr: &AtomicU32, expect: u32, deadline: Option<Instant>) -> bool {
    let task = tls::current_task();
    if task.is_null() {
        return futex::wait(addr, expect, deadline);
    }
    unsafe {
        (*task).msg = WorkerMessage::Wait {
            addr: addr.as_ptr() as usize,
            expect,
            deadline,
        };
    }
    suspend_current(task);
    unsafe { !(*task).wait_timed_out }
}

/// Wake tasks of the caller's pool waiting on `addr`
///
/// `max_waiters` of 0 wakes every waiter, 1 wakes the oldest. Outside a
/// task this falls back to a futex wake.
pub fn wake(addr: &AtomicU32, max_waiters: usize) {
    let worker = tls::current_worker();
    if !worker.is_null() {
        let shared = unsafe { Worker::shared_of(worker) };
        shared.post_wake(addr.as_ptr() as usize, max_waiters);
    } else {
        let n = if max_waiters == 0 {
            i32::MAX
        } else {
            max_waiters.min(i32::MAX as usize) as i32
        };
        futex::wake(addr, n);
    }
}

/// Store a task-local value under `key`, replacing any previous one
///
/// Returns `false` outside a task or when the table is full.
///
/// # Safety
///
/// `key` must be a real address; `dtor`, if given, must be callable
/// with `value` exactly once.
pub unsafe fn task_local_set(key: usize, value: *mut (), dtor: Option<LocalDtor>) -> bool {
    let task = tls::current_task();
    if task.is_null() {
        return false;
    }
    (*task).locals.set(key, value, dtor)
}

/// Read back a task-local value
pub fn task_local_get(key: usize) -> Option<*mut ()> {
    let task = tls::current_task();
    if task.is_null() {
        return None;
    }
    unsafe { (*task).locals.get(key) }
}

/// Drop a task-local value, running its destructor
pub fn task_local_clear(key: usize) -> bool {
    let task = tls::current_task();
    if task.is_null() {
        return false;
    }
    unsafe { (*task).locals.clear(key) }
}

/// Id of the worker hosting the caller, if any
pub fn current_worker_id() -> Option<WorkerId> {
    let worker = tls::current_worker();
    if worker.is_null() {
        None
    } else {
        Some(unsafe { Worker::id_of(worker) })
    }
}

/// Whether the caller runs inside a task
pub fn in_task() -> bool {
    tls::in_task()
}
