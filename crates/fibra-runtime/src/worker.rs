//! Worker threads
//!
//! Each worker is an OS thread hosting one task at a time. It pulls work
//! from its private queue and the pool's shared channel (blocking on
//! both at once when idle), runs the task on the task's own stack, and
//! translates the task's control transfer into a message for the pool
//! loop. Once a task has run on a worker it stays on that worker.

use crate::arch::switch_context;
use crate::channel::{PopError, TaskQueue};
use crate::futex::{self, WaitSource};
use crate::pool::{PoolMessage, PoolShared, TaskRef};
use crate::task::{Task, TraceStack, WorkerMessage};
use crate::tls;
use fibra_core::{ftrace, WorkerId};
use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

pub(crate) struct Worker {
    shared: Arc<PoolShared>,
    id: WorkerId,
    queue: Arc<TaskQueue>,
    /// Steers the shared channel's pop descent
    seed: Cell<u32>,
    /// The worker's own tracing call stack, swapped out while a task runs
    trace: UnsafeCell<TraceStack>,
}

impl Worker {
    pub(crate) unsafe fn shared_of(ptr: *const Worker) -> Arc<PoolShared> {
        Arc::clone(&(*ptr).shared)
    }

    pub(crate) unsafe fn id_of(ptr: *const Worker) -> WorkerId {
        (*ptr).id
    }

    fn next_seed(&self) -> u32 {
        let mut x = self.seed.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.seed.set(x);
        x
    }
}

/// Body of every worker thread
pub(crate) fn worker_main(shared: Arc<PoolShared>, id: WorkerId, queue: Arc<TaskQueue>) {
    let worker = Worker {
        shared,
        id,
        queue,
        seed: Cell::new(id.as_u32().wrapping_mul(0x9E37_79B9).wrapping_add(1) | 1),
        trace: UnsafeCell::new(TraceStack::for_worker()),
    };
    tls::set_current_worker(&worker);
    fibra_core::flog::set_log_worker(Some(id.as_u32()));
    ftrace!("worker started");

    while let Some(task) = fetch_task(&worker) {
        run_task(&worker, task);
    }

    ftrace!("worker exiting");
    tls::clear_current_worker();
    fibra_core::flog::set_log_worker(None);
}

/// Pull the next task, preferring whichever side is currently richer
///
/// Blocks on the private queue and the shared channel simultaneously;
/// returns `None` only when both are closed and drained.
fn fetch_task(worker: &Worker) -> Option<NonNull<Task>> {
    let global = &worker.shared.global;
    let queue = &worker.queue;
    loop {
        // A worker with fewer queued private tasks than its fair share
        // of the global backlog drains the global side first
        let fair_share = global.len() / worker.shared.worker_count.max(1);
        let local_first = queue.len() >= fair_share;

        let mut global_closed = false;
        for round in 0..2 {
            let try_local = (round == 0) == local_first;
            if try_local {
                if let Some(task) = queue.pop() {
                    return Some(task);
                }
            } else {
                match global.pop(worker.next_seed()) {
                    Ok(TaskRef(task)) => return Some(task),
                    Err(PopError::Empty) => {}
                    Err(PopError::Closed) => global_closed = true,
                }
            }
        }

        if global_closed && queue.is_closed() {
            // Final drain of the private side before shutting down
            match queue.pop() {
                Some(task) => return Some(task),
                None => return None,
            }
        }

        // Sleep on both channels at once
        let queue_snapshot = queue.prepare_wait();
        global.register_sleeper();
        // Late arrivals between the polls above and here show up in the
        // snapshots, so this wait cannot miss them
        let sources = [
            WaitSource {
                word: queue.wait_word(),
                expected: queue_snapshot,
            },
            WaitSource {
                word: global.wait_word(),
                expected: global.wait_expected(),
            },
        ];
        if queue.is_empty() && global.is_empty() && !queue.is_closed() && !global.is_closed() {
            futex::wait_multiple(&sources, None);
        }
        global.unregister_sleeper();
        queue.cancel_wait();
    }
}

/// Whether a queued task was overtaken by its buffer's abort forwarding
unsafe fn overtaken_by_abort(t: *mut Task) -> bool {
    let shared = &(*t).buffer_shared;
    shared.abort_on_error.load(Ordering::Acquire)
        && shared.pending_abort.load(Ordering::Acquire) < (*t).entry_index
}

/// Host one task until it transfers control back, then forward its
/// message to the pool
fn run_task(worker: &Worker, task: NonNull<Task>) {
    let t = task.as_ptr();
    unsafe {
        // An earlier entry of the owning buffer errored while this task
        // sat in a queue: hand it back unrun
        if overtaken_by_abort(t) {
            let _ = worker
                .shared
                .messages
                .push(PoolMessage::TaskCancelled { task: TaskRef(task) });
            return;
        }
        if !(*t).bound {
            (*t).bound = true;
            if (*t).worker.is_none() {
                (*t).worker = Some(worker.id);
            }
        }
        debug_assert_eq!((*t).worker, Some(worker.id), "task migrated workers");
        (*t).enqueued = false;
        (*t).ensure_context();

        // Switch ordering: suspend the worker's call stack, swap in the
        // task's, resume, then jump
        (*worker.trace.get()).suspend(false);
        (*t).trace.resume();
        tls::set_current_task(t);

        let ctx = (*t).context.take().expect("task context missing");
        let transfer = switch_context(ctx, t as usize);

        tls::clear_current_task();

        let msg = (*t).msg;
        let message = match msg {
            WorkerMessage::Complete | WorkerMessage::Abort => {
                // The fiber is finished; its context is dead
                (*t).trace.suspend(false);
                let error = matches!(msg, WorkerMessage::Abort);
                if error && (&(*t).buffer_shared).abort_on_error.load(Ordering::Acquire) {
                    // Publish the failing entry before any sibling task
                    // can be fetched, so abort forwarding is prompt
                    (&(*t).buffer_shared)
                        .pending_abort
                        .fetch_min((*t).entry_index, Ordering::AcqRel);
                }
                PoolMessage::TaskDone {
                    task: TaskRef(task),
                    error,
                }
            }
            WorkerMessage::Yield => {
                (*t).context = Some(transfer.ctx);
                (*t).trace.suspend(false);
                PoolMessage::TaskYield { task: TaskRef(task) }
            }
            WorkerMessage::Sleep { deadline } => {
                (*t).context = Some(transfer.ctx);
                if deadline <= Instant::now() {
                    // Already due: degrade to a yield
                    (*t).trace.suspend(false);
                    PoolMessage::TaskYield { task: TaskRef(task) }
                } else {
                    (*t).trace.suspend(true);
                    PoolMessage::TaskSleep {
                        task: TaskRef(task),
                        deadline,
                    }
                }
            }
            WorkerMessage::Wait {
                addr,
                expect,
                deadline,
            } => {
                (*t).context = Some(transfer.ctx);
                if deadline.is_some_and(|d| d <= Instant::now()) {
                    (*t).wait_timed_out = true;
                    (*t).trace.suspend(false);
                    PoolMessage::TaskYield { task: TaskRef(task) }
                } else {
                    (*t).trace.suspend(true);
                    PoolMessage::TaskWait {
                        task: TaskRef(task),
                        addr,
                        expect,
                        deadline,
                    }
                }
            }
            WorkerMessage::None => unreachable!("task returned without a message"),
        };

        // Swap the worker's call stack back in
        (*worker.trace.get()).resume();

        let _ = worker.shared.messages.push(message);
    }
}
