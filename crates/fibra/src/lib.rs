//! # fibra
//!
//! An M:N fiber task runtime: pools of OS worker threads cooperatively
//! scheduling lightweight tasks with private, guard-paged stacks. Work
//! is submitted as *command buffers* — ordered lists of directives that
//! spawn task batches, pin them to workers, insert barriers and chain
//! buffers onto each other.
//!
//! ```no_run
//! use fibra::{spawn_pool, CommandBuffer, PoolConfig};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pool = spawn_pool(&PoolConfig::new().worker_count(4)).unwrap();
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! let c = Arc::clone(&counter);
//! let mut buf = CommandBuffer::new();
//! buf.spawn_batch(16, move |_| {
//!     c.fetch_add(1, Ordering::Relaxed);
//! })
//! .wait_barrier();
//!
//! let handle = pool.enqueue(buf).unwrap();
//! handle.wait_on();
//! assert_eq!(counter.load(Ordering::Relaxed), 16);
//! ```
//!
//! Inside a task, the [`task`] module offers cooperative control:
//! `yield_now`, `sleep`, address-keyed `wait`/`wake`, `abort`, and
//! task-local storage. The [`lot`] module exposes the underlying
//! address-keyed parking lot for building synchronization primitives
//! that serve OS threads and tasks alike.

pub use fibra_core::{BufferStatus, EntryError, PoolError, PoolId, PoolResult, TaskId, WorkerId};
pub use fibra_runtime::{
    default_worker_count, BufferHandle, CommandBuffer, PoolConfig, PoolHandle, Runtime,
    StackClassConfig, WeakPoolHandle,
};

/// In-task control: yield, sleep, wait/wake, abort, task locals
pub mod task {
    pub use fibra_runtime::task::{
        abort, current_worker_id, in_task, sleep, task_local_clear, task_local_get,
        task_local_set, timed_wait, wait, wake, yield_now,
    };
}

/// Address-keyed parking lot for custom synchronization primitives
pub mod lot {
    pub use fibra_runtime::lot::{
        park, park_multiple, unpark_all, unpark_filter, unpark_one, unpark_requeue, FilterOp,
        MultiParkResult, ParkResult, ParkToken, RequeueOp, UnparkResult, UnparkToken,
        DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN,
    };
}

/// Spawn a pool in the process-wide registry
pub fn spawn_pool(config: &PoolConfig) -> PoolResult<PoolHandle> {
    Runtime::global().spawn_pool(config)
}

/// Look up a live pool by id in the process-wide registry
pub fn query_pool_by_id(id: PoolId) -> Option<PoolHandle> {
    Runtime::global().query_pool_by_id(id)
}

/// All public pools in the process-wide registry
pub fn query_all_pools() -> Vec<PoolHandle> {
    Runtime::global().query_all_pools()
}
