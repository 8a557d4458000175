//! Command buffers
//!
//! A command buffer is an immutable ordered list of scheduling
//! directives built by the caller and submitted to a pool. This module
//! holds the public builder and completion handle plus the pool-internal
//! record the event loop drives; the entry-by-entry processing itself
//! lives with the pool loop.

use crate::futex;
use crate::task::{AbortFn, TaskFn};
use crate::tls;
use crate::worker::Worker;
use fibra_core::state::{BUFFER_HAS_WAITERS, BUFFER_RUNNING};
use fibra_core::{BufferStatus, EnqueueStatus, EntryStatus, PoolId, WorkerId};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Index of a buffer record in its pool's arena
pub(crate) type BufferKey = usize;

/// One directive in a command buffer
pub(crate) enum Command {
    SetAbortOnError(bool),
    SetMinStackSize(usize),
    SelectWorker(u32),
    SelectAnyWorker,
    EnqueueTask(TaskSpec),
    /// Payload is taken when the nested buffer is admitted
    EnqueueBuffer(Option<CommandBuffer>),
    WaitBarrier,
    /// Wait until the entry `offset` positions back is processed
    WaitCommand(usize),
    WaitHandle(BufferHandle),
}

/// User task descriptor: shared function plus batch width
pub(crate) struct TaskSpec {
    pub run: TaskFn,
    pub on_abort: Option<AbortFn>,
    pub batch: usize,
}

/// Builder for a list of scheduling directives
///
/// Entries execute in program order; `spawn_*` entries fan out tasks
/// whose completions may interleave until a barrier or wait entry.
pub struct CommandBuffer {
    pub(crate) entries: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        CommandBuffer {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.entries.reserve(additional);
    }

    /// Change the abort policy for subsequent entries
    pub fn set_abort_on_error(&mut self, enabled: bool) -> &mut Self {
        self.entries.push(Command::SetAbortOnError(enabled));
        self
    }

    /// Pick the stack class for subsequent tasks by minimum size
    pub fn set_min_stack_size(&mut self, size: usize) -> &mut Self {
        self.entries.push(Command::SetMinStackSize(size));
        self
    }

    /// Pin subsequent tasks to worker `index`
    pub fn select_worker(&mut self, index: u32) -> &mut Self {
        self.entries.push(Command::SelectWorker(index));
        self
    }

    /// Let subsequent tasks run on any worker
    pub fn select_any_worker(&mut self) -> &mut Self {
        self.entries.push(Command::SelectAnyWorker);
        self
    }

    /// Spawn one task
    pub fn spawn_task(&mut self, f: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.spawn_batch(1, move |_| f())
    }

    /// Spawn `batch` tasks sharing `f`, called with indices `0..batch`
    pub fn spawn_batch(
        &mut self,
        batch: usize,
        f: impl Fn(usize) + Send + Sync + 'static,
    ) -> &mut Self {
        self.entries.push(Command::EnqueueTask(TaskSpec {
            run: Arc::new(f),
            on_abort: None,
            batch,
        }));
        self
    }

    /// Like [`spawn_batch`](Self::spawn_batch) with a hook that runs if
    /// the entry is aborted before its tasks execute
    pub fn spawn_batch_with_abort(
        &mut self,
        batch: usize,
        f: impl Fn(usize) + Send + Sync + 'static,
        on_abort: impl Fn(usize) + Send + Sync + 'static,
    ) -> &mut Self {
        self.entries.push(Command::EnqueueTask(TaskSpec {
            run: Arc::new(f),
            on_abort: Some(Arc::new(on_abort)),
            batch,
        }));
        self
    }

    /// Submit a nested command buffer
    pub fn enqueue_buffer(&mut self, sub: CommandBuffer) -> &mut Self {
        self.entries.push(Command::EnqueueBuffer(Some(sub)));
        self
    }

    /// Suspend processing until every task spawned so far has finished
    pub fn wait_barrier(&mut self) -> &mut Self {
        self.entries.push(Command::WaitBarrier);
        self
    }

    /// Suspend until the entry `offset` positions back is processed
    pub fn wait_command(&mut self, offset: usize) -> &mut Self {
        self.entries.push(Command::WaitCommand(offset));
        self
    }

    /// Suspend until an external buffer of the same pool completes
    pub fn wait_handle(&mut self, handle: BufferHandle) -> &mut Self {
        self.entries.push(Command::WaitHandle(handle));
        self
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the pool, the handles and the workers
pub(crate) struct BufferShared {
    /// Completion word, doubling as a futex for `wait_on`
    pub state: AtomicU32,
    pub pool: PoolId,
    /// Mirror of the buffer's abort policy, maintained by the pool loop
    pub abort_on_error: AtomicBool,
    /// Lowest entry index that errored; workers skip enqueued tasks of
    /// strictly later entries once the policy is on. MAX means no error.
    pub pending_abort: AtomicUsize,
}

impl BufferShared {
    pub fn new(pool: PoolId) -> Arc<BufferShared> {
        Arc::new(BufferShared {
            state: AtomicU32::new(BUFFER_RUNNING),
            pool,
            abort_on_error: AtomicBool::new(false),
            pending_abort: AtomicUsize::new(usize::MAX),
        })
    }
}

/// Cloneable reference to a submitted command buffer
pub struct BufferHandle {
    pub(crate) shared: Arc<BufferShared>,
}

impl BufferHandle {
    /// Pool the buffer was submitted to
    pub fn owner_pool(&self) -> PoolId {
        self.shared.pool
    }

    /// Completion status, if the buffer already finished
    pub fn status(&self) -> Option<BufferStatus> {
        BufferStatus::from_state_word(self.shared.state.load(Ordering::Acquire))
    }

    /// Block until the buffer completes or aborts
    ///
    /// A task of the owning pool suspends cooperatively; any other
    /// caller sleeps on the state word directly.
    pub fn wait_on(&self) -> BufferStatus {
        let state = &self.shared.state;
        loop {
            let word = state.load(Ordering::Acquire);
            if let Some(status) = BufferStatus::from_state_word(word) {
                return status;
            }
            if word & BUFFER_HAS_WAITERS == 0
                && state
                    .compare_exchange(
                        word,
                        word | BUFFER_HAS_WAITERS,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
            {
                continue;
            }
            let expect = word | BUFFER_HAS_WAITERS;
            if self.is_same_pool_task() {
                crate::task::wait_on_address(state, expect, None);
            } else {
                futex::wait(state, expect, None);
            }
        }
    }

    fn is_same_pool_task(&self) -> bool {
        if !tls::in_task() {
            return false;
        }
        let worker = tls::current_worker();
        if worker.is_null() {
            return false;
        }
        let shared = unsafe { Worker::shared_of(worker) };
        shared.id == self.shared.pool
    }
}

impl Clone for BufferHandle {
    fn clone(&self) -> Self {
        BufferHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Per-entry processing state
pub(crate) struct EntrySlot {
    pub status: EntryStatus,
    /// Live tasks (or nested buffers) this entry is still waiting on
    pub remaining: usize,
}

/// Pool-internal state of a submitted buffer
pub(crate) struct BufferRecord {
    pub entries: Vec<Command>,
    pub cursor: usize,
    pub completed_index: usize,
    pub slots: Vec<EntrySlot>,

    pub selected_worker: Option<WorkerId>,
    pub class_index: usize,
    pub abort_on_error: bool,
    pub has_error: bool,

    pub enqueue_status: EnqueueStatus,
    pub shared: Arc<BufferShared>,
    /// Buffers of the same pool blocked on this one
    pub waiters: Vec<BufferKey>,
    /// Nested buffers report to (parent key, entry index)
    pub parent: Option<(BufferKey, usize)>,

    /// Spawn list size: tasks spawned and not yet completed
    pub live_tasks: usize,
    /// Resume index within a stack-blocked spawn entry
    pub next_batch: usize,
}

impl BufferRecord {
    pub fn new(
        buffer: CommandBuffer,
        shared: Arc<BufferShared>,
        default_class: usize,
        parent: Option<(BufferKey, usize)>,
    ) -> BufferRecord {
        let len = buffer.entries.len();
        let mut slots = Vec::with_capacity(len);
        for _ in 0..len {
            slots.push(EntrySlot {
                status: EntryStatus::NotProcessed,
                remaining: 0,
            });
        }
        BufferRecord {
            entries: buffer.entries,
            cursor: 0,
            completed_index: 0,
            slots,
            selected_worker: None,
            class_index: default_class,
            abort_on_error: false,
            has_error: false,
            enqueue_status: EnqueueStatus::WillProcess,
            shared,
            waiters: Vec::new(),
            parent,
            live_tasks: 0,
            next_batch: 0,
        }
    }

    /// Advance the completion watermark over consecutive processed slots
    pub fn progress_completed(&mut self) {
        while self.completed_index < self.slots.len()
            && self.slots[self.completed_index].status == EntryStatus::Processed
        {
            self.completed_index += 1;
        }
    }

    /// Every entry admitted and every slot settled
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.entries.len() && self.completed_index >= self.slots.len()
    }
}

/// Free-list arena of buffer records, owned by the pool loop
pub(crate) struct BufferArena {
    slots: Vec<Option<BufferRecord>>,
    free: Vec<BufferKey>,
}

impl BufferArena {
    pub fn new() -> BufferArena {
        BufferArena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, record: BufferRecord) -> BufferKey {
        if let Some(key) = self.free.pop() {
            debug_assert!(self.slots[key].is_none());
            self.slots[key] = Some(record);
            key
        } else {
            self.slots.push(Some(record));
            self.slots.len() - 1
        }
    }

    pub fn get(&self, key: BufferKey) -> Option<&BufferRecord> {
        self.slots.get(key).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, key: BufferKey) -> Option<&mut BufferRecord> {
        self.slots.get_mut(key).and_then(|s| s.as_mut())
    }

    pub fn remove(&mut self, key: BufferKey) -> Option<BufferRecord> {
        let record = self.slots.get_mut(key).and_then(|s| s.take());
        if record.is_some() {
            self.free.push(key);
        }
        record
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_encodes_entries_in_order() {
        let mut buf = CommandBuffer::new();
        buf.select_worker(2)
            .select_any_worker()
            .spawn_batch(5, |_| {});
        assert_eq!(buf.len(), 3);
        assert!(matches!(buf.entries[0], Command::SelectWorker(2)));
        assert!(matches!(buf.entries[1], Command::SelectAnyWorker));
        match &buf.entries[2] {
            Command::EnqueueTask(spec) => assert_eq!(spec.batch, 5),
            _ => panic!("expected task entry"),
        }
    }

    #[test]
    fn test_record_progress_watermark() {
        let mut buf = CommandBuffer::new();
        buf.spawn_task(|| {}).wait_barrier().spawn_task(|| {});
        let shared = BufferShared::new(PoolId::new(1));
        let mut record = BufferRecord::new(buf, shared, 0, None);
        assert!(!record.is_finished());

        record.slots[0].status = EntryStatus::Processed;
        record.slots[2].status = EntryStatus::Processed;
        record.progress_completed();
        assert_eq!(record.completed_index, 1);

        record.slots[1].status = EntryStatus::Processed;
        record.progress_completed();
        assert_eq!(record.completed_index, 3);

        record.cursor = 3;
        assert!(record.is_finished());
    }

    #[test]
    fn test_arena_recycles_keys() {
        let mut arena = BufferArena::new();
        let shared = BufferShared::new(PoolId::new(1));
        let a = arena.insert(BufferRecord::new(
            CommandBuffer::new(),
            Arc::clone(&shared),
            0,
            None,
        ));
        let b = arena.insert(BufferRecord::new(
            CommandBuffer::new(),
            Arc::clone(&shared),
            0,
            None,
        ));
        assert_ne!(a, b);
        assert!(arena.remove(a).is_some());
        assert!(arena.get(a).is_none());
        let c = arena.insert(BufferRecord::new(CommandBuffer::new(), shared, 0, None));
        assert_eq!(c, a);
        arena.remove(b);
        arena.remove(c);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_handle_status_tracks_state_word() {
        let shared = BufferShared::new(PoolId::new(3));
        let handle = BufferHandle {
            shared: Arc::clone(&shared),
        };
        assert_eq!(handle.status(), None);
        assert_eq!(handle.owner_pool(), PoolId::new(3));
        shared.state.store(
            BufferStatus::Completed.to_state_bits(),
            Ordering::Release,
        );
        assert_eq!(handle.status(), Some(BufferStatus::Completed));
    }
}
