//! Worker pool and its event loop
//!
//! The pool is a single-threaded actor: one OS thread owns every command
//! buffer, the stack allocators, the timeout queue and the wait map, and
//! consumes three channels (worker messages, enqueue requests, a signal
//! doorbell) in a loop. Workers and external callers only ever touch the
//! shared channels, so none of the actor state needs locks.

use crate::channel::{MsgChannel, PushError, SignalChannel, SumTreeChannel, TaskQueue};
use crate::command::{
    BufferArena, BufferHandle, BufferKey, BufferRecord, BufferShared, Command, CommandBuffer,
};
use crate::config::PoolConfig;
use crate::futex::{self, WaitSource};
use crate::memory::alloc::{Allocation, StackAllocator};
use crate::task::Task;
use crate::tls;
use crate::worker::{self, Worker};
use fibra_core::state::BUFFER_HAS_WAITERS;
use fibra_core::{fdebug, ftrace, fwarn};
use fibra_core::{BufferStatus, EnqueueStatus, EntryError, EntryStatus, PoolId, PoolResult, TaskId, WorkerId};
use fibra_core::constants::CHANNEL_LOAD_FACTOR;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

/// Owning pointer to a task record, movable across threads
pub(crate) struct TaskRef(pub NonNull<Task>);

// Safety: exactly one queue or worker holds a TaskRef at any time
unsafe impl Send for TaskRef {}

/// Messages consumed by the pool loop
pub(crate) enum PoolMessage {
    /// Task finished or aborted; its stack is reclaimed here
    TaskDone { task: TaskRef, error: bool },
    /// Task skipped by a worker because its entry was abort-forwarded
    TaskCancelled { task: TaskRef },
    TaskYield {
        task: TaskRef,
    },
    TaskSleep {
        task: TaskRef,
        deadline: Instant,
    },
    TaskWait {
        task: TaskRef,
        addr: usize,
        expect: u32,
        deadline: Option<Instant>,
    },
    /// Wake waiters on an address; 0 means all
    Wake { addr: usize, max_waiters: usize },
}

pub(crate) struct EnqueueRequest {
    pub buffer: CommandBuffer,
    pub shared: Arc<BufferShared>,
}

/// State visible to workers, handles and the parking lot
pub(crate) struct PoolShared {
    pub id: PoolId,
    pub label: String,
    pub is_public: bool,
    pub worker_count: usize,
    /// Class sizes, ascending
    pub stack_sizes: Vec<usize>,

    pub global: SumTreeChannel<TaskRef>,
    pub queues: Vec<Arc<TaskQueue>>,
    pub messages: MsgChannel<PoolMessage>,
    pub requests: MsgChannel<EnqueueRequest>,
    pub signal: SignalChannel,

    pub live_tasks: AtomicUsize,
    pub live_buffers: AtomicUsize,

    loop_thread: OnceLock<ThreadId>,
    joined: AtomicBool,
}

impl PoolShared {
    /// Ask the loop to wake waiters on `addr`; safe from any thread
    pub fn post_wake(&self, addr: usize, max_waiters: usize) {
        let _ = self.messages.push(PoolMessage::Wake { addr, max_waiters });
    }

    pub fn accepts_requests(&self) -> bool {
        !self.requests.is_closed()
    }

    /// Stop accepting buffers; submitted work still runs to completion
    pub fn request_close(&self) {
        self.requests.close();
        self.signal.notify();
    }

    pub fn has_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    /// Whether the calling thread belongs to this pool (worker or loop)
    pub fn owns_current_thread(&self) -> bool {
        if self.loop_thread.get() == Some(&thread::current().id()) {
            return true;
        }
        let w = tls::current_worker();
        !w.is_null() && unsafe { Worker::shared_of(w) }.id == self.id
    }
}

/// Strong reference to a live pool
pub struct PoolHandle {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub shared: Arc<PoolShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Last reference: close gracefully and, unless we are on one of
        // the pool's own threads, wait for the loop to wind down
        self.shared.request_close();
        if !self.shared.owns_current_thread() {
            if let Some(handle) = self.thread.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}

impl PoolHandle {
    pub fn id(&self) -> PoolId {
        self.inner.shared.id
    }

    pub fn label(&self) -> &str {
        &self.inner.shared.label
    }

    pub fn worker_count(&self) -> usize {
        self.inner.shared.worker_count
    }

    /// Worker ids, in index order
    pub fn workers(&self) -> Vec<WorkerId> {
        (0..self.inner.shared.worker_count as u32)
            .map(WorkerId::new)
            .collect()
    }

    /// Available stack class sizes, ascending
    pub fn stack_sizes(&self) -> &[usize] {
        &self.inner.shared.stack_sizes
    }

    pub fn is_public(&self) -> bool {
        self.inner.shared.is_public
    }

    pub fn accepts_requests(&self) -> bool {
        self.inner.shared.accepts_requests()
    }

    pub fn request_close(&self) {
        self.inner.shared.request_close();
    }

    pub fn owns_current_thread(&self) -> bool {
        self.inner.shared.owns_current_thread()
    }

    /// Tasks currently alive in the pool
    pub fn live_tasks(&self) -> usize {
        self.inner.shared.live_tasks.load(Ordering::Acquire)
    }

    /// Submit a command buffer and get a completion handle
    pub fn enqueue(&self, buffer: CommandBuffer) -> PoolResult<BufferHandle> {
        let shared = BufferShared::new(self.id());
        let handle = BufferHandle {
            shared: Arc::clone(&shared),
        };
        self.inner
            .shared
            .requests
            .push(EnqueueRequest { buffer, shared })
            .map_err(|_| fibra_core::PoolError::PoolClosed)?;
        Ok(handle)
    }

    /// Submit a command buffer without keeping a handle
    pub fn enqueue_detached(&self, buffer: CommandBuffer) -> PoolResult<()> {
        self.enqueue(buffer).map(|_| ())
    }

    /// Block until the pool loop has exited and all workers joined
    ///
    /// Only returns early (false) when called from one of the pool's own
    /// threads. The loop exits once `request_close` was called and all
    /// submitted buffers finished.
    pub fn join(&self) -> bool {
        if self.inner.shared.owns_current_thread() {
            return false;
        }
        if let Some(handle) = self.inner.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        true
    }

    pub fn downgrade(&self) -> WeakPoolHandle {
        WeakPoolHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.inner.shared
    }
}

impl Clone for PoolHandle {
    fn clone(&self) -> Self {
        PoolHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning pool reference held by the registry
pub struct WeakPoolHandle {
    inner: Weak<PoolInner>,
}

impl WeakPoolHandle {
    pub fn upgrade(&self) -> Option<PoolHandle> {
        self.inner.upgrade().map(|inner| PoolHandle { inner })
    }
}

impl Clone for WeakPoolHandle {
    fn clone(&self) -> Self {
        WeakPoolHandle {
            inner: Weak::clone(&self.inner),
        }
    }
}

/// Build a pool: allocators, workers, and the event loop thread
pub(crate) fn spawn_pool(config: &PoolConfig, id: PoolId) -> PoolResult<PoolHandle> {
    config.validate()?;
    let (classes, default_class, worker_count) = config.normalized();

    // The channel must hold every live "any worker" task
    let budget: usize = classes.iter().map(|c| c.max_allocated).sum();
    let capacity = (worker_count * CHANNEL_LOAD_FACTOR).max(budget);

    let mut allocators = Vec::with_capacity(classes.len());
    for class in &classes {
        allocators.push(StackAllocator::new(class, worker_count)?);
    }

    let queues: Vec<Arc<TaskQueue>> = (0..worker_count).map(|_| Arc::new(TaskQueue::new())).collect();
    let shared = Arc::new(PoolShared {
        id,
        label: config.label.clone(),
        is_public: config.is_public,
        worker_count,
        stack_sizes: classes.iter().map(|c| c.size).collect(),
        global: SumTreeChannel::new(capacity),
        queues,
        messages: MsgChannel::new(),
        requests: MsgChannel::new(),
        signal: SignalChannel::new(),
        live_tasks: AtomicUsize::new(0),
        live_buffers: AtomicUsize::new(0),
        loop_thread: OnceLock::new(),
        joined: AtomicBool::new(false),
    });

    let mut workers = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
        let shared = Arc::clone(&shared);
        let queue = Arc::clone(&shared.queues[i]);
        let handle = thread::Builder::new()
            .name(format!("fibra-worker-{}", i))
            .spawn(move || worker::worker_main(shared, WorkerId::new(i as u32), queue))
            .map_err(|_| fibra_core::PoolError::InvalidConfig("failed to spawn worker thread"))?;
        workers.push(handle);
    }

    let state = PoolState {
        shared: Arc::clone(&shared),
        allocators,
        default_class,
        arena: BufferArena::new(),
        by_shared: HashMap::new(),
        process_list: VecDeque::new(),
        timeouts: BinaryHeap::new(),
        cancelled: HashSet::new(),
        next_timeout_handle: 1,
        wait_map: HashMap::new(),
        next_task_id: 1,
        workers,
    };
    let loop_handle = thread::Builder::new()
        .name(format!("fibra-pool-{}", id))
        .spawn(move || event_loop(state))
        .map_err(|_| fibra_core::PoolError::InvalidConfig("failed to spawn pool thread"))?;

    Ok(PoolHandle {
        inner: Arc::new(PoolInner {
            shared,
            thread: Mutex::new(Some(loop_handle)),
        }),
    })
}

// Timeout queue entries, min-heap by deadline with lazy cancellation

enum TimeoutKind {
    Sleep(TaskRef),
    Wait(TaskRef, usize),
}

struct TimeoutEntry {
    deadline: Instant,
    handle: u64,
    kind: TimeoutKind,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}
impl Eq for TimeoutEntry {}
impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse for a min-heap, tie-break on handle for determinism
        match other.deadline.cmp(&self.deadline) {
            std::cmp::Ordering::Equal => other.handle.cmp(&self.handle),
            ord => ord,
        }
    }
}

/// Event-loop private state; never leaves the loop thread
struct PoolState {
    shared: Arc<PoolShared>,
    allocators: Vec<StackAllocator>,
    default_class: usize,
    arena: BufferArena,
    /// Completion-word identity to arena key, for wait_handle entries
    by_shared: HashMap<usize, BufferKey>,
    process_list: VecDeque<BufferKey>,
    timeouts: BinaryHeap<TimeoutEntry>,
    cancelled: HashSet<u64>,
    next_timeout_handle: u64,
    /// Address to FIFO of waiting tasks
    wait_map: HashMap<usize, VecDeque<TaskRef>>,
    next_task_id: u64,
    workers: Vec<JoinHandle<()>>,
}

enum Progress {
    Advance,
    Block,
}

fn event_loop(mut state: PoolState) {
    let _ = state.shared.loop_thread.set(thread::current().id());
    fdebug!("pool {} loop started", state.shared.id);

    loop {
        drain_messages(&mut state);
        expire_timeouts(&mut state);
        drive_buffers(&mut state);

        if state.shared.requests.is_closed()
            && state.shared.requests.is_empty()
            && state.arena.is_empty()
        {
            break;
        }
        block_for_events(&mut state);
    }

    shutdown(state);
}

fn drain_messages(state: &mut PoolState) {
    loop {
        let mut any = false;
        while let Some(msg) = state.shared.messages.try_pop() {
            any = true;
            handle_message(state, msg);
        }
        while let Some(req) = state.shared.requests.try_pop() {
            any = true;
            admit_buffer(state, req.buffer, req.shared, None);
        }
        if !any {
            return;
        }
    }
}

fn admit_buffer(
    state: &mut PoolState,
    buffer: CommandBuffer,
    shared: Arc<BufferShared>,
    parent: Option<(BufferKey, usize)>,
) -> BufferKey {
    let shared_addr = Arc::as_ptr(&shared) as usize;
    let record = BufferRecord::new(buffer, shared, state.default_class, parent);
    let key = state.arena.insert(record);
    state.by_shared.insert(shared_addr, key);
    state.shared.live_buffers.fetch_add(1, Ordering::AcqRel);
    state.process_list.push_back(key);
    ftrace!("buffer {} admitted", key);
    key
}

fn handle_message(state: &mut PoolState, msg: PoolMessage) {
    match msg {
        PoolMessage::TaskDone { task, error } => on_task_done(state, task, error),
        PoolMessage::TaskCancelled { task } => on_task_cancelled(state, task),
        PoolMessage::TaskYield { task } => {
            let t = task.0.as_ptr();
            unsafe { cancel_timeout(state, t) };
            re_enqueue_task(state, task);
        }
        PoolMessage::TaskSleep { task, deadline } => {
            let t = task.0.as_ptr();
            let handle = push_timeout(state, deadline, TimeoutKind::Sleep(task));
            unsafe { (*t).timeout_handle = Some(handle) };
        }
        PoolMessage::TaskWait {
            task,
            addr,
            expect,
            deadline,
        } => on_task_wait(state, task, addr, expect, deadline),
        PoolMessage::Wake { addr, max_waiters } => wake_address(state, addr, max_waiters),
    }
}

fn on_task_done(state: &mut PoolState, task: TaskRef, error: bool) {
    let t = task.0.as_ptr();
    let (buffer_key, entry_index, class_index) =
        unsafe { ((*t).buffer, (*t).entry_index, (*t).class_index) };
    unsafe { cancel_timeout(state, t) };

    // Reclaim record and stack; the freed stack may unblock a buffer
    let stack = unsafe { Task::into_stack(task.0) };
    if let Some(stack) = stack {
        if let Some(waiter) = state.allocators[class_index].deallocate(stack) {
            unblock_buffer(state, waiter);
        }
    }
    state.shared.live_tasks.fetch_sub(1, Ordering::AcqRel);

    let Some(rec) = state.arena.get_mut(buffer_key) else {
        fwarn!("completion for dead buffer {}", buffer_key);
        return;
    };
    rec.live_tasks -= 1;
    let fully_admitted = rec.cursor > entry_index;
    let slot = &mut rec.slots[entry_index];
    debug_assert!(slot.remaining > 0);
    slot.remaining -= 1;
    // A spawn entry still blocked mid-batch keeps running status; the
    // resumed spawn settles it
    if slot.remaining == 0 && slot.status == EntryStatus::RunningTask && fully_admitted {
        slot.status = EntryStatus::Processed;
        rec.progress_completed();
    }

    if error {
        propagate_abort(state, buffer_key, entry_index);
    }
    maybe_unblock(state, buffer_key);
    maybe_finish(state, buffer_key);
}

/// A worker handed back a task it never ran (entry abort-forwarded)
fn on_task_cancelled(state: &mut PoolState, task: TaskRef) {
    let t = task.0.as_ptr();
    let (buffer_key, entry_index, batch_index, class_index) = unsafe {
        (
            (*t).buffer,
            (*t).entry_index,
            (*t).batch_index,
            (*t).class_index,
        )
    };
    unsafe { cancel_timeout(state, t) };

    let stack = unsafe { Task::into_stack(task.0) };
    if let Some(stack) = stack {
        if let Some(waiter) = state.allocators[class_index].deallocate(stack) {
            unblock_buffer(state, waiter);
        }
    }
    state.shared.live_tasks.fetch_sub(1, Ordering::AcqRel);

    let mut hook = None;
    if let Some(rec) = state.arena.get_mut(buffer_key) {
        rec.live_tasks -= 1;
        let fully_admitted = rec.cursor > entry_index;
        let slot = &mut rec.slots[entry_index];
        debug_assert!(slot.remaining > 0);
        slot.remaining -= 1;
        if slot.remaining == 0 && slot.status == EntryStatus::RunningTask && fully_admitted {
            slot.status = EntryStatus::Processed;
            rec.progress_completed();
        }
        if let Command::EnqueueTask(spec) = &rec.entries[entry_index] {
            hook = spec.on_abort.as_ref().map(Arc::clone);
        }
    }
    if let Some(hook) = hook {
        hook(batch_index);
    }
    maybe_unblock(state, buffer_key);
    maybe_finish(state, buffer_key);
}

fn on_task_wait(
    state: &mut PoolState,
    task: TaskRef,
    addr: usize,
    expect: u32,
    deadline: Option<Instant>,
) {
    let t = task.0.as_ptr();
    // Recheck the predicate now that we serialize with wake messages
    let current = unsafe { (*(addr as *const AtomicU32)).load(Ordering::Acquire) };
    if current != expect {
        unsafe { (*t).wait_timed_out = false };
        re_enqueue_task(state, task);
        return;
    }
    if deadline.is_some_and(|d| d <= Instant::now()) {
        unsafe { (*t).wait_timed_out = true };
        re_enqueue_task(state, task);
        return;
    }
    if let Some(d) = deadline {
        let addr_copy = addr;
        let task_copy = TaskRef(task.0);
        let handle = push_timeout(state, d, TimeoutKind::Wait(task_copy, addr_copy));
        unsafe { (*t).timeout_handle = Some(handle) };
    }
    state.wait_map.entry(addr).or_default().push_back(task);
}

fn wake_address(state: &mut PoolState, addr: usize, max_waiters: usize) {
    let budget = if max_waiters == 0 {
        usize::MAX
    } else {
        max_waiters
    };
    let mut to_wake = Vec::new();
    if let Some(bucket) = state.wait_map.get_mut(&addr) {
        while to_wake.len() < budget {
            match bucket.pop_front() {
                Some(task) => to_wake.push(task),
                None => break,
            }
        }
        if bucket.is_empty() {
            state.wait_map.remove(&addr);
        }
    }
    for task in to_wake {
        let t = task.0.as_ptr();
        unsafe {
            cancel_timeout(state, t);
            (*t).wait_timed_out = false;
        }
        re_enqueue_task(state, task);
    }
}

/// Hand a runnable task back to its worker (or the shared channel)
fn re_enqueue_task(state: &mut PoolState, task: TaskRef) {
    let t = task.0.as_ptr();
    unsafe {
        (*t).enqueued = true;
        match (*t).worker {
            Some(w) => state.shared.queues[w.as_usize()].push(task.0),
            None => {
                if let Err(PushError::Closed(_)) = state.shared.global.push(task) {
                    debug_assert!(false, "global channel closed with live tasks");
                }
            }
        }
    }
}

fn push_timeout(state: &mut PoolState, deadline: Instant, kind: TimeoutKind) -> u64 {
    let handle = state.next_timeout_handle;
    state.next_timeout_handle += 1;
    state.timeouts.push(TimeoutEntry {
        deadline,
        handle,
        kind,
    });
    handle
}

unsafe fn cancel_timeout(state: &mut PoolState, t: *mut Task) {
    if let Some(handle) = (*t).timeout_handle.take() {
        state.cancelled.insert(handle);
    }
}

fn expire_timeouts(state: &mut PoolState) {
    let now = Instant::now();
    while let Some(top) = state.timeouts.peek() {
        if top.deadline > now {
            break;
        }
        let entry = state.timeouts.pop().unwrap();
        if state.cancelled.remove(&entry.handle) {
            continue;
        }
        match entry.kind {
            TimeoutKind::Sleep(task) => {
                unsafe { (*task.0.as_ptr()).timeout_handle = None };
                re_enqueue_task(state, task);
            }
            TimeoutKind::Wait(task, addr) => {
                let t = task.0.as_ptr();
                if let Some(bucket) = state.wait_map.get_mut(&addr) {
                    bucket.retain(|r| r.0 != task.0);
                    if bucket.is_empty() {
                        state.wait_map.remove(&addr);
                    }
                }
                unsafe {
                    (*t).timeout_handle = None;
                    (*t).wait_timed_out = true;
                }
                re_enqueue_task(state, task);
            }
        }
    }
    if state.timeouts.is_empty() {
        state.cancelled.clear();
    }
}

fn drive_buffers(state: &mut PoolState) {
    while let Some(key) = state.process_list.pop_front() {
        process_buffer(state, key);
    }
}

fn process_buffer(state: &mut PoolState, key: BufferKey) {
    {
        let Some(rec) = state.arena.get_mut(key) else {
            // Retired while queued; the key may even name a successor
            // already processed this tick
            return;
        };
        if rec.enqueue_status != EnqueueStatus::WillProcess {
            return;
        }
        rec.enqueue_status = EnqueueStatus::Dequeued;
    }
    loop {
        let done = {
            let rec = state.arena.get(key).unwrap();
            rec.cursor >= rec.entries.len()
        };
        if done {
            break;
        }
        match process_entry(state, key) {
            Progress::Advance => continue,
            Progress::Block => {
                state.arena.get_mut(key).unwrap().enqueue_status = EnqueueStatus::Blocked;
                return;
            }
        }
    }
    maybe_finish(state, key);
}

/// Mark the current entry processed and move on
fn finish_entry(rec: &mut BufferRecord, index: usize) {
    rec.slots[index].status = EntryStatus::Processed;
    rec.cursor = index + 1;
    rec.progress_completed();
}

/// Abort the current entry in place and forward per policy
fn fail_entry(state: &mut PoolState, key: BufferKey, index: usize, err: EntryError) {
    fwarn!("buffer {} entry {}: {}", key, index, err);
    let rec = state.arena.get_mut(key).unwrap();
    finish_entry(rec, index);
    propagate_abort(state, key, index);
}

fn process_entry(state: &mut PoolState, key: BufferKey) -> Progress {
    let rec = state.arena.get_mut(key).unwrap();
    let index = rec.cursor;

    match &mut rec.entries[index] {
        Command::SetAbortOnError(enabled) => {
            let enabled = *enabled;
            rec.abort_on_error = enabled;
            rec.shared.abort_on_error.store(enabled, Ordering::Release);
            finish_entry(rec, index);
            Progress::Advance
        }
        Command::SetMinStackSize(size) => {
            let size = *size;
            // Classes are ascending: first one at least as large wins
            match state
                .shared
                .stack_sizes
                .iter()
                .position(|&s| s >= size)
            {
                Some(class) => {
                    rec.class_index = class;
                    finish_entry(rec, index);
                    Progress::Advance
                }
                None => {
                    fail_entry(state, key, index, EntryError::StackSizeUnsupported);
                    Progress::Advance
                }
            }
        }
        Command::SelectWorker(worker) => {
            let worker = *worker;
            if (worker as usize) < state.shared.worker_count {
                rec.selected_worker = Some(WorkerId::new(worker));
                finish_entry(rec, index);
                Progress::Advance
            } else {
                fail_entry(state, key, index, EntryError::WorkerOutOfRange);
                Progress::Advance
            }
        }
        Command::SelectAnyWorker => {
            rec.selected_worker = None;
            finish_entry(rec, index);
            Progress::Advance
        }
        Command::EnqueueTask(spec) => {
            let run = Arc::clone(&spec.run);
            let batch = spec.batch;
            let class_index = rec.class_index;
            let selected = rec.selected_worker;
            process_spawn(state, key, index, run, batch, class_index, selected)
        }
        Command::EnqueueBuffer(sub) => {
            let Some(sub) = sub.take() else {
                fail_entry(state, key, index, EntryError::NestedBufferFailed);
                return Progress::Advance;
            };
            rec.slots[index].status = EntryStatus::RunningBuffer;
            rec.slots[index].remaining = 1;
            rec.cursor = index + 1;
            let shared = BufferShared::new(state.shared.id);
            admit_buffer(state, sub, shared, Some((key, index)));
            Progress::Advance
        }
        Command::WaitBarrier => {
            if rec.live_tasks == 0 {
                finish_entry(rec, index);
                Progress::Advance
            } else {
                Progress::Block
            }
        }
        Command::WaitCommand(offset) => {
            let offset = *offset;
            if offset == 0 || offset > index {
                fail_entry(state, key, index, EntryError::BadWaitOffset);
                return Progress::Advance;
            }
            if rec.slots[index - offset].status == EntryStatus::Processed {
                finish_entry(rec, index);
                Progress::Advance
            } else {
                Progress::Block
            }
        }
        Command::WaitHandle(handle) => {
            if handle.owner_pool() != state.shared.id {
                fail_entry(state, key, index, EntryError::ForeignHandle);
                return Progress::Advance;
            }
            if handle.status().is_some() {
                finish_entry(rec, index);
                return Progress::Advance;
            }
            let target_addr = Arc::as_ptr(&handle.shared) as usize;
            match state.by_shared.get(&target_addr).copied() {
                Some(target_key) => {
                    state.arena.get_mut(target_key).unwrap().waiters.push(key);
                    Progress::Block
                }
                // Completed between the status check and here
                None => {
                    let rec = state.arena.get_mut(key).unwrap();
                    finish_entry(rec, index);
                    Progress::Advance
                }
            }
        }
    }
}

/// Spawn (part of) a task batch; blocks on stack pressure and resumes
/// from `next_batch` when a stack frees up
fn process_spawn(
    state: &mut PoolState,
    key: BufferKey,
    index: usize,
    run: crate::task::TaskFn,
    batch: usize,
    class_index: usize,
    selected: Option<WorkerId>,
) -> Progress {
    loop {
        let next = state.arena.get(key).unwrap().next_batch;
        if next >= batch {
            break;
        }
        match state.allocators[class_index].allocate() {
            Allocation::Stack(stack) => {
                let id = TaskId::new(state.next_task_id);
                state.next_task_id += 1;
                let buffer_shared = Arc::clone(&state.arena.get(key).unwrap().shared);
                let task = Task::new(
                    id,
                    key,
                    index,
                    next,
                    buffer_shared,
                    Arc::clone(&run),
                    stack,
                    class_index,
                    selected,
                );
                unsafe { (*task.as_ptr()).enqueued = true };

                let rec = state.arena.get_mut(key).unwrap();
                rec.live_tasks += 1;
                rec.slots[index].status = EntryStatus::RunningTask;
                rec.slots[index].remaining += 1;
                rec.next_batch = next + 1;
                state.shared.live_tasks.fetch_add(1, Ordering::AcqRel);

                match selected {
                    Some(w) => state.shared.queues[w.as_usize()].push(task),
                    None => {
                        if let Err(PushError::Closed(_)) =
                            state.shared.global.push(TaskRef(task))
                        {
                            debug_assert!(false, "global channel closed during spawn");
                        }
                    }
                }
            }
            Allocation::Blocked => {
                state.allocators[class_index].enqueue_waiter(key);
                return Progress::Block;
            }
            Allocation::OutOfMemory => {
                fwarn!("buffer {} entry {}: stack allocation failed", key, index);
                let rec = state.arena.get_mut(key).unwrap();
                rec.next_batch = 0;
                if rec.slots[index].remaining == 0 {
                    rec.slots[index].status = EntryStatus::Processed;
                }
                rec.cursor = index + 1;
                rec.progress_completed();
                propagate_abort(state, key, index);
                return Progress::Advance;
            }
        }
    }
    let rec = state.arena.get_mut(key).unwrap();
    rec.next_batch = 0;
    if rec.slots[index].remaining == 0 {
        // Zero-width batch
        rec.slots[index].status = EntryStatus::Processed;
    }
    rec.cursor = index + 1;
    rec.progress_completed();
    Progress::Advance
}

/// Forward an error at `error_index` through the abort policy
///
/// The policy consulted is the one currently in force: a switch-off
/// admitted after the failing entry shields the rest of the buffer.
/// Entries already running keep running (their queued tasks drain as
/// cancelled through the shared `pending_abort` mark); entries not yet
/// admitted are aborted in place up to a switch-off or the end.
fn propagate_abort(state: &mut PoolState, key: BufferKey, error_index: usize) {
    let rec = state.arena.get_mut(key).unwrap();
    if !rec.abort_on_error {
        return;
    }
    rec.has_error = true;
    rec.shared
        .pending_abort
        .fetch_min(error_index, Ordering::AcqRel);

    // Abort everything not yet admitted, up to a switch-off or the end
    let mut hooks: Vec<(crate::task::AbortFn, usize)> = Vec::new();
    let cursor_before = rec.cursor;
    let mut i = rec.cursor;
    while i < rec.entries.len() {
        if let Command::SetAbortOnError(false) = rec.entries[i] {
            rec.abort_on_error = false;
            rec.shared.abort_on_error.store(false, Ordering::Release);
            rec.slots[i].status = EntryStatus::Processed;
            i += 1;
            break;
        }
        if let Command::EnqueueTask(spec) = &rec.entries[i] {
            if let Some(hook) = &spec.on_abort {
                // A spawn entry interrupted mid-batch already issued
                // tasks for the first `next_batch` indices
                let start = if i == rec.cursor { rec.next_batch } else { 0 };
                for b in start..spec.batch {
                    hooks.push((Arc::clone(hook), b));
                }
            }
        }
        rec.slots[i].status = EntryStatus::Processed;
        i += 1;
    }
    rec.cursor = i;
    rec.next_batch = 0;
    rec.progress_completed();
    let was_blocked = rec.enqueue_status == EnqueueStatus::Blocked;
    fdebug!("buffer {} aborted forward to entry {}", key, i);

    for (hook, batch_index) in hooks {
        hook(batch_index);
    }

    // The entry the buffer was blocked on may just have been aborted;
    // put it back on the process list so the tail runs
    if was_blocked && i > cursor_before {
        unblock_buffer(state, key);
    }
}

/// Re-add a blocked buffer to the process list
fn unblock_buffer(state: &mut PoolState, key: BufferKey) {
    let Some(rec) = state.arena.get_mut(key) else {
        return;
    };
    if rec.enqueue_status == EnqueueStatus::WillProcess {
        return;
    }
    rec.enqueue_status = EnqueueStatus::WillProcess;
    state.process_list.push_back(key);
}

/// Check whether a blocked buffer's wait condition cleared
fn maybe_unblock(state: &mut PoolState, key: BufferKey) {
    let Some(rec) = state.arena.get(key) else {
        return;
    };
    if rec.enqueue_status != EnqueueStatus::Blocked || rec.cursor >= rec.entries.len() {
        return;
    }
    let satisfied = match &rec.entries[rec.cursor] {
        Command::WaitBarrier => rec.live_tasks == 0,
        Command::WaitCommand(offset) => rec
            .cursor
            .checked_sub(*offset)
            .map(|t| rec.slots[t].status == EntryStatus::Processed)
            .unwrap_or(true),
        Command::WaitHandle(handle) => handle.status().is_some(),
        // Stack-blocked spawns are unblocked by the allocator directly
        _ => false,
    };
    if satisfied {
        unblock_buffer(state, key);
    }
}

/// Retire a buffer whose entries are all processed
fn maybe_finish(state: &mut PoolState, key: BufferKey) {
    let finished = state
        .arena
        .get(key)
        .map(|rec| rec.is_finished())
        .unwrap_or(false);
    if !finished {
        return;
    }
    let record = state.arena.remove(key).unwrap();
    state
        .by_shared
        .remove(&(Arc::as_ptr(&record.shared) as usize));
    state.shared.live_buffers.fetch_sub(1, Ordering::AcqRel);

    // A stack-waiter slot may still reference us
    for alloc in state.allocators.iter_mut() {
        alloc.remove_waiter(key);
    }

    let status = if record.has_error {
        BufferStatus::Aborted
    } else {
        BufferStatus::Completed
    };
    fdebug!("buffer {} finished: {:?}", key, status);

    // Publish and wake external waiters (threads on the futex word,
    // same-pool tasks through the wait map)
    let state_word = &record.shared.state;
    let old = state_word.swap(status.to_state_bits(), Ordering::AcqRel);
    if old & BUFFER_HAS_WAITERS != 0 {
        futex::wake(state_word, i32::MAX);
    }
    wake_address(state, state_word.as_ptr() as usize, 0);

    // Buffers of this pool blocked on us
    for waiter in &record.waiters {
        maybe_unblock(state, *waiter);
    }

    // Tell the parent its nested-buffer entry settled
    if let Some((parent_key, parent_entry)) = record.parent {
        let mut parent_known = false;
        if let Some(parent) = state.arena.get_mut(parent_key) {
            let slot = &mut parent.slots[parent_entry];
            debug_assert!(slot.remaining == 1);
            slot.remaining = 0;
            slot.status = EntryStatus::Processed;
            parent.progress_completed();
            parent_known = true;
        }
        if parent_known {
            if status == BufferStatus::Aborted {
                propagate_abort(state, parent_key, parent_entry);
            }
            maybe_unblock(state, parent_key);
            maybe_finish(state, parent_key);
        }
    }
}

/// Sleep until a message, request, signal or the nearest timeout
fn block_for_events(state: &mut PoolState) {
    // Lazily discard cancelled heads so the deadline is real
    while let Some(top) = state.timeouts.peek() {
        if state.cancelled.remove(&top.handle) {
            state.timeouts.pop();
        } else {
            break;
        }
    }
    let deadline = state.timeouts.peek().map(|e| e.deadline);

    let messages = &state.shared.messages;
    let requests = &state.shared.requests;
    let signal = &state.shared.signal;

    let m = messages.prepare_wait();
    let r = requests.prepare_wait();
    let s = signal.prepare_wait();
    if messages.is_empty() && requests.is_empty() {
        let sources = [
            WaitSource {
                word: messages.wait_word(),
                expected: m,
            },
            WaitSource {
                word: requests.wait_word(),
                expected: r,
            },
            WaitSource {
                word: signal.wait_word(),
                expected: s,
            },
        ];
        futex::wait_multiple(&sources, deadline);
    }
    messages.cancel_wait();
    requests.cancel_wait();
    signal.cancel_wait();
}

/// Close the task channels, join the workers, release everything
fn shutdown(state: PoolState) {
    debug_assert!(state.arena.is_empty());
    state.shared.global.close();
    for queue in &state.shared.queues {
        queue.close();
    }
    for handle in state.workers {
        let _ = handle.join();
    }
    state.shared.messages.close();
    // Cached stacks unmap when the allocators drop
    state.shared.joined.store(true, Ordering::Release);
    fdebug!("pool {} loop exited", state.shared.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackClassConfig;
    use crate::task;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    static TEST_POOL_SEQ: AtomicU64 = AtomicU64::new(0x1000);

    fn test_pool(config: PoolConfig) -> PoolHandle {
        let id = PoolId::new(TEST_POOL_SEQ.fetch_add(1, Ordering::Relaxed));
        spawn_pool(&config, id).unwrap()
    }

    fn stack_class(max_allocated: usize) -> StackClassConfig {
        StackClassConfig {
            size: 64 * 1024,
            preallocated: 0,
            cold: 1,
            hot: 1,
            max_allocated,
        }
    }

    fn two_worker_pool() -> PoolHandle {
        test_pool(
            PoolConfig::new()
                .worker_count(2)
                .stacks(vec![stack_class(16)]),
        )
    }

    #[test]
    fn test_single_task_completes() {
        let pool = test_pool(
            PoolConfig::new().worker_count(2).stacks(vec![StackClassConfig {
                size: 64 * 1024,
                preallocated: 2,
                cold: 0,
                hot: 2,
                max_allocated: 4,
            }]),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let mut buf = CommandBuffer::new();
        buf.spawn_task(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        pool.request_close();
        pool.join();
        // No lost tasks: everything spawned was accounted for
        assert_eq!(pool.live_tasks(), 0);
    }

    #[test]
    fn test_barrier_orders_batches() {
        let pool = two_worker_pool();
        let shared = Arc::new(AtomicUsize::new(0));
        let seen_at_check = Arc::new(AtomicUsize::new(usize::MAX));

        let (s1, s2) = (Arc::clone(&shared), Arc::clone(&shared));
        let seen = Arc::clone(&seen_at_check);
        let mut buf = CommandBuffer::new();
        buf.spawn_batch(10, move |_| {
            s1.fetch_add(1, Ordering::SeqCst);
        })
        .wait_barrier()
        .spawn_task(move || {
            seen.store(s2.load(Ordering::SeqCst), Ordering::SeqCst);
        });

        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        assert_eq!(seen_at_check.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_abort_forwards_over_later_entries() {
        let pool = two_worker_pool();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let mut buf = CommandBuffer::new();
        // Pinning both tasks to one worker makes the ordering exact:
        // the aborting task runs first and marks the buffer before the
        // second task is fetched
        buf.select_worker(0)
            .set_abort_on_error(true)
            .spawn_task(|| task::abort())
            .spawn_task(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .wait_barrier();

        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Aborted);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abort_hook_runs_for_skipped_entries() {
        let pool = two_worker_pool();
        let aborted = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&aborted);

        let mut buf = CommandBuffer::new();
        buf.select_worker(0)
            .set_abort_on_error(true)
            .spawn_task(|| task::abort())
            .wait_barrier()
            .spawn_batch_with_abort(3, |_| {}, move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            });

        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Aborted);
        assert_eq!(aborted.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_abort_shield_switches_policy_off() {
        let pool = two_worker_pool();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let mut buf = CommandBuffer::new();
        buf.select_worker(0)
            .set_abort_on_error(true)
            .spawn_task(|| task::abort())
            .wait_barrier()
            .set_abort_on_error(false)
            .spawn_task(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });

        let handle = pool.enqueue(buf).unwrap();
        // The buffer still aborts, but the shielded tail ran
        assert_eq!(handle.wait_on(), BufferStatus::Aborted);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_and_wake_on_value() {
        let pool = two_worker_pool();
        let value = Arc::new(AtomicU32::new(0));
        let ok = Arc::new(AtomicUsize::new(0));

        let (v1, v2) = (Arc::clone(&value), Arc::clone(&value));
        let ok1 = Arc::clone(&ok);
        let mut buf = CommandBuffer::new();
        buf.spawn_task(move || {
            task::wait(&v1, 0);
            if v1.load(Ordering::Acquire) == 1 {
                ok1.fetch_add(1, Ordering::SeqCst);
            }
        })
        .spawn_task(move || {
            // Give the waiter a chance to park first
            task::sleep(Duration::from_millis(10));
            v2.store(1, Ordering::Release);
            task::wake(&v2, 1);
        });

        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timed_wait_expires() {
        let pool = two_worker_pool();
        let value = Arc::new(AtomicU32::new(0));
        let timed_out = Arc::new(AtomicUsize::new(0));

        let v = Arc::clone(&value);
        let t = Arc::clone(&timed_out);
        let mut buf = CommandBuffer::new();
        buf.spawn_task(move || {
            let start = Instant::now();
            let woken = task::timed_wait(&v, 0, Duration::from_millis(40));
            if !woken && start.elapsed() >= Duration::from_millis(40) {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });

        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sleep_delays_completion() {
        let pool = two_worker_pool();
        let mut buf = CommandBuffer::new();
        buf.spawn_task(|| task::sleep(Duration::from_millis(50)));
        let start = Instant::now();
        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_stack_pressure_serializes() {
        let pool = test_pool(PoolConfig::new().worker_count(2).stacks(vec![
            StackClassConfig {
                size: 64 * 1024,
                preallocated: 0,
                cold: 0,
                hot: 1,
                max_allocated: 1,
            },
        ]));
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let mut buf = CommandBuffer::new();
        buf.spawn_batch(3, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_worker_affinity_pinned_and_sticky() {
        let pool = two_worker_pool();
        let threads = Arc::new(std::sync::Mutex::new(Vec::new()));

        // Pinned batch: every run lands on worker 1
        let t1 = Arc::clone(&threads);
        let mut buf = CommandBuffer::new();
        buf.select_worker(1).spawn_batch(4, move |_| {
            t1.lock().unwrap().push(std::thread::current().id());
        });
        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        let pinned = threads.lock().unwrap();
        assert_eq!(pinned.len(), 4);
        assert!(pinned.iter().all(|t| *t == pinned[0]));
        drop(pinned);

        // Sticky binding: a yielding task resumes on its first worker
        let per_resume = Arc::new(std::sync::Mutex::new(Vec::new()));
        let p = Arc::clone(&per_resume);
        let mut buf = CommandBuffer::new();
        buf.spawn_task(move || {
            for _ in 0..8 {
                p.lock().unwrap().push(std::thread::current().id());
                task::yield_now();
            }
        });
        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        let resumes = per_resume.lock().unwrap();
        assert_eq!(resumes.len(), 8);
        assert!(resumes.iter().all(|t| *t == resumes[0]));
    }

    #[test]
    fn test_task_locals_run_dtors() {
        static LOCAL_KEY: u8 = 0;
        static LOCAL_DROPS: AtomicUsize = AtomicUsize::new(0);
        unsafe fn count_drop(_v: *mut ()) {
            LOCAL_DROPS.fetch_add(1, Ordering::SeqCst);
        }

        let pool = two_worker_pool();
        let read_back = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&read_back);
        let mut buf = CommandBuffer::new();
        buf.spawn_task(move || {
            let key = &LOCAL_KEY as *const u8 as usize;
            unsafe {
                task::task_local_set(key, 7 as *mut (), Some(count_drop));
            }
            if task::task_local_get(key) == Some(7 as *mut ()) {
                r.store(1, Ordering::SeqCst);
            }
        });
        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        assert_eq!(read_back.load(Ordering::SeqCst), 1);
        assert_eq!(LOCAL_DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_command_sees_previous_entry() {
        let pool = two_worker_pool();
        let flag = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(0));

        let f1 = Arc::clone(&flag);
        let f2 = Arc::clone(&flag);
        let o = Arc::clone(&observed);
        let mut buf = CommandBuffer::new();
        buf.spawn_task(move || {
            f1.store(5, Ordering::SeqCst);
        })
        .wait_command(1)
        .spawn_task(move || {
            o.store(f2.load(Ordering::SeqCst), Ordering::SeqCst);
        });

        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        assert_eq!(observed.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_nested_buffer_completes_parent() {
        let pool = two_worker_pool();
        let counter = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let mut child = CommandBuffer::new();
        child.spawn_batch(3, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let c2 = Arc::clone(&counter);
        let o = Arc::clone(&observed);
        let mut parent = CommandBuffer::new();
        parent
            .enqueue_buffer(child)
            .wait_command(1)
            .spawn_task(move || {
                o.store(c2.load(Ordering::SeqCst), Ordering::SeqCst);
            });

        let handle = pool.enqueue(parent).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        assert_eq!(observed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_nested_abort_reaches_parent() {
        let pool = two_worker_pool();
        let mut child = CommandBuffer::new();
        child.set_abort_on_error(true).spawn_task(|| task::abort());

        let mut parent = CommandBuffer::new();
        parent
            .set_abort_on_error(true)
            .enqueue_buffer(child)
            .wait_command(1);

        let handle = pool.enqueue(parent).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Aborted);
    }

    #[test]
    fn test_wait_handle_across_buffers() {
        let pool = two_worker_pool();
        let flag = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&flag);
        let mut first = CommandBuffer::new();
        first.spawn_task(move || {
            task::sleep(Duration::from_millis(20));
            f.store(9, Ordering::SeqCst);
        });
        let first_handle = pool.enqueue(first).unwrap();

        let f2 = Arc::clone(&flag);
        let o = Arc::clone(&observed);
        let mut second = CommandBuffer::new();
        second.wait_handle(first_handle).spawn_task(move || {
            o.store(f2.load(Ordering::SeqCst), Ordering::SeqCst);
        });

        let handle = pool.enqueue(second).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
        assert_eq!(observed.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_zero_batch_is_noop() {
        let pool = two_worker_pool();
        let mut buf = CommandBuffer::new();
        buf.spawn_batch(0, |_| {}).wait_barrier();
        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Completed);
    }

    #[test]
    fn test_closed_pool_rejects_enqueue() {
        let pool = two_worker_pool();
        assert!(pool.accepts_requests());
        pool.request_close();
        assert!(!pool.accepts_requests());
        let mut buf = CommandBuffer::new();
        buf.spawn_task(|| {});
        assert!(matches!(
            pool.enqueue(buf),
            Err(fibra_core::PoolError::PoolClosed)
        ));
        pool.join();
    }

    #[test]
    fn test_invalid_worker_entry_aborts_buffer() {
        let pool = two_worker_pool();
        let mut buf = CommandBuffer::new();
        buf.set_abort_on_error(true)
            .select_worker(99)
            .spawn_task(|| {});
        let handle = pool.enqueue(buf).unwrap();
        assert_eq!(handle.wait_on(), BufferStatus::Aborted);
    }

    #[test]
    fn test_many_tasks_none_lost() {
        let pool = test_pool(
            PoolConfig::new()
                .worker_count(4)
                .stacks(vec![stack_class(64)]),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&counter);
            let mut buf = CommandBuffer::new();
            buf.spawn_batch(50, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
            handles.push(pool.enqueue(buf).unwrap());
        }
        for h in handles {
            assert_eq!(h.wait_on(), BufferStatus::Completed);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8 * 50);
        pool.request_close();
        pool.join();
        assert_eq!(pool.live_tasks(), 0);
    }
}
