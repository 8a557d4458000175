//! MPSC message channel
//!
//! Carries pool messages from workers (and wakers anywhere in the
//! process) to the single pool event loop, and enqueue requests from
//! callers to the same loop. Storage is a lock-free `SegQueue`; the
//! event word makes the channel blockable and closable.

use super::EventWord;
use crossbeam_queue::SegQueue;
use std::sync::atomic::AtomicU32;

pub struct MsgChannel<T> {
    queue: SegQueue<T>,
    event: EventWord,
}

impl<T> MsgChannel<T> {
    pub fn new() -> Self {
        MsgChannel {
            queue: SegQueue::new(),
            event: EventWord::new(),
        }
    }

    /// Push a message; fails with the message once the channel is closed
    pub fn push(&self, value: T) -> Result<(), T> {
        if self.event.is_closed() {
            return Err(value);
        }
        self.queue.push(value);
        self.event.bump();
        Ok(())
    }

    /// Consumer-side non-blocking pop
    pub fn try_pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Stop accepting messages and wake the consumer
    ///
    /// Messages already queued stay poppable; the consumer drains them
    /// before acting on the closed state.
    pub fn close(&self) {
        self.event.close();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.event.is_closed()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Snapshot the event word ahead of a blocking wait
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

impl<T> Default for MsgChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}
