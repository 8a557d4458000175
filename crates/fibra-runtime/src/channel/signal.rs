//! Signal channel
//!
//! A bare doorbell with no payload: `notify` nudges a consumer blocked in
//! a multi-channel wait. The pool loop includes one of these so that
//! state changes with no message of their own (like `request_close`) can
//! interrupt its sleep.

use super::EventWord;
use std::sync::atomic::AtomicU32;

pub struct SignalChannel {
    event: EventWord,
}

impl SignalChannel {
    pub fn new() -> Self {
        SignalChannel {
            event: EventWord::new(),
        }
    }

    /// Ring the doorbell
    pub fn notify(&self) {
        self.event.bump();
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

impl Default for SignalChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::futex::{self, WaitOutcome, WaitSource};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_notify_invalidates_snapshot() {
        let sig = SignalChannel::new();
        let snap = sig.prepare_wait();
        sig.notify();
        assert_ne!(sig.wait_word().load(Ordering::Acquire), snap);
        let src = [WaitSource {
            word: sig.wait_word(),
            expected: snap,
        }];
        assert_eq!(futex::wait_multiple(&src, None), WaitOutcome::Ready(0));
    }
}
