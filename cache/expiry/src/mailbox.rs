//! The timer thread's inbox.
//!
//! Workers never touch the heap; they post objcores here and the timer
//! thread applies the pending transition. The queue is FIFO except that
//! dying objects jump to the head: a doomed object sitting in the heap is
//! wasted space and wasted wakeups, so kill notifications must not queue
//! behind a long insertion burst.
//!
//! The mailbox itself is a plain queue; the actor's mutex and condition
//! variable around it live with the engine.

use crate::objcore::ObjCore;
use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) struct Mailbox {
    queue: VecDeque<Arc<ObjCore>>,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Post an objcore. Dying objects are expedited to the head.
    pub(crate) fn post(&mut self, oc: Arc<ObjCore>) {
        debug_assert!(oc.is_off_lru(), "mailed objcore must be off the LRU");
        if oc.is_dying() {
            self.queue.push_front(oc);
        } else {
            self.queue.push_back(oc);
        }
    }

    /// Take the next objcore to process.
    pub(crate) fn take(&mut self) -> Option<Arc<ObjCore>> {
        self.queue.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}
