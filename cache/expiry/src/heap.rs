//! Timer heap: a binary min-heap keyed by absolute wake time.
//!
//! The heap is owned by the timer thread alone, so it needs no internal
//! locking. What it does need is an index write-back: every time an entry
//! moves, its new slot is stored into the objcore's `timer_idx`, so workers
//! (and the delete/reorder entry points) can find an object in the heap in
//! O(1). An objcore outside the heap carries the [`NOIDX`] sentinel.

use crate::objcore::{NOIDX, ObjCore};
use std::sync::Arc;

/// Min-heap of objcores ordered by `timer_when` (strict less-than).
///
/// Single-writer by construction: only the timer thread holds one.
pub(crate) struct TimerHeap {
    slots: Vec<Arc<ObjCore>>,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The objcore with the smallest wake time, if any.
    pub(crate) fn peek_root(&self) -> Option<&Arc<ObjCore>> {
        self.slots.first()
    }

    /// Insert an objcore and record its slot.
    pub(crate) fn insert(&mut self, oc: Arc<ObjCore>) {
        debug_assert_eq!(oc.timer_idx(), NOIDX, "objcore already heap-resident");
        let idx = self.slots.len() as u32;
        oc.set_timer_idx(idx);
        self.slots.push(oc);
        self.sift_up(idx);
    }

    /// Remove the objcore at `idx`, restoring heap order behind it.
    pub(crate) fn delete(&mut self, idx: u32) -> Arc<ObjCore> {
        let i = idx as usize;
        assert!(i < self.slots.len(), "heap delete out of range");

        let oc = self.slots.swap_remove(i);
        oc.set_timer_idx(NOIDX);

        // swap_remove moved the former tail into the hole; re-place it.
        if i < self.slots.len() {
            self.slots[i].set_timer_idx(idx);
            self.reorder(idx);
        }
        oc
    }

    /// Restore heap order after the key at `idx` changed.
    pub(crate) fn reorder(&mut self, idx: u32) {
        let pos = self.sift_up(idx);
        if pos == idx {
            self.sift_down(idx);
        }
    }

    #[inline]
    fn key(&self, i: u32) -> f64 {
        self.slots[i as usize].timer_when()
    }

    fn swap(&mut self, a: u32, b: u32) {
        self.slots.swap(a as usize, b as usize);
        self.slots[a as usize].set_timer_idx(a);
        self.slots[b as usize].set_timer_idx(b);
    }

    /// Bubble `idx` toward the root; returns the final position.
    fn sift_up(&mut self, mut idx: u32) -> u32 {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.key(idx) < self.key(parent) {
                self.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
        idx
    }

    /// Push `idx` toward the leaves.
    fn sift_down(&mut self, mut idx: u32) {
        let len = self.slots.len() as u32;
        loop {
            let left = idx * 2 + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < len && self.key(right) < self.key(left) {
                child = right;
            }
            if self.key(child) < self.key(idx) {
                self.swap(idx, child);
                idx = child;
            } else {
                break;
            }
        }
    }
}
