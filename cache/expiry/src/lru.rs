//! Per-domain recency lists.
//!
//! Each storage domain owns one [`Lru`]: a doubly-linked list of the
//! objcores currently eligible for recency eviction, least recent at the
//! head. Nodes live in a slab and link by slot index; the objcore keeps its
//! own slot in `lru_link`, valid only while `OFFLRU` is clear, so unlinking
//! is O(1) from either side.
//!
//! The two hot entry points never block: `touch` gives up when the list
//! mutex is contended (an imperfectly sorted list is cheaper than a
//! hotspot), and the nuke scan takes only try-locks on object heads.

use crate::objcore::{F_DYING, F_OFFLRU, NO_SLOT, ObjCore};
use parking_lot::{Mutex, MutexGuard};
use slab::Slab;
use std::sync::Arc;

/// Identifier of a storage domain registered with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainId(pub(crate) u32);

impl DomainId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

struct Node {
    prev: u32,
    next: u32,
    oc: Arc<ObjCore>,
}

/// One domain's recency list.
pub struct Lru {
    list: Mutex<LruList>,
    dontmove: bool,
}

impl Lru {
    pub(crate) fn new(dontmove: bool) -> Self {
        Self {
            list: Mutex::new(LruList {
                nodes: Slab::new(),
                head: NO_SLOT,
                tail: NO_SLOT,
                n_objcore: 0,
            }),
            dontmove,
        }
    }

    /// Does this domain skip recency reordering?
    ///
    /// Set for storage backends where LRU ordering buys nothing (e.g.
    /// persistent stores); `touch` is then a constant no-op.
    pub fn dontmove(&self) -> bool {
        self.dontmove
    }

    /// Number of objcores currently linked into the list.
    pub fn len(&self) -> usize {
        self.list.lock().nodes.len()
    }

    /// Is the list empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of objcores registered to this domain (linked or in flight).
    pub fn object_count(&self) -> u64 {
        self.list.lock().n_objcore
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LruList> {
        self.list.lock()
    }

    /// Move `oc` to the most-recent end, if that is cheap right now.
    ///
    /// Returns whether a move happened. Contention on the list mutex is a
    /// no-op rather than a stall, and an objcore that is off the list
    /// (already claimed by the timer thread or an eviction) stays put.
    pub(crate) fn touch(&self, oc: &ObjCore) -> bool {
        if self.dontmove {
            return false;
        }
        let Some(mut list) = self.list.try_lock() else {
            return false;
        };
        if oc.is_off_lru() {
            return false;
        }
        list.move_to_tail(oc);
        true
    }
}

pub(crate) struct LruList {
    nodes: Slab<Node>,
    head: u32,
    tail: u32,
    pub(crate) n_objcore: u64,
}

impl LruList {
    /// Append `oc` at the most-recent end and clear `OFFLRU`.
    pub(crate) fn link(&mut self, oc: &Arc<ObjCore>) {
        assert!(oc.is_off_lru(), "objcore is already on an LRU list");

        let slot = self.nodes.insert(Node {
            prev: self.tail,
            next: NO_SLOT,
            oc: Arc::clone(oc),
        }) as u32;

        if self.tail != NO_SLOT {
            self.nodes[self.tail as usize].next = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;

        oc.set_lru_link(slot);
        oc.clear_flags(F_OFFLRU);
    }

    /// Remove `oc` from wherever it is and set `OFFLRU`.
    pub(crate) fn unlink(&mut self, oc: &ObjCore) {
        assert!(!oc.is_off_lru(), "objcore is not on an LRU list");

        let slot = oc.lru_link();
        let node = self.nodes.remove(slot as usize);
        debug_assert!(std::ptr::eq(node.oc.as_ref(), oc));

        if node.prev != NO_SLOT {
            self.nodes[node.prev as usize].next = node.next;
        } else {
            self.head = node.next;
        }
        if node.next != NO_SLOT {
            self.nodes[node.next as usize].prev = node.prev;
        } else {
            self.tail = node.prev;
        }

        oc.set_lru_link(NO_SLOT);
        oc.set_flags(F_OFFLRU);
    }

    /// Detach `oc`'s node and reattach it at the tail. Flags are untouched.
    fn move_to_tail(&mut self, oc: &ObjCore) {
        let slot = oc.lru_link();
        if self.tail == slot {
            return;
        }

        let (prev, next) = {
            let node = &self.nodes[slot as usize];
            (node.prev, node.next)
        };
        if prev != NO_SLOT {
            self.nodes[prev as usize].next = next;
        } else {
            self.head = next;
        }
        // A non-tail node always has a successor.
        self.nodes[next as usize].prev = prev;

        let old_tail = self.tail;
        let node = &mut self.nodes[slot as usize];
        node.prev = old_tail;
        node.next = NO_SLOT;
        self.nodes[old_tail as usize].next = slot;
        self.tail = slot;
    }

    /// Find, claim, and unlink the least-recent evictable objcore.
    ///
    /// A candidate must not be busy, must be referenced only by the engine,
    /// and its object-head lock must be free right now; anything else is
    /// skipped rather than waited for. The claimed objcore comes back
    /// `DYING | OFFLRU` with an extra reference donated for the mail.
    pub(crate) fn nuke_candidate(&mut self) -> Option<Arc<ObjCore>> {
        let mut slot = self.head;
        while slot != NO_SLOT {
            let node = &self.nodes[slot as usize];
            let oc = Arc::clone(&node.oc);
            let next = node.next;

            debug_assert!(!oc.is_dying(), "dying objcore still linked");

            // Nuking releases nothing unless we can release the last
            // reference, and a busy object is still being filled.
            if oc.is_busy() || oc.refcnt() > 1 {
                slot = next;
                continue;
            }
            let Some(_head) = oc.try_lock_timers() else {
                slot = next;
                continue;
            };
            if oc.refcnt() == 1 {
                oc.set_flags(F_DYING);
                oc.add_ref();
                self.unlink(&oc);
                drop(_head);
                return Some(oc);
            }
            slot = next;
        }
        None
    }

    /// Transaction ids in list order, head first.
    #[cfg(test)]
    pub(crate) fn xids(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut slot = self.head;
        while slot != NO_SLOT {
            let node = &self.nodes[slot as usize];
            out.push(node.oc.xid());
            slot = node.next;
        }
        out
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::objcore::F_INSERT;

    fn oc(xid: u64) -> Arc<ObjCore> {
        let oc = ObjCore::new(xid, DomainId(0));
        oc.set_flags(F_OFFLRU);
        oc
    }

    #[test]
    fn test_link_unlink_order() {
        let lru = Lru::new(false);
        let a = oc(1);
        let b = oc(2);
        let c = oc(3);

        {
            let mut list = lru.lock();
            list.link(&a);
            list.link(&b);
            list.link(&c);
            assert_eq!(list.xids(), vec![1, 2, 3]);
        }
        assert!(!a.is_off_lru());
        assert_eq!(lru.len(), 3);

        {
            let mut list = lru.lock();
            list.unlink(&b);
            assert_eq!(list.xids(), vec![1, 3]);
        }
        assert!(b.is_off_lru());

        {
            let mut list = lru.lock();
            list.unlink(&a);
            list.unlink(&c);
            assert_eq!(list.xids(), Vec::<u64>::new());
        }
        assert!(lru.is_empty());
    }

    #[test]
    fn test_off_lru_tracks_membership() {
        let lru = Lru::new(false);
        let a = oc(1);

        assert!(a.is_off_lru());
        lru.lock().link(&a);
        assert!(!a.is_off_lru());
        lru.lock().unlink(&a);
        assert!(a.is_off_lru());
    }

    #[test]
    fn test_touch_moves_to_tail() {
        let lru = Lru::new(false);
        let a = oc(1);
        let b = oc(2);
        let c = oc(3);
        {
            let mut list = lru.lock();
            list.link(&a);
            list.link(&b);
            list.link(&c);
        }

        assert!(lru.touch(&a));
        assert_eq!(lru.lock().xids(), vec![2, 3, 1]);

        // Touching the tail is a move that changes nothing.
        assert!(lru.touch(&a));
        assert_eq!(lru.lock().xids(), vec![2, 3, 1]);
    }

    #[test]
    fn test_touch_dontmove_is_noop() {
        let lru = Lru::new(true);
        let a = oc(1);
        let b = oc(2);
        {
            let mut list = lru.lock();
            list.link(&a);
            list.link(&b);
        }

        assert!(!lru.touch(&a));
        assert_eq!(lru.lock().xids(), vec![1, 2]);
    }

    #[test]
    fn test_touch_backs_off_under_contention() {
        let lru = Lru::new(false);
        let a = oc(1);
        lru.lock().link(&a);

        let _held = lru.lock();
        assert!(!lru.touch(&a));
    }

    #[test]
    fn test_touch_skips_unlinked() {
        let lru = Lru::new(false);
        let a = oc(1);
        lru.lock().link(&a);
        lru.lock().unlink(&a);

        assert!(!lru.touch(&a));
    }

    #[test]
    fn test_nuke_takes_least_recent_eligible() {
        let lru = Lru::new(false);
        let a = oc(1);
        let b = oc(2);
        let c = oc(3);
        {
            let mut list = lru.lock();
            list.link(&a);
            list.link(&b);
            list.link(&c);
        }
        // Head-most object is pinned by a second reference.
        a.add_ref();

        let victim = lru.lock().nuke_candidate().unwrap();
        assert_eq!(victim.xid(), 2);
        assert!(victim.is_dying());
        assert!(victim.is_off_lru());
        // One reference donated for the mail.
        assert_eq!(victim.refcnt(), 2);
        assert_eq!(lru.lock().xids(), vec![1, 3]);
    }

    #[test]
    fn test_nuke_skips_busy_and_referenced() {
        let lru = Lru::new(false);
        let a = oc(1);
        let b = oc(2);
        a.set_busy();
        b.add_ref();
        {
            let mut list = lru.lock();
            list.link(&a);
            list.link(&b);
        }

        assert!(lru.lock().nuke_candidate().is_none());
        assert_eq!(lru.lock().xids(), vec![1, 2]);
    }

    #[test]
    fn test_nuke_skips_contended_object_head() {
        let lru = Lru::new(false);
        let a = oc(1);
        let b = oc(2);
        {
            let mut list = lru.lock();
            list.link(&a);
            list.link(&b);
        }

        // Someone is mutating a's timers; the scan must pass it over.
        let _head = a.timers();
        let victim = lru.lock().nuke_candidate().unwrap();
        assert_eq!(victim.xid(), 2);
    }

    #[test]
    fn test_pending_action_flags_survive_link() {
        // Flag bits other than OFFLRU pass through list operations intact.
        let lru = Lru::new(false);
        let a = oc(1);
        a.set_flags(F_INSERT);

        lru.lock().link(&a);
        assert!(a.has_flags(F_INSERT));
        lru.lock().unlink(&a);
        assert!(a.has_flags(F_INSERT));
    }
}
