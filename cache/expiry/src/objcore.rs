//! The always-resident object handle.
//!
//! An [`ObjCore`] is the minimal per-object state the expiry engine needs:
//! the lifetime timers, a flag word, a protocol reference count, and the
//! back-pointers into the two containers an object can occupy (the timer
//! heap and its domain's LRU list).
//!
//! `Arc<ObjCore>` keeps the memory alive; the `refcnt` field carries the
//! *protocol* references (who is entitled to the object). The timer thread
//! holds exactly one protocol reference while the object sits in its heap.

use crate::lru::DomainId;
use crate::sync::{AtomicU8, AtomicU32, AtomicU64, Ordering, fence};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Sentinel index meaning "not in the timer heap".
pub const NOIDX: u32 = u32::MAX;

/// Sentinel slot meaning "not linked into any LRU list".
pub(crate) const NO_SLOT: u32 = u32::MAX;

// Flag bits. OFFLRU is the container discriminator: set exactly when the
// object is not linked into its LRU list. INSERT/MOVE/DYING describe the
// pending mailbox action; DYING overrides the other two.
pub(crate) const F_BUSY: u8 = 0x01;
pub(crate) const F_OFFLRU: u8 = 0x02;
pub(crate) const F_INSERT: u8 = 0x04;
pub(crate) const F_MOVE: u8 = 0x08;
pub(crate) const F_DYING: u8 = 0x10;

/// Object lifetime timers, absolute wall-clock seconds.
///
/// The wake deadline is `t_origin + ttl + grace + keep`: after `ttl` the
/// object is stale, during `grace` it may still be served stale, during
/// `keep` it is retained for conditional revalidation. A negative deadline
/// is the kill signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timers {
    /// Time the response was generated at the origin.
    pub t_origin: f64,
    /// Freshness lifetime, seconds. `-1.0` means "not yet decided".
    pub ttl: f64,
    /// Post-TTL window in which the object may be served stale.
    pub grace: f64,
    /// Post-grace window in which the object is kept for revalidation.
    pub keep: f64,
}

impl Timers {
    /// Timers for a response generated at `t_origin`.
    pub fn new(t_origin: f64, ttl: f64, grace: f64, keep: f64) -> Self {
        Self {
            t_origin,
            ttl,
            grace,
            keep,
        }
    }

    /// Reset to the undecided state, used before a fetch fills them in.
    pub fn clear(&mut self) {
        self.ttl = -1.0;
        self.grace = 0.0;
        self.keep = 0.0;
        self.t_origin = 0.0;
    }

    /// Absolute time the timer thread should next examine the object.
    ///
    /// Never NaN; a negative value schedules the object for destruction.
    pub fn deadline(&self) -> f64 {
        let when = self.t_origin + self.ttl + self.grace + self.keep;
        assert!(when.is_finite(), "object deadline must be finite");
        when
    }

    /// Absolute time the object stops being fresh for a request.
    ///
    /// A request may carry its own TTL cap; when that cap is tighter than
    /// the object's it wins.
    pub fn effective_expiry(&self, req_ttl: Option<f64>) -> f64 {
        let mut r = self.ttl;
        if let Some(d) = req_ttl {
            if d > 0.0 && d < r {
                r = d;
            }
        }
        self.t_origin + r
    }
}

impl Default for Timers {
    fn default() -> Self {
        let mut t = Self::new(0.0, 0.0, 0.0, 0.0);
        t.clear();
        t
    }
}

/// Always-resident handle for one cached object.
pub struct ObjCore {
    xid: u64,
    domain: DomainId,
    flags: AtomicU8,
    refcnt: AtomicU32,
    /// Bit-cast f64: absolute wake time. Readable without the head lock.
    timer_when: AtomicU64,
    /// Slot in the timer heap, written back by the heap on every move.
    timer_idx: AtomicU32,
    /// Bit-cast f64: last LRU position update.
    last_lru: AtomicU64,
    /// Slot in the owning LRU's node arena, valid only while OFFLRU is clear.
    lru_link: AtomicU32,
    /// The object-head lock: guards the timers against concurrent mutation.
    timers: Mutex<Timers>,
}

impl ObjCore {
    /// Create a new objcore for `domain` with one protocol reference (the
    /// creator's).
    pub fn new(xid: u64, domain: DomainId) -> Arc<Self> {
        Arc::new(Self {
            xid,
            domain,
            flags: AtomicU8::new(0),
            refcnt: AtomicU32::new(1),
            timer_when: AtomicU64::new(0f64.to_bits()),
            timer_idx: AtomicU32::new(NOIDX),
            last_lru: AtomicU64::new(0f64.to_bits()),
            lru_link: AtomicU32::new(NO_SLOT),
            timers: Mutex::new(Timers::default()),
        })
    }

    /// Transaction id of the fetch that created the object, for kill logs.
    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// The storage domain this object belongs to.
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// Lock the object head and access the timers.
    pub fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock()
    }

    pub(crate) fn try_lock_timers(&self) -> Option<MutexGuard<'_, Timers>> {
        self.timers.try_lock()
    }

    /// Recompute the wake deadline from the current timers.
    pub fn deadline(&self) -> f64 {
        self.timers.lock().deadline()
    }

    // -- flags ----------------------------------------------------------

    #[inline]
    pub(crate) fn flag_bits(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_flags(&self, bits: u8) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn clear_flags(&self, bits: u8) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn has_flags(&self, bits: u8) -> bool {
        self.flag_bits() & bits != 0
    }

    /// Is a fetch currently writing this object?
    pub fn is_busy(&self) -> bool {
        self.has_flags(F_BUSY)
    }

    /// Has the object been scheduled for destruction?
    pub fn is_dying(&self) -> bool {
        self.has_flags(F_DYING)
    }

    /// Is the object currently unlinked from its LRU list?
    pub fn is_off_lru(&self) -> bool {
        self.has_flags(F_OFFLRU)
    }

    /// Mark the object busy: a fetch is filling it and it must not expire.
    pub fn set_busy(&self) {
        self.set_flags(F_BUSY);
    }

    /// Clear the busy mark once the fetch completes.
    pub fn clear_busy(&self) {
        self.clear_flags(F_BUSY);
    }

    // -- timer fields ---------------------------------------------------

    /// Absolute time the timer thread will next examine this object.
    pub fn timer_when(&self) -> f64 {
        f64::from_bits(self.timer_when.load(Ordering::Acquire))
    }

    pub(crate) fn set_timer_when(&self, when: f64) {
        self.timer_when.store(when.to_bits(), Ordering::Release);
    }

    /// Current slot in the timer heap, or [`NOIDX`] when not heap-resident.
    pub fn timer_idx(&self) -> u32 {
        self.timer_idx.load(Ordering::Acquire)
    }

    pub(crate) fn set_timer_idx(&self, idx: u32) {
        self.timer_idx.store(idx, Ordering::Release);
    }

    /// Time of the last LRU position update.
    pub fn last_lru(&self) -> f64 {
        f64::from_bits(self.last_lru.load(Ordering::Acquire))
    }

    pub(crate) fn set_last_lru(&self, now: f64) {
        self.last_lru.store(now.to_bits(), Ordering::Release);
    }

    pub(crate) fn lru_link(&self) -> u32 {
        self.lru_link.load(Ordering::Acquire)
    }

    pub(crate) fn set_lru_link(&self, slot: u32) {
        self.lru_link.store(slot, Ordering::Release);
    }

    // -- protocol references --------------------------------------------

    /// Current protocol reference count.
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Take a protocol reference.
    pub fn add_ref(&self) {
        let prev = self.refcnt.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "reference taken on a dead objcore");
    }

    /// Release a protocol reference. Returns `true` when this was the last
    /// one and the object must be torn down.
    #[must_use]
    pub fn drop_ref(&self) -> bool {
        let prev = self.refcnt.fetch_sub(1, Ordering::Release);
        assert!(prev > 0, "reference count underflow");
        if prev == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for ObjCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjCore")
            .field("xid", &self.xid)
            .field("domain", &self.domain)
            .field("flags", &self.flag_bits())
            .field("refcnt", &self.refcnt())
            .field("timer_when", &self.timer_when())
            .field("timer_idx", &self.timer_idx())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_timers_clear() {
        let mut t = Timers::new(100.0, 60.0, 10.0, 5.0);
        t.clear();
        assert_eq!(t.ttl, -1.0);
        assert_eq!(t.grace, 0.0);
        assert_eq!(t.keep, 0.0);
        assert_eq!(t.t_origin, 0.0);
    }

    #[test]
    fn test_timers_deadline() {
        let t = Timers::new(100.0, 60.0, 10.0, 5.0);
        assert_eq!(t.deadline(), 175.0);

        // Cleared timers signal destruction, not a future wake.
        assert_eq!(Timers::default().deadline(), -1.0);
    }

    #[test]
    fn test_effective_expiry_request_cap() {
        let t = Timers::new(100.0, 60.0, 10.0, 5.0);

        // No request cap: the object's own freshness.
        assert_eq!(t.effective_expiry(None), 160.0);

        // A tighter request cap wins.
        assert_eq!(t.effective_expiry(Some(30.0)), 130.0);

        // A looser or non-positive cap does not.
        assert_eq!(t.effective_expiry(Some(120.0)), 160.0);
        assert_eq!(t.effective_expiry(Some(0.0)), 160.0);
        assert_eq!(t.effective_expiry(Some(-5.0)), 160.0);
    }

    #[test]
    fn test_new_objcore_state() {
        let oc = ObjCore::new(7, DomainId(0));
        assert_eq!(oc.xid(), 7);
        assert_eq!(oc.refcnt(), 1);
        assert_eq!(oc.timer_idx(), NOIDX);
        assert!(!oc.is_busy());
        assert!(!oc.is_dying());
        assert!(!oc.is_off_lru());
    }

    #[test]
    fn test_flag_ops() {
        let oc = ObjCore::new(1, DomainId(0));

        oc.set_busy();
        assert!(oc.is_busy());
        oc.clear_busy();
        assert!(!oc.is_busy());

        oc.set_flags(F_OFFLRU | F_INSERT);
        assert!(oc.is_off_lru());
        assert!(oc.has_flags(F_INSERT));
        oc.clear_flags(F_INSERT);
        assert!(oc.is_off_lru());
        assert!(!oc.has_flags(F_INSERT));
    }

    #[test]
    fn test_reference_counting() {
        let oc = ObjCore::new(1, DomainId(0));
        oc.add_ref();
        assert_eq!(oc.refcnt(), 2);

        assert!(!oc.drop_ref());
        assert!(oc.drop_ref());
        assert_eq!(oc.refcnt(), 0);
    }

    #[test]
    fn test_timer_when_roundtrip() {
        let oc = ObjCore::new(1, DomainId(0));
        oc.set_timer_when(12345.678);
        assert_eq!(oc.timer_when(), 12345.678);

        oc.set_timer_when(-1.0);
        assert_eq!(oc.timer_when(), -1.0);
    }
}
