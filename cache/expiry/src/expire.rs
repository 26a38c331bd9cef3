//! The expiry engine: public operations and the timer thread.
//!
//! # Architecture
//!
//! ```text
//!  worker threads                          timer thread ("cache-expiry")
//!  --------------                         -----------------------------
//!  insert/inject ---+
//!  rearm -----------+--> [ mailbox ] ---> drain --> +-- link/unlink LRU
//!  nuke_one --------+      (FIFO,                   +-- insert/reorder/
//!  touch --> LRU only      dying first)             |   delete timer heap
//!                                                   +-- fire expiries
//! ```
//!
//! Workers mutate LRU lists under per-domain mutexes and post every other
//! state transition to the mailbox; the timer thread is the only agent that
//! touches the heap. An objcore occupies at most one of two containers (its
//! domain's LRU list or the mailbox), with `OFFLRU` discriminating, and the
//! timer thread holds one protocol reference for as long as the object is
//! scheduled.
//!
//! Races between a due expiry and a concurrent rearm/nuke are resolved by
//! whoever wins the LRU mutex: the loser observes `OFFLRU` and backs off,
//! leaving the pending mail to finish the job.

use crate::backend::{NoopBackend, ObjectBackend};
use crate::clock::{Clock, WallClock};
use crate::error::{ExpiryError, ExpiryResult};
use crate::heap::TimerHeap;
use crate::lru::{DomainId, Lru};
use crate::mailbox::Mailbox;
use crate::metrics::{self, CountersSnapshot, ExpiryCounters};
use crate::objcore::{F_DYING, F_INSERT, F_MOVE, F_OFFLRU, NOIDX, ObjCore};
use crate::sync::{AtomicBool, Ordering};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sleep when the heap is empty. Any long, finite nap will do.
const EMPTY_NAP: f64 = 355.0 / 113.0;

/// Retry delay when the root object is still being written.
const BUSY_RETRY: f64 = 0.010;

/// Retry delay when another agent claimed the root first.
const CLAIM_RETRY: f64 = 0.001;

/// Upper bound on a single condvar wait, so a far-future deadline cannot
/// produce an unrepresentable duration.
const MAX_NAP: f64 = 86_400.0;

struct Shared {
    inbox: Mutex<Mailbox>,
    cond: Condvar,
    lrus: RwLock<Vec<Arc<Lru>>>,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn ObjectBackend>,
    counters: ExpiryCounters,
    started: AtomicBool,
    stop: AtomicBool,
}

impl Shared {
    fn lru_for(&self, oc: &ObjCore) -> Arc<Lru> {
        self.lrus
            .read()
            .get(oc.domain().index())
            .cloned()
            .expect("objcore references an unregistered domain")
    }

    /// Drop one protocol reference, tearing the object down on zero.
    fn release(&self, oc: &Arc<ObjCore>) {
        if oc.drop_ref() {
            self.backend.retire(oc);
        }
    }
}

/// Builder for an [`Expiry`] engine.
pub struct ExpiryBuilder {
    clock: Arc<dyn Clock>,
    backend: Arc<dyn ObjectBackend>,
}

impl Default for ExpiryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiryBuilder {
    /// Create a builder with the system clock and a no-op backend.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(WallClock),
            backend: Arc::new(NoopBackend),
        }
    }

    /// Use a custom clock source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a storage backend for metadata persistence and teardown.
    pub fn backend(mut self, backend: Arc<dyn ObjectBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Build the engine. The timer thread is not started until
    /// [`Expiry::spawn`].
    pub fn build(self) -> Expiry {
        Expiry {
            shared: Arc::new(Shared {
                inbox: Mutex::new(Mailbox::new()),
                cond: Condvar::new(),
                lrus: RwLock::new(Vec::new()),
                clock: self.clock,
                backend: self.backend,
                counters: ExpiryCounters::new(),
                started: AtomicBool::new(false),
                stop: AtomicBool::new(false),
            }),
        }
    }
}

/// Handle to the expiry engine.
///
/// Cheap to clone; every worker thread holds one. All operations are safe to
/// call concurrently from any thread.
#[derive(Clone)]
pub struct Expiry {
    shared: Arc<Shared>,
}

impl Default for Expiry {
    fn default() -> Self {
        Self::new()
    }
}

impl Expiry {
    /// Engine with default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building an engine.
    pub fn builder() -> ExpiryBuilder {
        ExpiryBuilder::new()
    }

    /// Current wall-clock time, from the engine's clock source.
    pub fn wall(&self) -> f64 {
        self.shared.clock.wall()
    }

    /// Snapshot of this engine's counters.
    pub fn counters(&self) -> CountersSnapshot {
        self.shared.counters.snapshot()
    }

    /// Number of state transitions waiting for the timer thread.
    pub fn backlog(&self) -> usize {
        self.shared.inbox.lock().len()
    }

    /// Register a storage domain and get its LRU set.
    ///
    /// `dontmove` disables recency reordering for backends where it buys
    /// nothing.
    pub fn new_domain(&self, dontmove: bool) -> DomainId {
        let mut lrus = self.shared.lrus.write();
        let id = DomainId(lrus.len() as u32);
        lrus.push(Arc::new(Lru::new(dontmove)));
        id
    }

    /// Look up a registered domain's LRU set.
    pub fn lru(&self, domain: DomainId) -> Option<Arc<Lru>> {
        self.shared.lrus.read().get(domain.index()).cloned()
    }

    /// Spawn the timer thread. Panics if called twice: the heap is
    /// single-writer and exactly one thread may own it.
    pub fn spawn(&self) -> std::thread::JoinHandle<()> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            panic!("expiry thread is already running");
        }
        let reaper = Reaper::new(Arc::clone(&self.shared));
        std::thread::Builder::new()
            .name("cache-expiry".to_string())
            .spawn(move || reaper.run())
            .expect("failed to spawn expiry thread")
    }

    /// Ask the timer thread to park. Mailed objects that were not yet
    /// processed stay referenced until process exit.
    pub fn stop(&self) {
        let _inbox = self.shared.inbox.lock();
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cond.notify_all();
    }

    /// Wake the timer thread so it re-samples the clock. Only useful with a
    /// manual clock source.
    pub fn kick(&self) {
        let _inbox = self.shared.inbox.lock();
        self.shared.cond.notify_all();
    }

    /// Schedule an objcore with a pre-computed wake time.
    ///
    /// The caller's protocol reference transfers to the engine.
    pub fn inject(&self, oc: Arc<ObjCore>, when: f64) {
        assert!(!when.is_nan(), "wake time must not be NaN");
        assert!(!oc.is_off_lru(), "objcore is already scheduled");

        let lru = self.shared.lru_for(&oc);
        {
            let mut list = lru.lock();
            list.n_objcore += 1;
            oc.set_flags(F_OFFLRU | F_INSERT);
        }
        oc.set_timer_when(when);
        self.mail_it(oc);
    }

    /// Schedule a freshly cached object, deriving its wake time from the
    /// object timers.
    ///
    /// Takes its own protocol reference; the caller keeps the one it has.
    pub fn insert(&self, oc: &Arc<ObjCore>) {
        oc.add_ref();

        let now = self.shared.clock.wall();
        let when = {
            let timers = oc.timers();
            assert!(
                timers.t_origin != 0.0 && !timers.t_origin.is_nan(),
                "inserted object has no origin time"
            );
            timers.deadline()
        };
        oc.set_last_lru(now);
        assert!(!oc.is_off_lru(), "objcore is already scheduled");

        let lru = self.shared.lru_for(oc);
        {
            let mut list = lru.lock();
            list.n_objcore += 1;
            oc.set_flags(F_OFFLRU | F_INSERT);
        }
        oc.set_timer_when(when);
        self.shared.backend.persist_timers(oc);
        self.mail_it(Arc::clone(oc));
    }

    /// Record a use of the object: move it to the most-recent end of its
    /// LRU list, if that is cheap right now.
    ///
    /// Returns whether a move happened.
    pub fn touch(&self, oc: &ObjCore) -> bool {
        let lru = self.shared.lru_for(oc);
        if lru.touch(oc) {
            self.shared.counters.record_lru_moved();
            true
        } else {
            false
        }
    }

    /// The object's timers changed; reschedule it.
    ///
    /// A negative effective deadline schedules the object for destruction.
    /// If the objcore is already off its LRU (a mail is pending or another
    /// agent claimed it), only the flags change: the in-flight transition
    /// recomputes the deadline when it lands.
    pub fn rearm(&self, oc: &Arc<ObjCore>) {
        let when = oc.deadline();

        tracing::trace!(
            xid = oc.xid(),
            old = oc.timer_when(),
            new = when,
            flags = oc.flag_bits(),
            "rearm"
        );

        if when == oc.timer_when() {
            return;
        }

        let lru = self.shared.lru_for(oc);
        let mail = {
            let mut list = lru.lock();
            if when < 0.0 {
                // A kill overrides any pending insert or move.
                oc.clear_flags(F_INSERT | F_MOVE);
                oc.set_flags(F_DYING);
            } else {
                oc.set_flags(F_MOVE);
            }
            if oc.is_off_lru() {
                false
            } else {
                list.unlink(oc);
                true
            }
        };
        if mail {
            self.mail_it(Arc::clone(oc));
        }
    }

    /// Make space by evicting the least-recent unused object from the
    /// domain's LRU.
    ///
    /// This is the only space-pressure entry point. Returns
    /// [`ExpiryError::CannotReclaim`] when every linked object is busy,
    /// multiply referenced, or contended; the caller then fails its fetch
    /// with an out-of-space condition.
    pub fn nuke_one(&self, domain: DomainId) -> ExpiryResult<()> {
        let lru = self
            .lru(domain)
            .ok_or(ExpiryError::UnknownDomain(domain))?;

        let Some(oc) = lru.lock().nuke_candidate() else {
            tracing::debug!(domain = domain.index(), "nothing reclaimable");
            return Err(ExpiryError::CannotReclaim);
        };

        self.shared.counters.record_lru_nuked();
        tracing::debug!(
            xid = oc.xid(),
            domain = domain.index(),
            when = oc.timer_when(),
            "evicted for space"
        );
        self.mail_it(Arc::clone(&oc));
        // The candidate came back with a donated reference for the mail;
        // this releases the engine's original one.
        self.shared.release(&oc);
        Ok(())
    }

    fn mail_it(&self, oc: Arc<ObjCore>) {
        self.shared.counters.record_mailed();
        let mut inbox = self.shared.inbox.lock();
        inbox.post(oc);
        self.shared.cond.notify_one();
    }
}

/// The timer thread's state: the heap it alone may touch.
struct Reaper {
    shared: Arc<Shared>,
    heap: TimerHeap,
}

impl Reaper {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            heap: TimerHeap::new(),
        }
    }

    /// Main loop: drain the mailbox, fire due expiries, sleep until the
    /// next deadline or a mail signal. Spurious wakes just re-evaluate.
    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let mut t: f64 = 0.0;
        let mut tnext: f64 = 0.0;

        loop {
            let mail;
            {
                let mut inbox = shared.inbox.lock();
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                mail = inbox.take();
                if mail.is_some() {
                    tnext = 0.0;
                } else if tnext > t {
                    // Idle housekeeping before the nap.
                    metrics::HEAP_OBJECTS.set(self.heap.len() as i64);
                    let wait = tnext - shared.clock.wall();
                    if wait > 0.0 {
                        let deadline =
                            Instant::now() + Duration::from_secs_f64(wait.min(MAX_NAP));
                        let _ = shared.cond.wait_until(&mut inbox, deadline);
                    }
                }
            }

            t = shared.clock.wall();

            match mail {
                Some(oc) => self.on_mail(oc, t),
                None => tnext = self.expire_step(t),
            }
        }
    }

    /// Apply one mailed state transition.
    fn on_mail(&mut self, oc: Arc<ObjCore>, now: f64) {
        tracing::trace!(
            xid = oc.xid(),
            when = oc.timer_when(),
            flags = oc.flag_bits(),
            "inbox"
        );

        let lru = self.shared.lru_for(&oc);

        // Evacuate the action flags and put the object back on the LRU,
        // unless it is on its way out.
        let flags;
        {
            let mut list = lru.lock();
            flags = oc.flag_bits();
            assert!(flags & F_OFFLRU != 0, "mailed objcore must be off the LRU");
            oc.clear_flags(F_INSERT | F_MOVE);
            oc.set_last_lru(now);
            if flags & F_DYING != 0 {
                list.n_objcore -= 1;
            } else {
                list.link(&oc);
            }
        }

        if flags & F_DYING != 0 {
            // A kill can overtake its own insert mail, in which case there
            // is no heap entry to clean up yet.
            let idx = oc.timer_idx();
            if idx != NOIDX {
                self.heap.delete(idx);
            }
            self.shared.release(&oc);
            return;
        }

        if flags & F_MOVE != 0 {
            let when = oc.deadline();
            oc.set_timer_when(when);
            self.shared.backend.persist_timers(&oc);
        }

        tracing::trace!(xid = oc.xid(), when = oc.timer_when(), "armed");

        if flags & F_INSERT != 0 {
            debug_assert_eq!(oc.timer_idx(), NOIDX);
            self.heap.insert(Arc::clone(&oc));
            assert_ne!(oc.timer_idx(), NOIDX);
        } else if flags & F_MOVE != 0 {
            assert_ne!(oc.timer_idx(), NOIDX);
            self.heap.reorder(oc.timer_idx());
        } else {
            panic!("mailed objcore carries no pending action");
        }
    }

    /// Examine the heap root once. Returns the next wake time: `0.0` to go
    /// again immediately, an absolute deadline to sleep until otherwise.
    fn expire_step(&mut self, now: f64) -> f64 {
        let Some(root) = self.heap.peek_root() else {
            return now + EMPTY_NAP;
        };

        if root.timer_when() > now {
            return root.timer_when();
        }

        // Cannot kill an object a fetch is still filling.
        if root.is_busy() {
            return now + BUSY_RETRY;
        }

        let oc = Arc::clone(root);
        self.shared.counters.record_expired();

        let lru = self.shared.lru_for(&oc);
        let owned = {
            let mut list = lru.lock();
            oc.set_flags(F_DYING);
            if oc.is_off_lru() {
                false
            } else {
                list.unlink(&oc);
                list.n_objcore -= 1;
                true
            }
        };
        if !owned {
            // Another agent pulled it toward the mailbox first; the pending
            // mail resolves the state. Come back shortly.
            return now + CLAIM_RETRY;
        }

        let idx = oc.timer_idx();
        assert_ne!(idx, NOIDX);
        self.heap.delete(idx);
        debug_assert_eq!(oc.timer_idx(), NOIDX);

        let residual = oc.timers().effective_expiry(None) - now;
        tracing::debug!(
            xid = oc.xid(),
            when = oc.timer_when(),
            flags = oc.flag_bits(),
            residual,
            "expired"
        );
        self.shared.release(&oc);
        0.0
    }
}
