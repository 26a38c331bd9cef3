//! Expiry engine metrics.
//!
//! Process-wide counters are registered with metriken for Prometheus
//! exposition. Each engine additionally keeps its own [`ExpiryCounters`]
//! block so embedders (and tests) can read engine-scoped numbers without
//! going through the global registry.

use crate::sync::{AtomicU64, Ordering};
use metriken::{Counter, Gauge, metric};

/// Objects expired by the timer thread.
#[metric(
    name = "expiry_expired",
    description = "Objects expired by the timer thread"
)]
pub static EXPIRED: Counter = Counter::new();

/// Objects moved to the tail of an LRU list.
#[metric(
    name = "expiry_lru_moved",
    description = "Objects moved to the tail of an LRU list"
)]
pub static LRU_MOVED: Counter = Counter::new();

/// Objects forcibly evicted to make space.
#[metric(
    name = "expiry_lru_nuked",
    description = "Objects forcibly evicted to make space"
)]
pub static LRU_NUKED: Counter = Counter::new();

/// State transitions posted to the timer thread.
#[metric(
    name = "expiry_mailed",
    description = "State transitions posted to the timer thread"
)]
pub static MAILED: Counter = Counter::new();

/// Objects currently resident in the timer heap.
#[metric(
    name = "expiry_heap_objects",
    description = "Objects currently resident in the timer heap"
)]
pub static HEAP_OBJECTS: Gauge = Gauge::new();

/// Atomic counters scoped to one engine instance.
///
/// Every `record_*` also feeds the process-wide metriken counter of the same
/// event.
#[derive(Debug, Default)]
pub struct ExpiryCounters {
    n_expired: AtomicU64,
    n_lru_moved: AtomicU64,
    n_lru_nuked: AtomicU64,
    n_mailed: AtomicU64,
}

impl ExpiryCounters {
    /// Create a zeroed counter block.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_expired(&self) {
        self.n_expired.fetch_add(1, Ordering::Relaxed);
        EXPIRED.increment();
    }

    #[inline]
    pub(crate) fn record_lru_moved(&self) {
        self.n_lru_moved.fetch_add(1, Ordering::Relaxed);
        LRU_MOVED.increment();
    }

    #[inline]
    pub(crate) fn record_lru_nuked(&self) {
        self.n_lru_nuked.fetch_add(1, Ordering::Relaxed);
        LRU_NUKED.increment();
    }

    #[inline]
    pub(crate) fn record_mailed(&self) {
        self.n_mailed.fetch_add(1, Ordering::Relaxed);
        MAILED.increment();
    }

    /// Snapshot the current values.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            n_expired: self.n_expired.load(Ordering::Relaxed),
            n_lru_moved: self.n_lru_moved.load(Ordering::Relaxed),
            n_lru_nuked: self.n_lru_nuked.load(Ordering::Relaxed),
            n_mailed: self.n_mailed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// Objects expired by the timer thread.
    pub n_expired: u64,
    /// Objects moved to the tail of an LRU list.
    pub n_lru_moved: u64,
    /// Objects forcibly evicted to make space.
    pub n_lru_nuked: u64,
    /// State transitions posted to the timer thread.
    pub n_mailed: u64,
}
