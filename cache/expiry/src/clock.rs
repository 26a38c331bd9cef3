//! Wall-clock source for the engine.
//!
//! Object timers are absolute wall-clock seconds (the same domain the HTTP
//! layer computes Age/Expires in), so the engine samples time through a
//! [`Clock`] seam rather than calling into the OS directly. Production uses
//! [`WallClock`]; tests and simulations drive a [`ManualClock`].

use crate::sync::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of absolute wall-clock time in seconds.
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time, seconds since the Unix epoch.
    fn wall(&self) -> f64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl Clock for WallClock {
    fn wall(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before the epoch")
            .as_secs_f64()
    }
}

/// A clock that only moves when told to.
///
/// Timer decisions in the engine are pure functions of "now", so advancing a
/// `ManualClock` and kicking the actor reproduces any schedule exactly.
#[derive(Debug)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at `now` seconds.
    pub fn new(now: f64) -> Self {
        Self {
            bits: AtomicU64::new(now.to_bits()),
        }
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::Release);
    }

    /// Advance the clock by `delta` seconds.
    pub fn advance(&self, delta: f64) {
        let now = f64::from_bits(self.bits.load(Ordering::Acquire));
        self.set(now + delta);
    }
}

impl Clock for ManualClock {
    fn wall(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}
