//! Object expiry and LRU engine for the caching proxy.
//!
//! Cached response objects carry an origin time, a TTL, a grace window, and
//! a keep window. This crate decides *when* each object must be retired,
//! keeps one least-recently-used list per storage domain so space can be
//! reclaimed on demand, and coordinates both with the worker threads that
//! insert, touch, rearm, and evict objects.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                          Expiry                             |
//! |                                                             |
//! |  workers          +-----------+        timer thread         |
//! |  insert/inject -->|  Mailbox  |--drain--> +-------------+   |
//! |  rearm/nuke ----->| (FIFO,    |           |  TimerHeap  |   |
//! |                   |  dying    |           | (min-heap,  |   |
//! |  touch ---+       |  first)   |           |  one owner) |   |
//! |           |       +-----------+           +-------------+   |
//! |           v                                      |          |
//! |  +------------------+                            |          |
//! |  | Lru (per domain) |<------ link/unlink --------+          |
//! |  | slab-linked list |                         expire        |
//! |  +------------------+                                       |
//! +-------------------------------------------------------------+
//! ```
//!
//! Worker threads only ever take per-domain LRU mutexes (and then only
//! briefly, or as try-locks); every heap mutation is posted to the mailbox
//! and applied by the single timer thread, which also holds one protocol
//! reference per scheduled object.
//!
//! # Example
//!
//! ```ignore
//! use expiry::{Expiry, ObjCore, Timers};
//!
//! let engine = Expiry::new();
//! let domain = engine.new_domain(false);
//! let _thread = engine.spawn();
//!
//! let oc = ObjCore::new(42, domain);
//! *oc.timers() = Timers::new(engine.wall(), 3600.0, 10.0, 0.0);
//! engine.insert(&oc);
//!
//! // On a cache hit:
//! engine.touch(&oc);
//!
//! // Under space pressure:
//! engine.nuke_one(domain)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backend;
mod clock;
mod error;
mod expire;
mod heap;
mod lru;
mod mailbox;
mod objcore;
mod sync;

/// Engine metrics: metriken registrations and per-engine counters.
pub mod metrics;

pub use backend::{NoopBackend, ObjectBackend};
pub use clock::{Clock, ManualClock, WallClock};
pub use error::{ExpiryError, ExpiryResult};
pub use expire::{Expiry, ExpiryBuilder};
pub use lru::{DomainId, Lru};
pub use metrics::CountersSnapshot;
pub use objcore::{NOIDX, ObjCore, Timers};
