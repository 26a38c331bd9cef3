//! Error types for the expiry engine.
//!
//! The recoverable error surface is deliberately small: eviction pressure can
//! fail to find a victim, and domain lookups can miss. Everything else in the
//! engine is an invariant violation and panics.

use crate::lru::DomainId;

/// Errors reported by the public engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExpiryError {
    /// The LRU holds no object that can be reclaimed right now: every entry
    /// is busy, multiply referenced, or its object-head lock is contended.
    /// Callers fail the triggering fetch with an out-of-space condition.
    #[error("nothing reclaimable on the LRU")]
    CannotReclaim,

    /// The storage domain was never registered with this engine.
    #[error("unknown storage domain {0:?}")]
    UnknownDomain(DomainId),
}

/// Result type for engine operations.
pub type ExpiryResult<T> = Result<T, ExpiryError>;
