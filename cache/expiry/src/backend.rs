//! Collaborator seam toward the storage layer.
//!
//! The engine decides *when* objects die; storage decides what that means.
//! Two notifications cross the seam: timer metadata changed (so persistent
//! storage can record the new wake time), and the last reference went away
//! (so the full object can be torn down).

use crate::objcore::ObjCore;

/// Hooks the storage layer provides to the engine.
///
/// Both methods default to no-ops; in-memory storage domains typically need
/// neither.
pub trait ObjectBackend: Send + Sync + 'static {
    /// Called after `timer_when` changes so external persistence layers can
    /// record it.
    fn persist_timers(&self, oc: &ObjCore) {
        let _ = oc;
    }

    /// Called when the reference count reaches zero. The full object and its
    /// storage are released here, outside the engine.
    fn retire(&self, oc: &ObjCore) {
        let _ = oc;
    }
}

/// Backend that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

impl ObjectBackend for NoopBackend {}
