//! Host-wide single-slot concurrency gate.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::protocol::RequestId;

/// Exclusive admission slot over the active request id.
///
/// There is no queueing: a `chat_start` that finds the slot taken is
/// answered with `MODEL_BUSY`. The slot is shared by every peer session;
/// it is not partitioned per peer.
#[derive(Debug, Default)]
pub struct Gate {
    slot: Mutex<Option<RequestId>>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `request_id`. Returns `false` if it is held.
    pub fn acquire(&self, request_id: &str) -> bool {
        let mut slot = self.slot();
        if slot.is_some() {
            return false;
        }
        *slot = Some(request_id.to_owned());
        true
    }

    /// Release the slot if it is held by exactly `request_id`.
    ///
    /// A release keyed by any other id is a no-op; disorderly shutdown
    /// paths may release after the slot has already moved on.
    ///
    /// Callers must enqueue the request's terminal frame on the session's
    /// outbound channel *before* releasing, so an observer that sees the
    /// slot empty has seen the terminal emitted.
    pub fn release(&self, request_id: &str) {
        let mut slot = self.slot();
        if slot.as_deref() == Some(request_id) {
            *slot = None;
        }
    }

    /// The currently admitted request id, if any.
    pub fn active(&self) -> Option<RequestId> {
        self.slot().clone()
    }

    /// Unconditionally clear the slot. Supervised shutdown only.
    pub fn force_release(&self) {
        *self.slot() = None;
    }

    fn slot(&self) -> MutexGuard<'_, Option<RequestId>> {
        // The slot is a plain Option; recovering from a poisoned lock is
        // always sound here.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
