//! Single-flight admission gate for the conversation-send route
//!
//! The upstream service tolerates only one in-flight message per session, so
//! the gate admits at most one conversation request at a time. Acquisition is
//! non-blocking: contenders are rejected immediately, never queued.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Reply sent to callers rejected by the gate, and the rewrite target for the
/// matching upstream error text.
pub const BUSY_MESSAGE: &str = "Only one message at a time. Please allow any other responses to complete before sending another message, or wait one minute.";

/// Non-blocking mutual-exclusion gate. Cloning shares the same slot.
#[derive(Clone, Default)]
pub struct AdmissionGate {
    slot: Arc<Mutex<()>>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the single admission slot. Returns `None` when another
    /// request already holds it.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        self.slot
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| AdmissionPermit { _guard: guard })
    }
}

/// Proof of admission. Dropping the permit releases the gate, so an early
/// return or error cannot leave it held.
pub struct AdmissionPermit {
    _guard: OwnedMutexGuard<()>,
}
