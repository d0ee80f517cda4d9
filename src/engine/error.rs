use ulid::Ulid;

use crate::model::{ReservationState, Slot};

/// Failures of the interval store. Expected outcomes (conflicts, stale
/// versions, illegal edges) are values here, never panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(Ulid),
    /// `start` is not strictly before `end`.
    MalformedSlot(Slot),
    /// The candidate slot overlaps this active reservation.
    Conflict(Ulid),
    StaleVersion {
        id: Ulid,
        expected: u64,
        actual: u64,
    },
    InvalidTransition {
        id: Ulid,
        from: ReservationState,
        to: ReservationState,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "reservation not found: {id}"),
            StoreError::MalformedSlot(slot) => write!(
                f,
                "malformed slot on {}: [{}, {})",
                slot.date, slot.start, slot.end
            ),
            StoreError::Conflict(id) => write!(f, "conflict with reservation: {id}"),
            StoreError::StaleVersion {
                id,
                expected,
                actual,
            } => write!(
                f,
                "stale version for {id}: expected {expected}, stored {actual}"
            ),
            StoreError::InvalidTransition { id, from, to } => {
                write!(f, "invalid transition for {id}: {from} -> {to}")
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
