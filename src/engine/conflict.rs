use crate::limits::MAX_ACTIVE_PER_RESOURCE;
use crate::model::*;

use super::StoreError;

pub(crate) fn validate_slot(slot: &Slot) -> Result<(), StoreError> {
    if !slot.is_well_formed() {
        return Err(StoreError::MalformedSlot(*slot));
    }
    Ok(())
}

/// Fail with the first active claim overlapping `slot`. Touching claims pass.
/// A real overlap is reported even when the resource is at its active cap.
pub(crate) fn check_no_conflict(rs: &ResourceState, slot: Slot) -> Result<(), StoreError> {
    if let Some(claim) = rs.overlapping(slot).next() {
        return Err(StoreError::Conflict(claim.id));
    }
    if rs.active_count() >= MAX_ACTIVE_PER_RESOURCE {
        return Err(StoreError::LimitExceeded("too many active reservations on resource"));
    }
    Ok(())
}

/// Records of every active reservation overlapping `slot`, in slot order.
pub(crate) fn conflicting_records(rs: &ResourceState, slot: Slot) -> Vec<Reservation> {
    rs.overlapping(slot)
        .filter_map(|claim| rs.record(&claim.id).cloned())
        .collect()
}
