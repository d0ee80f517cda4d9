//! Admission: turn a raw booking request into a new `Requested`
//! reservation or a typed rejection.
//!
//! Admission is not idempotent. Two identical calls are two attempts; once
//! the first succeeds the second is rejected as `SlotTaken` against it.
//! Nothing is published on rejection.

use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use tracing::debug;
use ulid::Ulid;

use crate::clock::Clock;
use crate::engine::{IntervalStore, StoreError};
use crate::limits::MAX_ADVANCE_DAYS;
use crate::model::*;
use crate::policy::ResourceActiveCheck;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    InvalidInterval(&'static str),
    ResourceUnavailable(ResourceId),
    SlotTaken { conflicting_reservation_id: Ulid },
    LimitExceeded(&'static str),
    Storage(String),
}

impl AdmissionError {
    /// Only storage failures may succeed unchanged on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdmissionError::Storage(_))
    }

    pub fn http_status(&self) -> u16 {
        match self {
            AdmissionError::InvalidInterval(_) => 400,
            AdmissionError::ResourceUnavailable(_) => 404,
            AdmissionError::SlotTaken { .. } => 409,
            AdmissionError::LimitExceeded(_) => 429,
            AdmissionError::Storage(_) => 503,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            AdmissionError::InvalidInterval(_) => "invalid_interval",
            AdmissionError::ResourceUnavailable(_) => "resource_unavailable",
            AdmissionError::SlotTaken { .. } => "slot_taken",
            AdmissionError::LimitExceeded(_) => "limit_exceeded",
            AdmissionError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::InvalidInterval(msg) => write!(f, "invalid interval: {msg}"),
            AdmissionError::ResourceUnavailable(id) => {
                write!(f, "resource {id} is not accepting bookings")
            }
            AdmissionError::SlotTaken {
                conflicting_reservation_id,
            } => write!(f, "slot taken by reservation {conflicting_reservation_id}"),
            AdmissionError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            AdmissionError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for AdmissionError {}

impl From<StoreError> for AdmissionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(id) => AdmissionError::SlotTaken {
                conflicting_reservation_id: id,
            },
            StoreError::MalformedSlot(_) => {
                AdmissionError::InvalidInterval("start must be before end on the same day")
            }
            StoreError::LimitExceeded(msg) => AdmissionError::LimitExceeded(msg),
            other => AdmissionError::Storage(other.to_string()),
        }
    }
}

pub struct AdmissionController<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: IntervalStore + ?Sized> AdmissionController<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Try to book `slot` on `resource_id` for `holder_id`.
    pub async fn admit(
        &self,
        resource_id: ResourceId,
        slot: Slot,
        holder_id: HolderId,
        resource_active: &dyn ResourceActiveCheck,
    ) -> Result<Reservation, AdmissionError> {
        let started = Instant::now();
        let result = self.try_admit(resource_id, slot, holder_id, resource_active).await;

        let outcome = match &result {
            Ok(_) => "admitted",
            Err(e) => e.outcome(),
        };
        metrics::counter!(crate::observability::ADMISSIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(crate::observability::ADMISSION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(r) => debug!(id = %r.id, %resource_id, %holder_id, "admitted"),
            Err(e) => debug!(%resource_id, %holder_id, "admission rejected: {e}"),
        }
        result
    }

    async fn try_admit(
        &self,
        resource_id: ResourceId,
        slot: Slot,
        holder_id: HolderId,
        resource_active: &dyn ResourceActiveCheck,
    ) -> Result<Reservation, AdmissionError> {
        self.validate(&slot)?;
        if !resource_active.is_active(resource_id).await {
            return Err(AdmissionError::ResourceUnavailable(resource_id));
        }
        Ok(self.store.insert_if_free(resource_id, slot, holder_id).await?)
    }

    fn validate(&self, slot: &Slot) -> Result<(), AdmissionError> {
        if !slot.is_well_formed() {
            return Err(AdmissionError::InvalidInterval(
                "start must be before end on the same day",
            ));
        }
        let today = self.clock.now().date_naive();
        if slot.date < today {
            return Err(AdmissionError::InvalidInterval("date is in the past"));
        }
        if slot.date - today > Duration::days(MAX_ADVANCE_DAYS) {
            return Err(AdmissionError::InvalidInterval("date is too far in the future"));
        }
        Ok(())
    }
}
