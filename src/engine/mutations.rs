use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_slot};
use super::{Engine, StoreError, TransitionNote, WalCommand};

impl Engine {
    /// The only path that creates an exclusivity claim. The resource's write
    /// lock spans the conflict check, the WAL append and the apply, so two
    /// overlapping inserts on one resource can never both pass the check.
    /// Dropping the returned future leaves the insert fully done or not done.
    pub async fn insert_if_free(
        &self,
        resource_id: ResourceId,
        slot: Slot,
        holder_id: HolderId,
    ) -> Result<Reservation, StoreError> {
        validate_slot(&slot)?;
        let _gate = self.compaction_gate.read().await;
        let rs = self.resource_or_create(resource_id);
        let guard = rs.write_owned().await;

        check_no_conflict(&guard, slot)?;

        let id = Ulid::new();
        let event = Event::ReservationRequested {
            id,
            resource_id,
            holder_id,
            slot,
            at: self.clock.now(),
        };
        let reservation = self.persist_and_apply(guard, event).await?;
        debug!(%id, %resource_id, date = %slot.date, start = %slot.start, end = %slot.end, "slot claimed");
        Ok(reservation)
    }

    /// Optimistic-concurrency state update along one legal edge.
    /// Moving into a terminal state releases the slot claim; the record stays.
    pub async fn transition(
        &self,
        id: ReservationId,
        from: ReservationState,
        to: ReservationState,
        expected_version: u64,
        note: TransitionNote,
    ) -> Result<Reservation, StoreError> {
        if note.reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(StoreError::LimitExceeded("cancellation reason too long"));
        }
        let _gate = self.compaction_gate.read().await;
        let guard = self.resolve_write(&id).await?;
        let current = guard.record(&id).ok_or(StoreError::NotFound(id))?;

        if current.version != expected_version {
            return Err(StoreError::StaleVersion {
                id,
                expected: expected_version,
                actual: current.version,
            });
        }
        if current.state != from || !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.state,
                to,
            });
        }

        let event = Event::ReservationTransitioned {
            id,
            resource_id: current.resource_id,
            to,
            version: expected_version + 1,
            at: self.clock.now(),
            reason: note.reason,
            cancelled_by: note.cancelled_by,
        };
        let reservation = self.persist_and_apply(guard, event).await?;
        debug!(%id, %from, %to, version = expected_version + 1, "reservation transitioned");
        Ok(reservation)
    }

    /// Record a payment outcome. Bumps the version, leaves state and claim alone.
    pub async fn update_payment(
        &self,
        id: ReservationId,
        payment_status: PaymentStatus,
        expected_version: u64,
    ) -> Result<Reservation, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let guard = self.resolve_write(&id).await?;
        let current = guard.record(&id).ok_or(StoreError::NotFound(id))?;
        if current.version != expected_version {
            return Err(StoreError::StaleVersion {
                id,
                expected: expected_version,
                actual: current.version,
            });
        }

        let event = Event::PaymentUpdated {
            id,
            resource_id: current.resource_id,
            payment_status,
            version: expected_version + 1,
            at: self.clock.now(),
        };
        self.persist_and_apply(guard, event).await
    }

    /// Rewrite the WAL with one record per reservation, tombstones included.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        // Exclusive gate: no mutation can append to the old file and then be
        // lost when the compacted file replaces it.
        let _gate = self.compaction_gate.write().await;

        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            let mut records: Vec<&Reservation> = guard.records.values().collect();
            records.sort_by_key(|r| r.id);
            events.extend(records.into_iter().map(|r| Event::ReservationRestored {
                reservation: r.clone(),
            }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))?;

        metrics::counter!(crate::observability::COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {count} records");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
