use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type ReservationId = Ulid;
/// The photographer. Intervals only conflict within one resource.
pub type ResourceId = Ulid;
pub type HolderId = Ulid;
pub type ActorId = Ulid;

/// Half-open time range `[start, end)` on a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Slot {
    pub fn new(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self { date, start, end }
    }

    /// `start < end` on the same day. Midnight-spanning and zero-length slots fail this.
    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Same day and `a.start < b.end && b.start < a.end`. Touching slots do not overlap.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.date == other.date && self.start < other.end && other.start < self.end
    }

    pub fn starts_at(&self) -> DateTime<Utc> {
        self.date.and_time(self.start).and_utc()
    }

    fn start_key(&self) -> (NaiveDate, NaiveTime) {
        (self.date, self.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    Requested,
    Confirmed,
    Completed,
    Cancelled,
}

impl ReservationState {
    /// Requested and Confirmed reservations hold exclusivity over their slot.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationState::Requested | ReservationState::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// The closed transition graph:
    ///
    /// ```text
    /// Requested --confirm--> Confirmed --complete--> Completed
    /// Requested --cancel---> Cancelled
    /// Confirmed --cancel---> Cancelled
    /// ```
    pub fn can_transition_to(self, to: ReservationState) -> bool {
        use ReservationState::*;
        matches!(
            (self, to),
            (Requested, Confirmed) | (Confirmed, Completed) | (Requested, Cancelled) | (Confirmed, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationState::Requested => "requested",
            ReservationState::Confirmed => "confirmed",
            ReservationState::Completed => "completed",
            ReservationState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Failed,
}

/// Who moved a reservation into `Cancelled`. Kept on the record for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelledBy {
    Holder,
    Owner,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub resource_id: ResourceId,
    pub holder_id: HolderId,
    pub slot: Slot,
    pub state: ReservationState,
    /// Starts at 1; bumped by every transition and payment update.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payment_status: PaymentStatus,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<CancelledBy>,
}

impl Reservation {
    pub fn requested(
        id: ReservationId,
        resource_id: ResourceId,
        holder_id: HolderId,
        slot: Slot,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            resource_id,
            holder_id,
            slot,
            state: ReservationState::Requested,
            version: 1,
            created_at: at,
            updated_at: at,
            payment_status: PaymentStatus::Pending,
            cancellation_reason: None,
            cancelled_by: None,
        }
    }
}

/// An entry in a resource's conflict working set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub id: ReservationId,
    pub slot: Slot,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: ResourceId,
    /// Claims of Requested/Confirmed reservations, sorted by `(slot.date, slot.start)`.
    pub claims: Vec<Claim>,
    /// Every reservation ever admitted on this resource, tombstones included.
    pub records: HashMap<ReservationId, Reservation>,
}

impl ResourceState {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            claims: Vec::new(),
            records: HashMap::new(),
        }
    }

    /// Insert claim maintaining sort order by slot start.
    pub fn claim(&mut self, claim: Claim) {
        let pos = self
            .claims
            .binary_search_by_key(&claim.slot.start_key(), |c| c.slot.start_key())
            .unwrap_or_else(|e| e);
        self.claims.insert(pos, claim);
    }

    /// Drop a reservation's claim from the working set. The record stays.
    pub fn release(&mut self, id: ReservationId) -> Option<Claim> {
        let pos = self.claims.iter().position(|c| c.id == id)?;
        Some(self.claims.remove(pos))
    }

    /// Return only claims whose slot overlaps `query`.
    /// Uses binary search to skip claims starting at or after `query.end` on its day.
    pub fn overlapping(&self, query: Slot) -> impl Iterator<Item = &Claim> {
        let right_bound = self
            .claims
            .partition_point(|c| c.slot.start_key() < (query.date, query.end));
        self.claims[..right_bound]
            .iter()
            .filter(move |c| c.slot.overlaps(&query))
    }

    pub fn active_count(&self) -> usize {
        self.claims.len()
    }

    pub fn record(&self, id: &ReservationId) -> Option<&Reservation> {
        self.records.get(id)
    }
}

/// The event types, flat. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationRequested {
        id: ReservationId,
        resource_id: ResourceId,
        holder_id: HolderId,
        slot: Slot,
        at: DateTime<Utc>,
    },
    ReservationTransitioned {
        id: ReservationId,
        resource_id: ResourceId,
        to: ReservationState,
        version: u64,
        at: DateTime<Utc>,
        reason: Option<String>,
        cancelled_by: Option<CancelledBy>,
    },
    PaymentUpdated {
        id: ReservationId,
        resource_id: ResourceId,
        payment_status: PaymentStatus,
        version: u64,
        at: DateTime<Utc>,
    },
    /// Full record, written only by compaction.
    ReservationRestored { reservation: Reservation },
}

impl Event {
    pub fn resource_id(&self) -> ResourceId {
        match self {
            Event::ReservationRequested { resource_id, .. }
            | Event::ReservationTransitioned { resource_id, .. }
            | Event::PaymentUpdated { resource_id, .. } => *resource_id,
            Event::ReservationRestored { reservation } => reservation.resource_id,
        }
    }

    pub fn reservation_id(&self) -> ReservationId {
        match self {
            Event::ReservationRequested { id, .. }
            | Event::ReservationTransitioned { id, .. }
            | Event::PaymentUpdated { id, .. } => *id,
            Event::ReservationRestored { reservation } => reservation.id,
        }
    }
}

/// Published to subscribers after a state change is durable.
/// Consumers must be idempotent on `(reservation_id, state)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub reservation_id: ReservationId,
    pub resource_id: ResourceId,
    pub holder_id: HolderId,
    pub state: ReservationState,
    pub version: u64,
    pub at: DateTime<Utc>,
}

impl From<&Reservation> for StateChange {
    fn from(r: &Reservation) -> Self {
        Self {
            reservation_id: r.id,
            resource_id: r.resource_id,
            holder_id: r.holder_id,
            state: r.state,
            version: r.version,
            at: r.updated_at,
        }
    }
}

// ── Query types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListFilter {
    pub state: Option<ReservationState>,
    /// 1-based.
    pub page: usize,
    pub limit: usize,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            state: None,
            page: 1,
            limit: crate::limits::DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 20).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn slot(sh: u32, eh: u32) -> Slot {
        Slot::new(day(), t(sh, 0), t(eh, 0))
    }

    fn claim(sh: u32, eh: u32) -> Claim {
        Claim {
            id: Ulid::new(),
            slot: slot(sh, eh),
        }
    }

    #[test]
    fn slot_basics() {
        let s = slot(14, 16);
        assert!(s.is_well_formed());
        assert_eq!(s.duration(), Duration::hours(2));
        assert_eq!(s.starts_at().to_rfc3339(), "2025-06-20T14:00:00+00:00");
        assert!(!Slot::new(day(), t(10, 0), t(10, 0)).is_well_formed());
        assert!(!Slot::new(day(), t(22, 0), t(0, 0)).is_well_formed());
    }

    #[test]
    fn slot_overlap() {
        let a = slot(10, 12);
        let b = slot(11, 13);
        let c = slot(12, 13);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // touching, not overlapping
    }

    #[test]
    fn slot_overlap_needs_same_date() {
        let a = slot(10, 12);
        let mut b = a;
        b.date = day().succ_opt().unwrap();
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn transition_graph_is_closed() {
        use ReservationState::*;
        let all = [Requested, Confirmed, Completed, Cancelled];
        let legal: Vec<_> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();
        assert_eq!(
            legal,
            vec![
                (Requested, Confirmed),
                (Requested, Cancelled),
                (Confirmed, Completed),
                (Confirmed, Cancelled),
            ]
        );
        assert!(!Requested.can_transition_to(Completed));
    }

    #[test]
    fn claim_ordering() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.claim(claim(15, 16));
        rs.claim(claim(9, 10));
        rs.claim(claim(12, 13));
        let starts: Vec<_> = rs.claims.iter().map(|c| c.slot.start).collect();
        assert_eq!(starts, vec![t(9, 0), t(12, 0), t(15, 0)]);
    }

    #[test]
    fn claims_order_across_days() {
        let mut rs = ResourceState::new(Ulid::new());
        let mut later = claim(8, 9);
        later.slot.date = day().succ_opt().unwrap();
        rs.claim(later);
        rs.claim(claim(20, 21));
        assert_eq!(rs.claims[0].slot.date, day());
        assert_eq!(rs.claims[1].slot.date, later.slot.date);
    }

    #[test]
    fn release_removes_only_target() {
        let mut rs = ResourceState::new(Ulid::new());
        let a = claim(9, 10);
        let b = claim(10, 11);
        rs.claim(a);
        rs.claim(b);
        assert_eq!(rs.release(a.id), Some(a));
        assert_eq!(rs.claims, vec![b]);
        assert!(rs.release(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_disjoint() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.claim(claim(8, 9));
        let hit = claim(10, 12);
        rs.claim(hit);
        rs.claim(claim(15, 16));

        let hits: Vec<_> = rs.overlapping(slot(11, 14)).collect();
        assert_eq!(hits, vec![&hit]);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.claim(claim(10, 11));
        rs.claim(claim(12, 13));
        assert_eq!(rs.overlapping(slot(11, 12)).count(), 0);
    }

    #[test]
    fn overlapping_ignores_other_days() {
        let mut rs = ResourceState::new(Ulid::new());
        let mut other = claim(10, 12);
        other.slot.date = day().pred_opt().unwrap();
        rs.claim(other);
        let mut next = claim(10, 12);
        next.slot.date = day().succ_opt().unwrap();
        rs.claim(next);
        assert_eq!(rs.overlapping(slot(9, 13)).count(), 0);
    }

    #[test]
    fn overlapping_long_claim_spanning_query() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.claim(claim(6, 20));
        assert_eq!(rs.overlapping(slot(12, 13)).count(), 1);
    }

    #[test]
    fn new_reservation_starts_at_version_one() {
        let at = day().and_time(t(9, 0)).and_utc();
        let r = Reservation::requested(Ulid::new(), Ulid::new(), Ulid::new(), slot(14, 16), at);
        assert_eq!(r.state, ReservationState::Requested);
        assert_eq!(r.version, 1);
        assert_eq!(r.payment_status, PaymentStatus::Pending);
        let change = StateChange::from(&r);
        assert_eq!(change.state, ReservationState::Requested);
        assert_eq!(change.version, 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationTransitioned {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            to: ReservationState::Cancelled,
            version: 3,
            at: day().and_time(t(12, 0)).and_utc(),
            reason: Some("plans changed".into()),
            cancelled_by: Some(CancelledBy::Owner),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
