use chrono::{Duration, NaiveDate, NaiveTime};

use crate::limits::*;
use crate::model::*;

use super::availability::{merge_overlapping, subtract_slots};
use super::conflict::{conflicting_records, validate_slot};
use super::{Engine, StoreError};

impl Engine {
    /// Active reservations overlapping `slot`. A snapshot for display, not a hold.
    pub async fn find_conflicts(&self, resource_id: ResourceId, slot: Slot) -> Vec<Reservation> {
        let Some(rs) = self.get_resource(&resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        conflicting_records(&guard, slot)
    }

    pub async fn get(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        let resource_id = self
            .get_resource_for_reservation(&id)
            .ok_or(StoreError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(StoreError::NotFound(id))?;
        let guard = rs.read().await;
        guard.record(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    /// Every reservation on a resource, newest slot first.
    pub async fn list_for_resource(
        &self,
        resource_id: ResourceId,
        filter: ListFilter,
    ) -> Page<Reservation> {
        let records = match self.get_resource(&resource_id) {
            Some(rs) => {
                let guard = rs.read().await;
                guard
                    .records
                    .values()
                    .filter(|r| filter.state.is_none_or(|s| r.state == s))
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        };
        paginate(records, filter)
    }

    /// Every reservation a holder has made, across resources, newest slot first.
    pub async fn list_for_holder(&self, holder_id: HolderId, filter: ListFilter) -> Page<Reservation> {
        let ids = self
            .by_holder
            .get(&holder_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            // Read one at a time; never hold two resource locks at once.
            if let Ok(r) = self.get(id).await
                && filter.state.is_none_or(|s| r.state == s)
            {
                records.push(r);
            }
        }
        paginate(records, filter)
    }

    /// Every reservation on every resource, newest slot first. Admin listing.
    pub async fn list_all(&self, filter: ListFilter) -> Page<Reservation> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut records = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            records.extend(
                guard
                    .records
                    .values()
                    .filter(|r| filter.state.is_none_or(|s| r.state == s))
                    .cloned(),
            );
        }
        paginate(records, filter)
    }

    /// Free windows on `date`: the given working hours minus every active claim.
    pub async fn free_windows(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
        working_hours: &[(NaiveTime, NaiveTime)],
        min_duration: Option<Duration>,
    ) -> Result<Vec<Slot>, StoreError> {
        if working_hours.len() > MAX_WORKING_WINDOWS {
            return Err(StoreError::LimitExceeded("too many working-hours windows"));
        }
        let mut base = Vec::with_capacity(working_hours.len());
        for &(start, end) in working_hours {
            let window = Slot::new(date, start, end);
            validate_slot(&window)?;
            base.push(window);
        }
        base.sort_by_key(|s| s.start);
        let base = merge_overlapping(&base);

        let taken: Vec<Slot> = match self.get_resource(&resource_id) {
            Some(rs) => {
                let guard = rs.read().await;
                guard
                    .claims
                    .iter()
                    .filter(|c| c.slot.date == date)
                    .map(|c| c.slot)
                    .collect()
            }
            None => Vec::new(),
        };

        let mut free = subtract_slots(&base, &taken);
        if let Some(min) = min_duration {
            free.retain(|s| s.duration() >= min);
        }
        Ok(free)
    }

    /// Current state of every reservation, for re-publishing to event consumers.
    pub async fn snapshot_state_changes(&self) -> Vec<StateChange> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut changes = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            changes.extend(guard.records.values().map(StateChange::from));
        }
        changes.sort_by_key(|c| c.reservation_id);
        changes
    }

    pub fn resource_count(&self) -> usize {
        self.state.len()
    }
}

fn paginate(mut records: Vec<Reservation>, filter: ListFilter) -> Page<Reservation> {
    records.sort_by(|a, b| {
        (b.slot.date, b.slot.start, b.id).cmp(&(a.slot.date, a.slot.start, a.id))
    });
    let limit = filter.limit.clamp(1, MAX_PAGE_SIZE);
    let page = filter.page.max(1);
    let total = records.len();
    let items = records
        .into_iter()
        .skip((page - 1).saturating_mul(limit))
        .take(limit)
        .collect();
    Page {
        items,
        page,
        total,
        total_pages: total.div_ceil(limit),
    }
}
