use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashSet;

use crate::model::{ResourceId, Slot};

/// "Is this photographer currently accepting bookings." Supplied by profile management.
#[async_trait]
pub trait ResourceActiveCheck: Send + Sync {
    async fn is_active(&self, resource_id: ResourceId) -> bool;
}

/// Accepts every resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysActive;

#[async_trait]
impl ResourceActiveCheck for AlwaysActive {
    async fn is_active(&self, _resource_id: ResourceId) -> bool {
        true
    }
}

/// Active resources held in memory, e.g. a cache of verified profiles.
#[derive(Debug, Default)]
pub struct ActiveSet {
    active: DashSet<ResourceId>,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self, resource_id: ResourceId) {
        self.active.insert(resource_id);
    }

    pub fn deactivate(&self, resource_id: &ResourceId) {
        self.active.remove(resource_id);
    }
}

impl FromIterator<ResourceId> for ActiveSet {
    fn from_iter<I: IntoIterator<Item = ResourceId>>(iter: I) -> Self {
        Self {
            active: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ResourceActiveCheck for ActiveSet {
    async fn is_active(&self, resource_id: ResourceId) -> bool {
        self.active.contains(&resource_id)
    }
}

/// Whether a holder may still cancel a confirmed reservation at `now`.
/// Owner-initiated cancellation never consults this.
pub trait CancellationPolicy: Send + Sync {
    fn allows(&self, slot: &Slot, now: DateTime<Utc>) -> bool;
}

/// Cancellation is allowed while at least `min_notice` remains before the slot starts.
#[derive(Debug, Clone, Copy)]
pub struct NoticePeriod {
    pub min_notice: Duration,
}

impl NoticePeriod {
    pub fn hours(hours: i64) -> Self {
        Self {
            min_notice: Duration::hours(hours),
        }
    }
}

impl Default for NoticePeriod {
    fn default() -> Self {
        Self::hours(24)
    }
}

impl CancellationPolicy for NoticePeriod {
    fn allows(&self, slot: &Slot, now: DateTime<Utc>) -> bool {
        slot.starts_at() - now >= self.min_notice
    }
}
