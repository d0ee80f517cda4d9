use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{ResourceId, StateChange};

const CHANNEL_CAPACITY: usize = 256;
const GLOBAL_CHANNEL_CAPACITY: usize = 4096;

/// Broadcast hub for reservation state changes, per resource and global.
pub struct NotifyHub {
    channels: DashMap<ResourceId, broadcast::Sender<StateChange>>,
    global: broadcast::Sender<StateChange>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            global: broadcast::channel(GLOBAL_CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to changes on one resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: ResourceId) -> broadcast::Receiver<StateChange> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to changes on every resource.
    pub fn subscribe_all(&self) -> broadcast::Receiver<StateChange> {
        self.global.subscribe()
    }

    /// Publish a change. A resource channel whose subscribers have all gone
    /// away is pruned on the first publish that finds it empty.
    pub fn send(&self, change: &StateChange) {
        let unheard = self
            .channels
            .get(&change.resource_id)
            .is_some_and(|sender| sender.send(change.clone()).is_err());
        if unheard {
            self.prune(&change.resource_id);
        }
        let _ = self.global.send(change.clone());
    }

    /// Drop a resource's channel once its last subscriber is gone.
    pub fn prune(&self, resource_id: &ResourceId) {
        self.channels
            .remove_if(resource_id, |_, sender| sender.receiver_count() == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReservationState;
    use chrono::Utc;
    use ulid::Ulid;

    fn change(resource_id: ResourceId, state: ReservationState) -> StateChange {
        StateChange {
            reservation_id: Ulid::new(),
            resource_id,
            holder_id: Ulid::new(),
            state,
            version: 1,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let c = change(rid, ReservationState::Requested);
        hub.send(&c);

        assert_eq!(rx.recv().await.unwrap(), c);
    }

    #[tokio::test]
    async fn resource_channels_are_isolated() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);
        let mut all = hub.subscribe_all();

        hub.send(&change(b, ReservationState::Requested));
        let on_a = change(a, ReservationState::Confirmed);
        hub.send(&on_a);

        assert_eq!(rx_a.recv().await.unwrap(), on_a);
        assert_eq!(all.recv().await.unwrap().resource_id, b);
        assert_eq!(all.recv().await.unwrap().resource_id, a);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&change(Ulid::new(), ReservationState::Cancelled));
    }

    #[tokio::test]
    async fn publish_prunes_abandoned_channel() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        drop(hub.subscribe(rid));
        assert!(hub.channels.contains_key(&rid));

        hub.send(&change(rid, ReservationState::Requested));
        assert!(!hub.channels.contains_key(&rid));

        // A later subscriber gets a fresh channel.
        let mut rx = hub.subscribe(rid);
        let c = change(rid, ReservationState::Confirmed);
        hub.send(&c);
        assert_eq!(rx.recv().await.unwrap(), c);
    }

    #[tokio::test]
    async fn prune_keeps_live_channels() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let rx = hub.subscribe(rid);
        hub.prune(&rid);
        assert!(hub.channels.contains_key(&rid));
        drop(rx);
        hub.prune(&rid);
        assert!(!hub.channels.contains_key(&rid));
    }
}
