mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{merge_overlapping, subtract_slots};
pub use error::StoreError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Extra data recorded with a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionNote {
    pub reason: Option<String>,
    pub cancelled_by: Option<CancelledBy>,
}

/// The durable record of reservations and the sole admission gate.
///
/// Implementations must make `insert_if_free` behave as if all calls for one
/// resource were serialized, and `transition` must apply only when the
/// stored version equals `expected_version`.
#[async_trait]
pub trait IntervalStore: Send + Sync {
    /// Active reservations on `resource_id` overlapping `slot`. Point-in-time snapshot.
    async fn find_conflicts(
        &self,
        resource_id: ResourceId,
        slot: Slot,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Re-check conflicts and insert a `Requested` reservation as one indivisible step.
    async fn insert_if_free(
        &self,
        resource_id: ResourceId,
        slot: Slot,
        holder_id: HolderId,
    ) -> Result<Reservation, StoreError>;

    async fn transition(
        &self,
        id: ReservationId,
        from: ReservationState,
        to: ReservationState,
        expected_version: u64,
        note: TransitionNote,
    ) -> Result<Reservation, StoreError>;

    async fn get(&self, id: ReservationId) -> Result<Reservation, StoreError>;
}

// ── Group-commit WAL channel ─────────────────────────────

/// An event waiting for commit, with the write guard of the resource it touches.
/// The writer applies the event under that guard before releasing it.
pub(super) struct PendingAppend {
    event: Event,
    guard: OwnedRwLockWriteGuard<ResourceState>,
    response: oneshot::Sender<io::Result<Option<Reservation>>>,
}

pub(super) enum WalCommand {
    Append(PendingAppend),
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Indexes and hub the writer updates once an event is durable.
struct Applier {
    notify: Arc<NotifyHub>,
    reservation_to_resource: Arc<DashMap<ReservationId, ResourceId>>,
    by_holder: Arc<DashMap<HolderId, Vec<ReservationId>>>,
}

impl Applier {
    fn apply(&self, rs: &mut ResourceState, event: &Event) {
        if let Some(change) =
            apply_to_resource(rs, event, &self.reservation_to_resource, &self.by_holder)
        {
            self.notify.send(&change);
        }
    }
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is queued, then issues
/// one fsync for the whole batch. Each event is applied only after that fsync
/// succeeds; a failed batch is applied nowhere.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>, applier: Applier) {
    while let Some(cmd) = rx.recv().await {
        let first = match cmd {
            WalCommand::Append(pending) => pending,
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![first];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append(pending)) => batch.push(pending),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = wal.commit_batch(batch.iter().map(|p| &p.event));
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!("WAL flush of {} events failed: {e}", batch.len());
        }

        for PendingAppend {
            event,
            mut guard,
            response,
        } in batch
        {
            let reply = match &result {
                Ok(()) => {
                    applier.apply(&mut guard, &event);
                    Ok(guard.record(&event.reservation_id()).cloned())
                }
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            drop(guard);
            let _ = response.send(reply);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append(_) => unreachable!("appends are batched by the writer loop"),
    }
}

/// In-memory interval store backed by a write-ahead log.
///
/// Each resource lives behind its own `RwLock`. Writers take it for the
/// conflict check and hand it to the WAL writer, which keeps it through the
/// append and the in-memory apply.
pub struct Engine {
    pub state: DashMap<ResourceId, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    /// Reverse lookup: reservation id → resource id
    pub(super) reservation_to_resource: Arc<DashMap<ReservationId, ResourceId>>,
    /// Holder → reservation ids, in admission order.
    pub(super) by_holder: Arc<DashMap<HolderId, Vec<ReservationId>>>,
    /// Mutations hold it shared, compaction exclusively.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply an event to a ResourceState. The caller holds the lock.
/// Returns the state change to publish, if the event produced one.
fn apply_to_resource(
    rs: &mut ResourceState,
    event: &Event,
    reservation_index: &DashMap<ReservationId, ResourceId>,
    holder_index: &DashMap<HolderId, Vec<ReservationId>>,
) -> Option<StateChange> {
    match event {
        Event::ReservationRequested {
            id,
            resource_id,
            holder_id,
            slot,
            at,
        } => {
            let reservation = Reservation::requested(*id, *resource_id, *holder_id, *slot, *at);
            let change = StateChange::from(&reservation);
            rs.claim(Claim { id: *id, slot: *slot });
            rs.records.insert(*id, reservation);
            reservation_index.insert(*id, *resource_id);
            holder_index.entry(*holder_id).or_default().push(*id);
            Some(change)
        }
        Event::ReservationTransitioned {
            id,
            to,
            version,
            at,
            reason,
            cancelled_by,
            ..
        } => {
            let record = rs.records.get_mut(id)?;
            record.state = *to;
            record.version = *version;
            record.updated_at = *at;
            if reason.is_some() {
                record.cancellation_reason = reason.clone();
            }
            if cancelled_by.is_some() {
                record.cancelled_by = *cancelled_by;
            }
            let change = StateChange::from(&*record);
            if to.is_terminal() {
                rs.release(*id);
            }
            Some(change)
        }
        Event::PaymentUpdated {
            id,
            payment_status,
            version,
            at,
            ..
        } => {
            let record = rs.records.get_mut(id)?;
            record.payment_status = *payment_status;
            record.version = *version;
            record.updated_at = *at;
            None
        }
        Event::ReservationRestored { reservation } => {
            if reservation.state.is_active() {
                rs.claim(Claim {
                    id: reservation.id,
                    slot: reservation.slot,
                });
            }
            reservation_index.insert(reservation.id, reservation.resource_id);
            holder_index
                .entry(reservation.holder_id)
                .or_default()
                .push(reservation.id);
            rs.records.insert(reservation.id, reservation.clone());
            None
        }
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.torn_tail {
            warn!(
                "WAL {} ended in a torn entry; keeping {} intact events ({} bytes)",
                wal_path.display(),
                replay.events.len(),
                replay.valid_len
            );
            Wal::truncate(&wal_path, replay.valid_len)?;
        }
        let wal = Wal::open(&wal_path)?;
        let reservation_to_resource = Arc::new(DashMap::new());
        let by_holder = Arc::new(DashMap::new());
        let applier = Applier {
            notify: notify.clone(),
            reservation_to_resource: reservation_to_resource.clone(),
            by_holder: by_holder.clone(),
        };
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx, applier));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            clock,
            reservation_to_resource,
            by_holder,
            compaction_gate: RwLock::new(()),
        };

        // Sole owner of these Arcs during replay, so try_write never contends.
        // Never blocking_write: this may run inside an async context.
        for event in &replay.events {
            let rs = engine.resource_or_create(event.resource_id());
            let mut guard = rs
                .try_write()
                .map_err(|_| io::Error::other("replay: resource lock contended"))?;
            apply_to_resource(
                &mut guard,
                event,
                &engine.reservation_to_resource,
                &engine.by_holder,
            );
        }
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(engine.state.len() as f64);
        info!(
            "replayed {} events: {} resources, {} reservations",
            replay.events.len(),
            engine.state.len(),
            engine.reservation_to_resource.len()
        );

        Ok(engine)
    }

    pub fn get_resource(&self, id: &ResourceId) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_reservation(&self, id: &ReservationId) -> Option<ResourceId> {
        self.reservation_to_resource.get(id).map(|e| *e.value())
    }

    /// Resources appear on their first admission; the entry API makes that atomic.
    pub(super) fn resource_or_create(&self, id: ResourceId) -> SharedResourceState {
        let mut created = false;
        let rs = self
            .state
            .entry(id)
            .or_insert_with(|| {
                created = true;
                Arc::new(RwLock::new(ResourceState::new(id)))
            })
            .value()
            .clone();
        if created {
            metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(self.state.len() as f64);
        }
        rs
    }

    /// Commit `event` and apply it under `guard`; the change is published only once durable.
    ///
    /// Once the send completes the WAL writer owns the guard and the outcome, so
    /// dropping this future can't leave the log ahead of memory. Dropped before
    /// the send, the guard is released and nothing was written.
    pub(super) async fn persist_and_apply(
        &self,
        guard: OwnedRwLockWriteGuard<ResourceState>,
        event: Event,
    ) -> Result<Reservation, StoreError> {
        let id = event.reservation_id();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append(PendingAppend {
                event,
                guard,
                response: tx,
            }))
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))?
            .ok_or(StoreError::NotFound(id))
    }

    /// Lookup reservation → resource, acquire that resource's write lock.
    pub(super) async fn resolve_write(
        &self,
        id: &ReservationId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ResourceState>, StoreError> {
        let resource_id = self
            .get_resource_for_reservation(id)
            .ok_or(StoreError::NotFound(*id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(StoreError::NotFound(*id))?;
        Ok(rs.write_owned().await)
    }
}

#[async_trait]
impl IntervalStore for Engine {
    async fn find_conflicts(
        &self,
        resource_id: ResourceId,
        slot: Slot,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(Engine::find_conflicts(self, resource_id, slot).await)
    }

    async fn insert_if_free(
        &self,
        resource_id: ResourceId,
        slot: Slot,
        holder_id: HolderId,
    ) -> Result<Reservation, StoreError> {
        Engine::insert_if_free(self, resource_id, slot, holder_id).await
    }

    async fn transition(
        &self,
        id: ReservationId,
        from: ReservationState,
        to: ReservationState,
        expected_version: u64,
        note: TransitionNote,
    ) -> Result<Reservation, StoreError> {
        Engine::transition(self, id, from, to, expected_version, note).await
    }

    async fn get(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        Engine::get(self, id).await
    }
}
