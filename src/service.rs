use std::io;
use std::sync::Arc;

use crate::admission::{AdmissionController, AdmissionError};
use crate::clock::Clock;
use crate::config::Config;
use crate::engine::Engine;
use crate::lifecycle::{LifecycleError, LifecycleManager, retry_on_stale};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::policy::{NoticePeriod, ResourceActiveCheck};

pub const WAL_FILE_NAME: &str = "reservations.wal";

/// One engine with its admission and lifecycle front ends, wired from `Config`.
/// Lifecycle calls retry on `StaleVersion` up to `Config::stale_retries` times.
pub struct BookingService {
    pub engine: Arc<Engine>,
    pub admission: AdmissionController<Engine>,
    pub lifecycle: LifecycleManager<Engine>,
    stale_retries: usize,
}

impl BookingService {
    /// Replay (or create) the WAL under `config.data_dir`.
    pub fn open(config: &Config, clock: Arc<dyn Clock>) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let wal_path = config.data_dir.join(WAL_FILE_NAME);
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()), clock.clone())?);
        Ok(Self::new(engine, clock, config))
    }

    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let policy = Arc::new(NoticePeriod {
            min_notice: config.cancel_notice,
        });
        Self {
            admission: AdmissionController::new(engine.clone(), clock.clone()),
            lifecycle: LifecycleManager::new(engine.clone(), clock, policy),
            engine,
            stale_retries: config.stale_retries,
        }
    }

    pub async fn admit(
        &self,
        resource_id: ResourceId,
        slot: Slot,
        holder_id: HolderId,
        resource_active: &dyn ResourceActiveCheck,
    ) -> Result<Reservation, AdmissionError> {
        self.admission
            .admit(resource_id, slot, holder_id, resource_active)
            .await
    }

    pub async fn confirm(
        &self,
        id: ReservationId,
        actor: ActorId,
    ) -> Result<Reservation, LifecycleError> {
        retry_on_stale(self.stale_retries, || self.lifecycle.confirm(id, actor)).await
    }

    pub async fn complete(
        &self,
        id: ReservationId,
        actor: ActorId,
    ) -> Result<Reservation, LifecycleError> {
        retry_on_stale(self.stale_retries, || self.lifecycle.complete(id, actor)).await
    }

    pub async fn cancel(
        &self,
        id: ReservationId,
        actor: ActorId,
        reason: &str,
    ) -> Result<Reservation, LifecycleError> {
        retry_on_stale(self.stale_retries, || self.lifecycle.cancel(id, actor, reason)).await
    }

    pub async fn admin_cancel(
        &self,
        id: ReservationId,
        admin: ActorId,
        reason: &str,
    ) -> Result<Reservation, LifecycleError> {
        retry_on_stale(self.stale_retries, || {
            self.lifecycle.admin_cancel(id, admin, reason)
        })
        .await
    }

    pub async fn view(
        &self,
        id: ReservationId,
        actor: ActorId,
    ) -> Result<Reservation, LifecycleError> {
        self.lifecycle.view(id, actor).await
    }
}
