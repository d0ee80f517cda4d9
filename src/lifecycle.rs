//! Lifecycle: confirm, cancel and complete reservations along the closed
//! state graph. Every mutation goes through `IntervalStore::transition` with
//! the version read just before it. A `StaleVersion` is returned to the
//! caller as is; `retry_on_stale` is the bounded way to re-read and retry.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::engine::{IntervalStore, StoreError, TransitionNote};
use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::policy::CancellationPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    NotFound(ReservationId),
    Forbidden {
        actor: ActorId,
    },
    InvalidTransition {
        from: ReservationState,
        to: ReservationState,
    },
    NotCancellable(&'static str),
    StaleVersion {
        expected: u64,
        actual: u64,
    },
    LimitExceeded(&'static str),
    Storage(String),
}

impl LifecycleError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::StaleVersion { .. } | LifecycleError::Storage(_)
        )
    }

    pub fn http_status(&self) -> u16 {
        match self {
            LifecycleError::NotFound(_) => 404,
            LifecycleError::Forbidden { .. } => 403,
            LifecycleError::InvalidTransition { .. } | LifecycleError::NotCancellable(_) => 400,
            LifecycleError::StaleVersion { .. } => 409,
            LifecycleError::LimitExceeded(_) => 400,
            LifecycleError::Storage(_) => 503,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::Forbidden { .. } => "forbidden",
            LifecycleError::InvalidTransition { .. } => "invalid_transition",
            LifecycleError::NotCancellable(_) => "not_cancellable",
            LifecycleError::StaleVersion { .. } => "stale_version",
            LifecycleError::LimitExceeded(_) => "limit_exceeded",
            LifecycleError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::NotFound(id) => write!(f, "reservation not found: {id}"),
            LifecycleError::Forbidden { actor } => {
                write!(f, "actor {actor} may not perform this operation")
            }
            LifecycleError::InvalidTransition { from, to } => {
                write!(f, "cannot move reservation from {from} to {to}")
            }
            LifecycleError::NotCancellable(msg) => write!(f, "not cancellable: {msg}"),
            LifecycleError::StaleVersion { expected, actual } => {
                write!(f, "stale version: expected {expected}, stored {actual}")
            }
            LifecycleError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            LifecycleError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => LifecycleError::NotFound(id),
            StoreError::StaleVersion {
                expected, actual, ..
            } => LifecycleError::StaleVersion { expected, actual },
            StoreError::InvalidTransition { from, to, .. } => {
                LifecycleError::InvalidTransition { from, to }
            }
            StoreError::LimitExceeded(msg) => LifecycleError::LimitExceeded(msg),
            other => LifecycleError::Storage(other.to_string()),
        }
    }
}

pub struct LifecycleManager<S: ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn CancellationPolicy>,
}

impl<S: IntervalStore + ?Sized> LifecycleManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, policy: Arc<dyn CancellationPolicy>) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// Owner accepts a requested booking.
    pub async fn confirm(
        &self,
        id: ReservationId,
        actor: ActorId,
    ) -> Result<Reservation, LifecycleError> {
        let result = self
            .advance(id, actor, ReservationState::Requested, ReservationState::Confirmed)
            .await;
        record("confirm", &result);
        result
    }

    /// Owner marks a confirmed booking as done. Clock ordering is the caller's call.
    pub async fn complete(
        &self,
        id: ReservationId,
        actor: ActorId,
    ) -> Result<Reservation, LifecycleError> {
        let result = self
            .advance(id, actor, ReservationState::Confirmed, ReservationState::Completed)
            .await;
        record("complete", &result);
        result
    }

    /// Holder or owner cancels. A holder cancelling a confirmed booking is
    /// subject to the cancellation policy; the owner never is.
    pub async fn cancel(
        &self,
        id: ReservationId,
        actor: ActorId,
        reason: &str,
    ) -> Result<Reservation, LifecycleError> {
        let result = self.try_cancel(id, actor, reason).await;
        record("cancel", &result);
        result
    }

    /// Administrative cancellation. Same edges as `cancel`, no policy check,
    /// recorded as `CancelledBy::Admin`. Authenticating `admin` is the caller's job.
    pub async fn admin_cancel(
        &self,
        id: ReservationId,
        admin: ActorId,
        reason: &str,
    ) -> Result<Reservation, LifecycleError> {
        let result = self.try_admin_cancel(id, reason).await;
        if result.is_ok() {
            info!(%id, %admin, reason, "reservation cancelled by admin");
        }
        record("admin_cancel", &result);
        result
    }

    /// Read a reservation on behalf of its holder or owner.
    pub async fn view(
        &self,
        id: ReservationId,
        actor: ActorId,
    ) -> Result<Reservation, LifecycleError> {
        let current = self.store.get(id).await?;
        if actor != current.holder_id && actor != current.resource_id {
            return Err(LifecycleError::Forbidden { actor });
        }
        Ok(current)
    }

    async fn advance(
        &self,
        id: ReservationId,
        actor: ActorId,
        from: ReservationState,
        to: ReservationState,
    ) -> Result<Reservation, LifecycleError> {
        let current = self.store.get(id).await?;
        if actor != current.resource_id {
            return Err(LifecycleError::Forbidden { actor });
        }
        if current.state != from {
            return Err(LifecycleError::InvalidTransition {
                from: current.state,
                to,
            });
        }
        Ok(self
            .store
            .transition(id, from, to, current.version, TransitionNote::default())
            .await?)
    }

    async fn try_cancel(
        &self,
        id: ReservationId,
        actor: ActorId,
        reason: &str,
    ) -> Result<Reservation, LifecycleError> {
        let current = self.store.get(id).await?;
        // An owner booking their own resource acts as owner.
        let by = if actor == current.resource_id {
            CancelledBy::Owner
        } else if actor == current.holder_id {
            CancelledBy::Holder
        } else {
            return Err(LifecycleError::Forbidden { actor });
        };
        ensure_cancellable(&current)?;
        if by == CancelledBy::Holder
            && current.state == ReservationState::Confirmed
            && !self.policy.allows(&current.slot, self.clock.now())
        {
            return Err(LifecycleError::NotCancellable(
                "inside the cancellation notice period",
            ));
        }
        self.cancel_as(&current, by, reason).await
    }

    async fn try_admin_cancel(
        &self,
        id: ReservationId,
        reason: &str,
    ) -> Result<Reservation, LifecycleError> {
        let current = self.store.get(id).await?;
        ensure_cancellable(&current)?;
        self.cancel_as(&current, CancelledBy::Admin, reason).await
    }

    async fn cancel_as(
        &self,
        current: &Reservation,
        by: CancelledBy,
        reason: &str,
    ) -> Result<Reservation, LifecycleError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(LifecycleError::LimitExceeded("cancellation reason too long"));
        }
        let note = TransitionNote {
            reason: (!reason.is_empty()).then(|| reason.to_string()),
            cancelled_by: Some(by),
        };
        Ok(self
            .store
            .transition(
                current.id,
                current.state,
                ReservationState::Cancelled,
                current.version,
                note,
            )
            .await?)
    }
}

fn ensure_cancellable(current: &Reservation) -> Result<(), LifecycleError> {
    match current.state {
        ReservationState::Requested | ReservationState::Confirmed => Ok(()),
        ReservationState::Completed => Err(LifecycleError::NotCancellable("reservation is completed")),
        ReservationState::Cancelled => {
            Err(LifecycleError::NotCancellable("reservation is already cancelled"))
        }
    }
}

fn record(op: &'static str, result: &Result<Reservation, LifecycleError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.outcome(),
    };
    metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "op" => op, "outcome" => outcome)
        .increment(1);
}

/// Run `op` again while it fails with `StaleVersion`, at most `max_attempts`
/// calls in total. `op` must re-read the reservation on every call, which all
/// `LifecycleManager` operations do. Any other error is returned at once.
pub async fn retry_on_stale<T, F, Fut>(max_attempts: usize, mut op: F) -> Result<T, LifecycleError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LifecycleError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(LifecycleError::StaleVersion { .. }) if attempt < max_attempts => {
                metrics::counter!(crate::observability::STALE_RETRIES_TOTAL).increment(1);
                attempt += 1;
            }
            other => return other,
        }
    }
}
