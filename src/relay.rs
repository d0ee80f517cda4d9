use std::io::{self, Write};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::model::StateChange;

/// Forward every state change to `out` as one JSON line, at least once.
///
/// Subscribes before taking the startup snapshot so nothing falls between
/// the two. After a lag the current state of every reservation is written
/// again; consumers de-duplicate on `(reservation_id, state)`.
pub async fn run_relay<W: Write>(engine: Arc<Engine>, mut out: W) -> io::Result<()> {
    let mut rx = engine.notify.subscribe_all();

    let snapshot = engine.snapshot_state_changes().await;
    info!("event relay started, re-publishing {} reservations", snapshot.len());
    write_all(&mut out, &snapshot)?;

    loop {
        match rx.recv().await {
            Ok(change) => write_all(&mut out, std::slice::from_ref(&change))?,
            Err(RecvError::Lagged(skipped)) => {
                warn!("event relay lagged by {skipped} changes, re-publishing snapshot");
                metrics::counter!(crate::observability::RELAY_RESYNCS_TOTAL).increment(1);
                let snapshot = engine.snapshot_state_changes().await;
                write_all(&mut out, &snapshot)?;
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

fn write_all<W: Write>(out: &mut W, changes: &[StateChange]) -> io::Result<()> {
    for change in changes {
        serde_json::to_writer(&mut *out, change)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}
