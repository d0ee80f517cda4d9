use std::sync::Arc;

use tracing::info;

use slotkeeper::clock::SystemClock;
use slotkeeper::config::Config;
use slotkeeper::service::BookingService;
use slotkeeper::{compactor, relay};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotkeeper::observability::init(config.metrics_port)?;

    let service = BookingService::open(&config, Arc::new(SystemClock))?;
    let engine = service.engine.clone();
    info!("slotkeeper started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!("  cancel_notice: {}h", config.cancel_notice.num_hours());
    info!("  stale_retries: {}", config.stale_retries);
    info!("  event_log: {}", if config.event_log { "stdout" } else { "disabled" });
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    let compactor = tokio::spawn(async move {
        compactor::run_compactor(compactor_engine, threshold).await;
    });

    let relay = config.event_log.then(|| {
        let relay_engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = relay::run_relay(relay_engine, std::io::stdout()).await {
                tracing::error!("event relay stopped: {e}");
            }
        })
    });

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");

    compactor.abort();
    if let Some(relay) = relay {
        relay.abort();
    }
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final WAL compaction failed: {e}");
    }

    info!("slotkeeper stopped");
    Ok(())
}
