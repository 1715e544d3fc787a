//! Periodic purge of expired idempotency mappings.
//!
//! Expired mappings are already ignored (and overwritten) by `reserve`;
//! this only keeps the table from growing without bound.

use std::sync::Arc;
use std::time::Duration;

use conductor_core::clock::Clock;
use conductor_db::IdempotencyStore;
use tokio_util::sync::CancellationToken;

/// How often the purge runs.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Run the purge loop until `cancel` is triggered.
pub async fn run_idempotency_purge(
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = every.as_secs(), "Idempotency purge job started");
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Idempotency purge job stopping");
                break;
            }
            _ = interval.tick() => {
                match store.purge_expired(clock.now()).await {
                    Ok(0) => tracing::debug!("Idempotency purge: nothing expired"),
                    Ok(purged) => tracing::info!(purged, "Idempotency purge: removed expired keys"),
                    Err(e) => tracing::error!(error = %e, "Idempotency purge failed"),
                }
            }
        }
    }
}
