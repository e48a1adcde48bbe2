use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};

/// Background task that periodically expires stale pending reservations
/// (and completes past confirmed ones when the engine is set to).
///
/// Stops when `cancel` fires. A sweep already committing runs to the end,
/// since each per-property commit owns its locks in its own task.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let report = engine.sweep(now_ms()).await;
                debug!(
                    expired = report.expired,
                    completed = report.completed,
                    failed = report.failed,
                    "sweep tick"
                );
            }
        }
    }
    info!("sweeper stopped");
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let appends = engine.wal_appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match engine.compact_wal().await {
                    Ok(()) => debug!(appends, "compacted WAL"),
                    Err(e) => warn!(error = %e, "WAL compaction failed"),
                }
            }
        }
    }
    info!("compactor stopped");
}
