use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{now_ms, Engine};

/// Periodic storage hygiene: move lapsed holds to expired and drop stale
/// cache entries. Correctness never depends on this running; readers treat
/// lapsed holds as free on their own.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let now = now_ms();
        let expired = engine.expire_due_holds(now).await;
        if expired > 0 {
            info!("reaped {expired} expired holds");
        }
        let purged = engine.cache().purge_expired(now);
        if purged > 0 {
            debug!("purged {purged} stale cache entries");
        }
    }
    debug!("reaper stopped");
}

/// Compact the WAL whenever enough appends have accumulated since the last
/// compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
    debug!("compactor stopped");
}
