use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Engine, now_ms};
use crate::store::{MemoryStore, StoreError};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL once it has grown by `threshold` appends.
/// Returns the number of records written, or `None` if below threshold.
pub async fn compact_if_needed(store: &MemoryStore, threshold: u64) -> Result<Option<usize>, StoreError> {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return Ok(None);
    }
    let records = store.compact().await?;
    info!(appends, records, "WAL compacted");
    Ok(Some(records))
}

/// Background task that keeps the WAL bounded.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// Background task that marks ended bookings completed.
pub async fn run_completion_sweep(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = engine.complete_expired(now_ms()).await {
            warn!("completion sweep failed: {e}");
        }
    }
}
