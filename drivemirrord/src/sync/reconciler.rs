use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{error, info};

use super::engine::{EngineError, MirrorEngine, SyncStats};
use super::walker::WalkMode;

/// The later of the watermark and `now - lookback`.
pub fn effective_since(
    watermark: OffsetDateTime,
    now: OffsetDateTime,
    lookback: Duration,
) -> OffsetDateTime {
    let floor = now
        .checked_sub(time::Duration::try_from(lookback).unwrap_or(time::Duration::MAX))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    watermark.max(floor)
}

impl MirrorEngine {
    /// One poll pass over the root.
    pub async fn reconcile_once(&self) -> Result<SyncStats, EngineError> {
        self.reconcile_at(OffsetDateTime::now_utc()).await
    }

    /// Poll pass that treats `started` as the moment the run began. The
    /// watermark advances to `started` only when something was written and
    /// nothing failed.
    pub async fn reconcile_at(&self, started: OffsetDateTime) -> Result<SyncStats, EngineError> {
        let watermark = self.watermark.last_sync().await?;
        let since = effective_since(watermark, started, self.config.poll_lookback);
        let stats = self
            .walk(&self.config.root_id, "", since, WalkMode::Deduplicated)
            .await?;
        let advanced = stats.fail == 0
            && stats.ok > 0
            && self.watermark.advance_last_sync(started).await?;
        info!(
            ok = stats.ok,
            fail = stats.fail,
            folders = stats.folders,
            skipped = stats.skipped,
            abandoned = stats.abandoned,
            since = %since,
            advanced,
            "reconciliation finished"
        );
        Ok(stats)
    }
}

/// Runs a reconciliation every `interval` until the task is aborted.
pub async fn run_poll_loop(engine: Arc<MirrorEngine>, interval: Duration) {
    loop {
        if let Err(err) = engine.reconcile_once().await {
            error!(error = %err, "reconciliation failed");
        }
        tokio::time::sleep(interval).await;
    }
}
