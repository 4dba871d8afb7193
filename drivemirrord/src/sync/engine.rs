use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::info;

use super::dedup::ChangeDeduplicator;
use super::paths::PathError;
use super::retry::RetryQueue;
use super::stores::{ChangeFeed, ObjectStore, StoreError, TreeStore};
use super::walker::WalkMode;
use super::watermark::{WatermarkError, WatermarkStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("watermark error: {0}")]
    Watermark(#[from] WatermarkError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("{failed} item(s) under {node_id} failed to mirror")]
    Incomplete { node_id: String, failed: u64 },
}

impl EngineError {
    /// A permanent failure recurs on every replay of the same change, so it is
    /// logged and dropped instead of retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            EngineError::Path(_) => true,
            EngineError::Store(err) => err.is_permanent(),
            EngineError::Watermark(_) | EngineError::Incomplete { .. } => false,
        }
    }
}

/// Counters for one walk or one applied change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub ok: u64,
    /// Items that may succeed on a later run.
    pub fail: u64,
    pub folders: u64,
    pub skipped: u64,
    /// Items that can never be mirrored, such as unexportable native types.
    pub abandoned: u64,
}

impl SyncStats {
    pub fn succeeded(count: u64) -> Self {
        Self {
            ok: count,
            ..Self::default()
        }
    }

    pub fn absorb(&mut self, other: SyncStats) {
        self.ok += other.ok;
        self.fail += other.fail;
        self.folders += other.folders;
        self.skipped += other.skipped;
        self.abandoned += other.abandoned;
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub root_id: String,
    pub walk_concurrency: usize,
    pub poll_lookback: Duration,
}

impl EngineConfig {
    pub fn new(root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            walk_concurrency: 4,
            poll_lookback: Duration::from_secs(300),
        }
    }
}

pub struct MirrorEngine {
    pub(super) tree: Arc<dyn TreeStore>,
    pub(super) objects: Arc<dyn ObjectStore>,
    pub(super) feed: Option<Arc<dyn ChangeFeed>>,
    pub(super) watermark: WatermarkStore,
    pub(super) dedup: Arc<ChangeDeduplicator>,
    pub(super) retries: RetryQueue,
    pub(super) feed_lock: Mutex<()>,
    pub(super) config: EngineConfig,
}

impl MirrorEngine {
    pub fn new(
        tree: Arc<dyn TreeStore>,
        objects: Arc<dyn ObjectStore>,
        watermark: WatermarkStore,
        dedup: Arc<ChangeDeduplicator>,
        retries: RetryQueue,
        config: EngineConfig,
    ) -> Self {
        Self {
            tree,
            objects,
            feed: None,
            watermark,
            dedup,
            retries,
            feed_lock: Mutex::new(()),
            config,
        }
    }

    pub fn with_change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn watermark(&self) -> &WatermarkStore {
        &self.watermark
    }

    pub fn deduplicator(&self) -> &Arc<ChangeDeduplicator> {
        &self.dedup
    }

    pub fn retries(&self) -> &RetryQueue {
        &self.retries
    }

    /// Manual trigger: walks the root from the persisted watermark. A run with
    /// any failed item leaves the watermark alone so the next run revisits it.
    pub async fn sync_manual(&self) -> Result<SyncStats, EngineError> {
        let started = OffsetDateTime::now_utc();
        let since = self.watermark.last_sync().await?;
        let stats = self
            .walk(&self.config.root_id, "", since, WalkMode::Direct)
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
            "manual sync finished"
        );
        Ok(stats)
    }

    /// Resets the watermark to the epoch floor and mirrors the whole tree.
    pub async fn full_resync(&self) -> Result<SyncStats, EngineError> {
        self.watermark.reset_to_floor().await?;
        self.sync_manual().await
    }
}
