use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::stores::{KeyValueStore, StoreError};

pub const LAST_SYNC_KEY: &str = "last_sync_time";
pub const CHANGE_CURSOR_KEY: &str = "change_cursor";

/// Lowest possible watermark; walking with it visits every node.
pub const EPOCH_FLOOR: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("watermark store error: {0}")]
    Store(#[from] StoreError),
    #[error("stored watermark is not RFC 3339: {0}")]
    Parse(#[from] time::error::Parse),
    #[error("watermark could not be formatted: {0}")]
    Format(#[from] time::error::Format),
}

/// Last-sync timestamp and change cursor over a key-value backend.
///
/// Read-compare-write sequences run under one lock so concurrent walks can
/// only move the timestamp forward.
pub struct WatermarkStore {
    kv: Arc<dyn KeyValueStore>,
    lock: Mutex<()>,
}

impl WatermarkStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
        }
    }

    pub async fn last_sync(&self) -> Result<OffsetDateTime, WatermarkError> {
        self.read_last_sync().await
    }

    /// Moves the watermark to `to` unless it already is at or past it.
    /// Returns whether the stored value changed.
    pub async fn advance_last_sync(&self, to: OffsetDateTime) -> Result<bool, WatermarkError> {
        let _guard = self.lock.lock().await;
        let current = self.read_last_sync().await?;
        if to <= current {
            debug!(current = %current, proposed = %to, "watermark not advanced");
            return Ok(false);
        }
        self.kv.set(LAST_SYNC_KEY, &to.format(&Rfc3339)?).await?;
        debug!(from = %current, to = %to, "watermark advanced");
        Ok(true)
    }

    /// Full resync: the only path allowed to move the watermark backwards.
    pub async fn reset_to_floor(&self) -> Result<(), WatermarkError> {
        let _guard = self.lock.lock().await;
        self.kv
            .set(LAST_SYNC_KEY, &EPOCH_FLOOR.format(&Rfc3339)?)
            .await?;
        self.kv.set(CHANGE_CURSOR_KEY, "").await?;
        info!("watermark reset to epoch floor");
        Ok(())
    }

    pub async fn change_cursor(&self) -> Result<Option<String>, WatermarkError> {
        let value = self.kv.get(CHANGE_CURSOR_KEY).await?;
        Ok(value.filter(|cursor| !cursor.is_empty()))
    }

    pub async fn set_change_cursor(&self, cursor: &str) -> Result<(), WatermarkError> {
        self.kv.set(CHANGE_CURSOR_KEY, cursor).await?;
        Ok(())
    }

    async fn read_last_sync(&self) -> Result<OffsetDateTime, WatermarkError> {
        match self.kv.get(LAST_SYNC_KEY).await? {
            Some(value) if !value.is_empty() => Ok(OffsetDateTime::parse(&value, &Rfc3339)?),
            _ => Ok(EPOCH_FLOOR),
        }
    }
}
