use drivemirror_core::{NodeKind, SourceNode};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::engine::{EngineError, MirrorEngine, SyncStats};
use super::paths::{folder_prefix, mirror_key, prefix_from_ancestors};
use super::retry::{ChangePayload, RetryRecord};
use super::walker::WalkMode;
use super::watermark::EPOCH_FLOOR;

/// Ancestor hops tolerated before a node is treated as outside the root.
const MAX_ANCESTOR_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Add,
    Update,
    Change,
    Trashed,
    Other(String),
}

impl ResourceState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "add" => ResourceState::Add,
            "update" => ResourceState::Update,
            "change" => ResourceState::Change,
            "trash" | "trashed" => ResourceState::Trashed,
            _ => ResourceState::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ResourceState::Add => "add",
            ResourceState::Update => "update",
            ResourceState::Change => "change",
            ResourceState::Trashed => "trashed",
            ResourceState::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification is missing a resource id")]
    MissingResourceId,
    #[error("notification is missing a resource state")]
    MissingState,
}

/// One push notification, validated at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub resource_id: String,
    pub state: ResourceState,
    pub channel_id: Option<String>,
    pub message_number: Option<u64>,
}

impl Notification {
    pub fn new(
        resource_id: Option<&str>,
        state: Option<&str>,
    ) -> Result<Self, NotificationError> {
        let resource_id = resource_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(NotificationError::MissingResourceId)?;
        let state = state
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(NotificationError::MissingState)?;
        Ok(Self {
            resource_id: resource_id.to_string(),
            state: ResourceState::parse(state),
            channel_id: None,
            message_number: None,
        })
    }

    pub fn with_channel(mut self, channel_id: Option<String>, message_number: Option<u64>) -> Self {
        self.channel_id = channel_id;
        self.message_number = message_number;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Applied(SyncStats),
    /// The signature was admitted recently; nothing was done.
    Duplicate,
    /// The state carries no change to apply.
    Ignored,
    /// Processing failed and a retry record was queued.
    Deferred,
    /// Processing failed in a way no retry can fix.
    Abandoned,
}

impl MirrorEngine {
    /// Processes an already-acknowledged notification to completion. Failures
    /// never escape; transient ones become retry records.
    pub async fn handle_notification(&self, notification: Notification) -> NotificationOutcome {
        if let ResourceState::Other(raw) = &notification.state {
            debug!(
                resource = %notification.resource_id,
                state = %raw,
                channel = ?notification.channel_id,
                "notification ignored"
            );
            return NotificationOutcome::Ignored;
        }

        let signature = self
            .dedup
            .signature_for(&notification.resource_id, OffsetDateTime::now_utc());
        if !self.dedup.should_process(&signature) {
            debug!(
                resource = %notification.resource_id,
                state = notification.state.as_str(),
                message = ?notification.message_number,
                "duplicate notification suppressed"
            );
            return NotificationOutcome::Duplicate;
        }

        let payload = ChangePayload::new(notification.resource_id, notification.state);
        match self.process_payload(&payload).await {
            Ok(stats) => {
                info!(
                    resource = %payload.node_id,
                    state = payload.state.as_str(),
                    ok = stats.ok,
                    fail = stats.fail,
                    folders = stats.folders,
                    "notification applied"
                );
                NotificationOutcome::Applied(stats)
            }
            Err(err) if err.is_permanent() => {
                error!(
                    resource = %payload.node_id,
                    state = payload.state.as_str(),
                    error = %err,
                    "notification cannot be applied, abandoned"
                );
                NotificationOutcome::Abandoned
            }
            Err(err) => {
                warn!(
                    resource = %payload.node_id,
                    state = payload.state.as_str(),
                    error = %err,
                    "notification failed, queued for retry"
                );
                self.retries.enqueue(RetryRecord::new(signature, payload));
                NotificationOutcome::Deferred
            }
        }
    }

    pub async fn process_payload(&self, payload: &ChangePayload) -> Result<SyncStats, EngineError> {
        match &payload.state {
            ResourceState::Add | ResourceState::Update | ResourceState::Trashed => {
                self.apply_node_change(&payload.node_id).await
            }
            ResourceState::Change if self.feed.is_some() => self.drain_change_feed().await,
            ResourceState::Change => self.apply_node_change(&payload.node_id).await,
            ResourceState::Other(_) => Ok(SyncStats::default()),
        }
    }

    /// Brings the mirror in line with the current snapshot of one node.
    pub async fn apply_node_change(&self, node_id: &str) -> Result<SyncStats, EngineError> {
        if node_id == self.config.root_id {
            let stats = self
                .walk(node_id, "", EPOCH_FLOOR, WalkMode::Direct)
                .await?;
            return complete(node_id, stats);
        }

        let node = match self.tree.get_node(node_id).await {
            Ok(node) => node,
            Err(err) if err.is_not_found() => {
                info!(node = node_id, "node no longer exists at source");
                return Ok(SyncStats::default());
            }
            Err(err) => return Err(err.into()),
        };
        let Some(prefix) = self.resolve_prefix(&node).await? else {
            debug!(node = node_id, name = %node.name, "node is outside the mirrored root");
            return Ok(SyncStats::default());
        };

        if node.trashed {
            let key = mirror_key(&prefix, &node)?;
            let existed = self.objects.delete(&key).await?;
            info!(node = node_id, key = %key, existed, "trashed node removed from mirror");
            return Ok(SyncStats::succeeded(1));
        }

        match node.kind() {
            NodeKind::Folder => {
                let stats = self
                    .walk(
                        &node.id,
                        &folder_prefix(&prefix, &node.name),
                        EPOCH_FLOOR,
                        WalkMode::Direct,
                    )
                    .await?;
                complete(node_id, stats)
            }
            NodeKind::Leaf => {
                self.mirror_leaf(&node, &prefix).await?;
                Ok(SyncStats::succeeded(1))
            }
        }
    }

    /// Prefix of `node`'s parent relative to the root, or `None` when the
    /// parent chain never reaches the root.
    async fn resolve_prefix(&self, node: &SourceNode) -> Result<Option<String>, EngineError> {
        let mut names = Vec::new();
        let mut parent = node.parent_id().map(str::to_string);
        for _ in 0..MAX_ANCESTOR_DEPTH {
            let Some(parent_id) = parent else {
                return Ok(None);
            };
            if parent_id == self.config.root_id {
                return Ok(Some(prefix_from_ancestors(
                    names.iter().rev().map(String::as_str),
                )));
            }
            let ancestor = match self.tree.get_node(&parent_id).await {
                Ok(ancestor) => ancestor,
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            names.push(ancestor.name.clone());
            parent = ancestor.parent_id().map(str::to_string);
        }
        warn!(node = %node.id, "ancestor chain too deep, treating as outside root");
        Ok(None)
    }

    /// Applies every change after the persisted cursor. The cursor moves only
    /// past pages whose changes all applied or failed permanently; a change
    /// that may still succeed holds the cursor and is queued for retry once.
    pub async fn drain_change_feed(&self) -> Result<SyncStats, EngineError> {
        let Some(feed) = self.feed.as_ref() else {
            return Ok(SyncStats::default());
        };
        let _guard = self.feed_lock.lock().await;

        let mut cursor = match self.watermark.change_cursor().await? {
            Some(cursor) => cursor,
            None => {
                let start = feed.start_cursor().await?;
                self.watermark.set_change_cursor(&start).await?;
                info!(cursor = %start, "change cursor initialised");
                return Ok(SyncStats::default());
            }
        };

        let mut stats = SyncStats::default();
        loop {
            let page = feed.list_changes(&cursor).await?;
            let mut page_failed = 0u64;
            for change in &page.changes {
                match self.apply_node_change(&change.file_id).await {
                    Ok(applied) => stats.absorb(applied),
                    Err(err) if err.is_permanent() => {
                        stats.abandoned += 1;
                        error!(node = %change.file_id, removed = change.removed, error = %err, "change cannot be applied, abandoned");
                    }
                    Err(err) => {
                        page_failed += 1;
                        let queued = self.queue_change_retry(&change.file_id);
                        warn!(node = %change.file_id, removed = change.removed, queued, error = %err, "change failed");
                    }
                }
            }
            stats.fail += page_failed;

            if page_failed > 0 {
                warn!(cursor = %cursor, failed = page_failed, "change cursor held at failed page");
                break;
            }
            self.watermark.set_change_cursor(&page.next_cursor).await?;
            cursor = page.next_cursor;
            if !page.has_more {
                break;
            }
        }

        info!(
            cursor = %cursor,
            ok = stats.ok,
            fail = stats.fail,
            abandoned = stats.abandoned,
            "change feed drained"
        );
        Ok(stats)
    }

    /// Queues a retry for one feed change unless one was queued for it within
    /// the dedup window.
    fn queue_change_retry(&self, node_id: &str) -> bool {
        let signature = self.dedup.signature_for(node_id, OffsetDateTime::now_utc());
        if !self.dedup.should_process(&signature) {
            debug!(node = node_id, "retry already pending for change");
            return false;
        }
        let payload = ChangePayload::new(node_id, ResourceState::Update);
        self.retries.enqueue(RetryRecord::new(signature, payload))
    }
}

fn complete(node_id: &str, stats: SyncStats) -> Result<SyncStats, EngineError> {
    if stats.fail > 0 {
        return Err(EngineError::Incomplete {
            node_id: node_id.to_string(),
            failed: stats.fail,
        });
    }
    Ok(stats)
}

#[cfg(test)]
#[path = "webhook_tests.rs"]
mod tests;
