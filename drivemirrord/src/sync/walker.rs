use drivemirror_core::{NodeKind, SourceNode};
use futures_util::{StreamExt, stream};
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use super::engine::{EngineError, MirrorEngine, SyncStats};
use super::paths::{folder_prefix, leaf_target, placeholder_key};
use super::retry::{ChangePayload, RetryRecord};
use super::webhook::ResourceState;

/// Whether leaf writes consult the change deduplicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    /// Manual and webhook-subtree walks write every changed leaf.
    Direct,
    /// Poll walks skip leaves whose signature was admitted recently and queue
    /// a retry for each leaf that fails.
    Deduplicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafOutcome {
    Written,
    Skipped,
}

struct PendingFolder {
    id: String,
    prefix: String,
}

impl MirrorEngine {
    /// Mirrors everything under `node_id` modified after `since`.
    ///
    /// Only a failure to list `node_id` itself is returned as an error; every
    /// descendant failure is counted in `fail` (or `abandoned` when it can
    /// never succeed) and the walk carries on.
    pub async fn walk(
        &self,
        node_id: &str,
        prefix: &str,
        since: OffsetDateTime,
        mode: WalkMode,
    ) -> Result<SyncStats, EngineError> {
        let mut stats = SyncStats::default();
        let mut pending = Vec::new();

        let children = self.changed_children(node_id, since).await?;
        self.visit_folder(node_id, prefix, children, mode, &mut stats, &mut pending)
            .await;

        while let Some(folder) = pending.pop() {
            stats.folders += 1;
            match self.changed_children(&folder.id, since).await {
                Ok(children) => {
                    self.visit_folder(
                        &folder.id,
                        &folder.prefix,
                        children,
                        mode,
                        &mut stats,
                        &mut pending,
                    )
                    .await;
                }
                Err(err) => {
                    stats.fail += 1;
                    warn!(folder = %folder.id, prefix = %folder.prefix, error = %err, "folder listing failed");
                }
            }
        }

        debug!(
            node = node_id,
            prefix,
            ok = stats.ok,
            fail = stats.fail,
            folders = stats.folders,
            skipped = stats.skipped,
            abandoned = stats.abandoned,
            "walk finished"
        );
        Ok(stats)
    }

    /// Fetches a leaf and writes it to its mirror key in a single call.
    pub async fn mirror_leaf(&self, node: &SourceNode, prefix: &str) -> Result<(), EngineError> {
        let target = leaf_target(prefix, node)?;
        let export_mime = target.export.map(|export| export.mime_type);
        let body = self.tree.fetch_content(&node.id, export_mime).await?;
        let size = body.len();
        self.objects
            .write(&target.key, body, &target.content_type)
            .await?;
        debug!(node = %node.id, key = %target.key, size, "leaf mirrored");
        Ok(())
    }

    async fn changed_children(
        &self,
        node_id: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<SourceNode>, EngineError> {
        let mut children = self.tree.list_children(node_id, Some(since)).await?;
        children.retain(|child| !child.trashed && child.modified_time > since);
        Ok(children)
    }

    async fn visit_folder(
        &self,
        folder_id: &str,
        prefix: &str,
        children: Vec<SourceNode>,
        mode: WalkMode,
        stats: &mut SyncStats,
        pending: &mut Vec<PendingFolder>,
    ) {
        if children.is_empty() {
            match self.write_placeholder_if_empty(folder_id, prefix).await {
                Ok(true) => stats.ok += 1,
                Ok(false) => {}
                Err(err) => {
                    stats.fail += 1;
                    warn!(folder = folder_id, prefix, error = %err, "placeholder write failed");
                }
            }
            return;
        }

        let (folders, leaves): (Vec<_>, Vec<_>) = children
            .into_iter()
            .partition(|child| child.kind() == NodeKind::Folder);

        // Reversed so the first listed folder is popped first.
        for folder in folders.into_iter().rev() {
            pending.push(PendingFolder {
                prefix: folder_prefix(prefix, &folder.name),
                id: folder.id,
            });
        }

        let outcomes: Vec<_> = stream::iter(leaves)
            .map(|leaf| async move {
                let outcome = self.process_leaf(&leaf, prefix, mode).await;
                (leaf, outcome)
            })
            .buffer_unordered(self.config.walk_concurrency.max(1))
            .collect()
            .await;

        for (leaf, outcome) in outcomes {
            match outcome {
                Ok(LeafOutcome::Written) => stats.ok += 1,
                Ok(LeafOutcome::Skipped) => stats.skipped += 1,
                Err(err) if err.is_permanent() => {
                    stats.abandoned += 1;
                    error!(node = %leaf.id, name = %leaf.name, prefix, error = %err, "leaf cannot be mirrored, abandoned");
                }
                Err(err) => {
                    stats.fail += 1;
                    warn!(node = %leaf.id, name = %leaf.name, prefix, error = %err, "leaf mirror failed");
                }
            }
        }
    }

    async fn process_leaf(
        &self,
        leaf: &SourceNode,
        prefix: &str,
        mode: WalkMode,
    ) -> Result<LeafOutcome, EngineError> {
        let signature = match mode {
            WalkMode::Direct => None,
            WalkMode::Deduplicated => {
                let signature = self
                    .dedup
                    .signature_for(&leaf.id, OffsetDateTime::now_utc());
                if !self.dedup.should_process(&signature) {
                    debug!(node = %leaf.id, "leaf skipped, change already in flight");
                    return Ok(LeafOutcome::Skipped);
                }
                Some(signature)
            }
        };
        if let Err(err) = self.mirror_leaf(leaf, prefix).await {
            // The admission above would hide this leaf from the next poll.
            if let Some(signature) = signature.filter(|_| !err.is_permanent()) {
                let payload = ChangePayload::new(leaf.id.clone(), ResourceState::Update);
                self.retries.enqueue(RetryRecord::new(signature, payload));
            }
            return Err(err);
        }
        Ok(LeafOutcome::Written)
    }

    /// Writes `<prefix>__placeholder` when the folder has no children at all.
    async fn write_placeholder_if_empty(
        &self,
        folder_id: &str,
        prefix: &str,
    ) -> Result<bool, EngineError> {
        let all_children = self.tree.list_children(folder_id, None).await?;
        if all_children.iter().any(|child| !child.trashed) {
            return Ok(false);
        }
        let key = placeholder_key(prefix);
        self.objects
            .write(&key, Vec::new(), "application/x-empty")
            .await?;
        debug!(folder = folder_id, key = %key, "placeholder written");
        Ok(true)
    }
}

#[cfg(test)]
#[path = "walker_tests.rs"]
mod tests;
