//! In-memory stand-ins for the external stores, shared by engine tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drivemirror_core::{ChangePage, ChangeRecord, FOLDER_MIME_TYPE, SourceNode};
use parking_lot::Mutex;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use time::macros::datetime;
use tokio::sync::mpsc;

use super::dedup::ChangeDeduplicator;
use super::engine::{EngineConfig, MirrorEngine};
use super::kv_store::SqliteKvStore;
use super::retry::{RetryQueue, RetryRecord};
use super::stores::{ChangeFeed, ObjectStore, StoreError, TreeStore};
use super::watermark::WatermarkStore;

pub const ROOT: &str = "root";
pub const OLD: OffsetDateTime = datetime!(2024-01-01 00:00 UTC);
pub const WATERMARK: OffsetDateTime = datetime!(2024-02-01 00:00 UTC);
pub const NEW: OffsetDateTime = datetime!(2024-03-01 00:00 UTC);

#[derive(Default)]
pub struct FakeTree {
    nodes: Mutex<BTreeMap<String, SourceNode>>,
    contents: Mutex<HashMap<String, Vec<u8>>>,
    failing_fetch: Mutex<HashSet<String>>,
    failing_list: Mutex<HashSet<String>>,
    pub list_calls: Mutex<Vec<(String, Option<OffsetDateTime>)>>,
}

impl FakeTree {
    pub fn folder(&self, id: &str, name: &str, parent: &str, modified: OffsetDateTime) {
        self.insert(id, name, FOLDER_MIME_TYPE, parent, modified);
    }

    pub fn file(&self, id: &str, name: &str, parent: &str, modified: OffsetDateTime) {
        self.insert(id, name, "text/plain", parent, modified);
        self.contents
            .lock()
            .insert(id.to_string(), format!("content of {name}").into_bytes());
    }

    pub fn typed_file(&self, id: &str, name: &str, mime: &str, parent: &str, modified: OffsetDateTime) {
        self.insert(id, name, mime, parent, modified);
        self.contents.lock().insert(id.to_string(), name.as_bytes().to_vec());
    }

    pub fn trash(&self, id: &str) {
        if let Some(node) = self.nodes.lock().get_mut(id) {
            node.trashed = true;
        }
    }

    pub fn fail_fetch(&self, id: &str) {
        self.failing_fetch.lock().insert(id.to_string());
    }

    pub fn heal_fetch(&self) {
        self.failing_fetch.lock().clear();
    }

    pub fn fail_list(&self, id: &str) {
        self.failing_list.lock().insert(id.to_string());
    }

    pub fn listed_parents(&self) -> Vec<String> {
        self.list_calls.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    fn insert(&self, id: &str, name: &str, mime: &str, parent: &str, modified: OffsetDateTime) {
        self.nodes.lock().insert(
            id.to_string(),
            SourceNode {
                id: id.to_string(),
                name: name.to_string(),
                mime_type: mime.to_string(),
                modified_time: modified,
                parents: vec![parent.to_string()],
                trashed: false,
            },
        );
    }
}

#[async_trait]
impl TreeStore for FakeTree {
    async fn list_children(
        &self,
        parent_id: &str,
        modified_after: Option<OffsetDateTime>,
    ) -> Result<Vec<SourceNode>, StoreError> {
        self.list_calls
            .lock()
            .push((parent_id.to_string(), modified_after));
        if self.failing_list.lock().contains(parent_id) {
            return Err(StoreError::Unavailable(format!("list {parent_id}")));
        }
        Ok(self
            .nodes
            .lock()
            .values()
            .filter(|node| node.parent_id() == Some(parent_id) && !node.trashed)
            .filter(|node| modified_after.is_none_or(|after| node.modified_time > after))
            .cloned()
            .collect())
    }

    async fn get_node(&self, node_id: &str) -> Result<SourceNode, StoreError> {
        self.nodes
            .lock()
            .get(node_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(node_id.to_string()))
    }

    async fn fetch_content(
        &self,
        node_id: &str,
        _export_mime: Option<&str>,
    ) -> Result<Vec<u8>, StoreError> {
        if self.failing_fetch.lock().contains(node_id) {
            return Err(StoreError::Unavailable(format!("fetch {node_id}")));
        }
        Ok(self
            .contents
            .lock()
            .get(node_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeObjects {
    objects: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
    pub writes: Mutex<Vec<String>>,
    pub deletes: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeObjects {
    pub fn put(&self, key: &str, body: &[u8]) {
        self.objects
            .lock()
            .insert(key.to_string(), (body.to_vec(), "text/plain".into()));
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).map(|(body, _)| body.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().get(key).map(|(_, ct)| ct.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn fail_writes_to(&self, key: &str) {
        self.failing.lock().insert(key.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }
}

#[async_trait]
impl ObjectStore for FakeObjects {
    async fn write(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        if self.failing.lock().contains(key) {
            return Err(StoreError::Unavailable(format!("write {key}")));
        }
        self.writes.lock().push(key.to_string());
        self.objects
            .lock()
            .insert(key.to_string(), (body, content_type.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.deletes.lock().push(key.to_string());
        Ok(self.objects.lock().remove(key).is_some())
    }
}

pub struct FakeFeed {
    pub start: String,
    pages: Mutex<HashMap<String, ChangePage>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeFeed {
    pub fn new(start: &str) -> Self {
        Self {
            start: start.to_string(),
            pages: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn page(&self, cursor: &str, file_ids: &[&str], next: &str, has_more: bool) {
        self.pages.lock().insert(
            cursor.to_string(),
            ChangePage {
                changes: file_ids
                    .iter()
                    .map(|id| ChangeRecord {
                        file_id: id.to_string(),
                        removed: false,
                    })
                    .collect(),
                next_cursor: next.to_string(),
                has_more,
            },
        );
    }

    pub fn fail_at(&self, cursor: &str) {
        self.failing.lock().insert(cursor.to_string());
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn start_cursor(&self) -> Result<String, StoreError> {
        Ok(self.start.clone())
    }

    async fn list_changes(&self, cursor: &str) -> Result<ChangePage, StoreError> {
        if self.failing.lock().contains(cursor) {
            return Err(StoreError::Unavailable(format!("changes {cursor}")));
        }
        Ok(self
            .pages
            .lock()
            .get(cursor)
            .cloned()
            .unwrap_or_else(|| ChangePage {
                changes: Vec::new(),
                next_cursor: cursor.to_string(),
                has_more: false,
            }))
    }
}

pub struct Harness {
    pub engine: Arc<MirrorEngine>,
    pub tree: Arc<FakeTree>,
    pub objects: Arc<FakeObjects>,
    pub retry_rx: mpsc::Receiver<RetryRecord>,
}

impl Harness {
    pub fn drain_retries(&mut self) -> Vec<RetryRecord> {
        let mut records = Vec::new();
        while let Ok(record) = self.retry_rx.try_recv() {
            records.push(record);
        }
        records
    }
}

pub async fn harness() -> Harness {
    build_harness(None).await
}

pub async fn harness_with_feed(feed: Arc<FakeFeed>) -> Harness {
    build_harness(Some(feed)).await
}

async fn build_harness(feed: Option<Arc<FakeFeed>>) -> Harness {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let kv = SqliteKvStore::from_pool(pool);
    kv.init().await.unwrap();

    let tree = Arc::new(FakeTree::default());
    let objects = Arc::new(FakeObjects::default());
    let dedup = Arc::new(ChangeDeduplicator::new(
        Duration::from_secs(300),
        Duration::from_secs(86_400),
    ));
    let (retries, retry_rx) = RetryQueue::channel(64);
    let mut engine = MirrorEngine::new(
        tree.clone(),
        objects.clone(),
        WatermarkStore::new(Arc::new(kv)),
        dedup,
        retries,
        EngineConfig::new(ROOT),
    );
    if let Some(feed) = feed {
        engine = engine.with_change_feed(feed);
    }

    Harness {
        engine: Arc::new(engine),
        tree,
        objects,
        retry_rx,
    }
}
