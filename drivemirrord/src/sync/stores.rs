use async_trait::async_trait;
use drivemirror_core::{
    BucketClient, BucketError, ChangePage, DriveClient, DriveError, SourceNode,
};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tree store error: {0}")]
    Tree(#[from] DriveError),
    #[error("object store error: {0}")]
    Object(#[from] BucketError),
    #[error("watermark store error: {0}")]
    Kv(#[from] sqlx::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Tree(err) => err.is_not_found(),
            _ => false,
        }
    }

    pub fn is_permanent(&self) -> bool {
        match self {
            StoreError::Tree(err) => err.is_permanent(),
            StoreError::Object(err) => err.is_permanent(),
            _ => false,
        }
    }
}

/// Read access to the source tree.
#[async_trait]
pub trait TreeStore: Send + Sync {
    async fn list_children(
        &self,
        parent_id: &str,
        modified_after: Option<OffsetDateTime>,
    ) -> Result<Vec<SourceNode>, StoreError>;

    async fn get_node(&self, node_id: &str) -> Result<SourceNode, StoreError>;

    async fn fetch_content(
        &self,
        node_id: &str,
        export_mime: Option<&str>,
    ) -> Result<Vec<u8>, StoreError>;
}

/// Write access to the mirror bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn write(&self, key: &str, body: Vec<u8>, content_type: &str)
    -> Result<(), StoreError>;

    /// Returns `false` when the object did not exist.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn start_cursor(&self) -> Result<String, StoreError>;

    async fn list_changes(&self, cursor: &str) -> Result<ChangePage, StoreError>;
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl TreeStore for DriveClient {
    async fn list_children(
        &self,
        parent_id: &str,
        modified_after: Option<OffsetDateTime>,
    ) -> Result<Vec<SourceNode>, StoreError> {
        Ok(DriveClient::list_children(self, parent_id, modified_after).await?)
    }

    async fn get_node(&self, node_id: &str) -> Result<SourceNode, StoreError> {
        Ok(DriveClient::get_node(self, node_id).await?)
    }

    async fn fetch_content(
        &self,
        node_id: &str,
        export_mime: Option<&str>,
    ) -> Result<Vec<u8>, StoreError> {
        Ok(DriveClient::fetch_content(self, node_id, export_mime).await?)
    }
}

#[async_trait]
impl ChangeFeed for DriveClient {
    async fn start_cursor(&self) -> Result<String, StoreError> {
        Ok(DriveClient::start_cursor(self).await?)
    }

    async fn list_changes(&self, cursor: &str) -> Result<ChangePage, StoreError> {
        Ok(DriveClient::list_changes(self, cursor).await?)
    }
}

#[async_trait]
impl ObjectStore for BucketClient {
    async fn write(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        Ok(self.write_object(key, body, content_type).await?)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.delete_object(key).await?)
    }
}
