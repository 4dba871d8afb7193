use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use thiserror::Error;
use url::Url;

use crate::client::{ApiErrorClass, classify_api_status, is_permanent_status};

const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com";

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments")]
    InvalidBaseUrl,
    #[error("object key is empty")]
    EmptyKey,
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

/// Client for a single bucket of the flat object store.
#[derive(Clone)]
pub struct BucketClient {
    http: Client,
    base_url: Url,
    token: String,
    bucket: String,
}

impl BucketClient {
    pub fn new(token: impl Into<String>, bucket: impl Into<String>) -> Result<Self, BucketError> {
        Self::with_base_url(DEFAULT_BASE_URL, token, bucket)
    }

    pub fn with_base_url(
        base_url: &str,
        token: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Result<Self, BucketError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
            bucket: bucket.into(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Writes the whole object in one request, replacing any previous version.
    pub async fn write_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BucketError> {
        if key.is_empty() {
            return Err(BucketError::EmptyKey);
        }
        let mut url = self.endpoint(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Deletes an object. Returns `false` when it was already absent.
    pub async fn delete_object(&self, key: &str) -> Result<bool, BucketError> {
        if key.is_empty() {
            return Err(BucketError::EmptyKey);
        }
        let url = self.endpoint(&["storage", "v1", "b", &self.bucket, "o", key])?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check_status(response).await?;
        Ok(true)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BucketError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BucketError::InvalidBaseUrl)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), BucketError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(BucketError::Api { status, body })
        }
    }
}

impl BucketError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            BucketError::Api { status, .. } => Some(classify_api_status(*status)),
            BucketError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_permanent(&self) -> bool {
        match self {
            BucketError::Api { status, .. } => is_permanent_status(*status),
            BucketError::EmptyKey => true,
            _ => false,
        }
    }
}
