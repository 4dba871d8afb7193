use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

use crate::node::SourceNode;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const NODE_FIELDS: &str = "id,name,mimeType,modifiedTime,parents,trashed";
const PAGE_SIZE: &str = "1000";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments")]
    InvalidBaseUrl,
    #[error("time format error: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("change listing returned no continuation token")]
    MissingCursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    NotFound,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Lists the non-trashed children of `parent_id`, following page tokens.
    /// With `modified_after` set only children modified strictly later are returned.
    pub async fn list_children(
        &self,
        parent_id: &str,
        modified_after: Option<OffsetDateTime>,
    ) -> Result<Vec<SourceNode>, DriveError> {
        let mut query = format!("'{}' in parents and trashed = false", escape_query(parent_id));
        if let Some(after) = modified_after {
            query.push_str(&format!(" and modifiedTime > '{}'", after.format(&Rfc3339)?));
        }
        let fields = format!("nextPageToken,files({NODE_FIELDS})");

        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.endpoint(&["drive", "v3", "files"])?;
            {
                let mut pairs = url.query_pairs_mut();
                pairs
                    .append_pair("q", &query)
                    .append_pair("fields", &fields)
                    .append_pair("pageSize", PAGE_SIZE);
                if let Some(token) = page_token.as_deref() {
                    pairs.append_pair("pageToken", token);
                }
            }
            let response = self
                .http
                .get(url)
                .bearer_auth(&self.token)
                .send()
                .await?;
            let page: FileListResponse = Self::handle_response(response).await?;
            items.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(items)
    }

    pub async fn get_node(&self, node_id: &str) -> Result<SourceNode, DriveError> {
        let mut url = self.endpoint(&["drive", "v3", "files", node_id])?;
        url.query_pairs_mut().append_pair("fields", NODE_FIELDS);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Downloads raw content, or the exported rendition when `export_mime` is set.
    pub async fn fetch_content(
        &self,
        node_id: &str,
        export_mime: Option<&str>,
    ) -> Result<Vec<u8>, DriveError> {
        let url = match export_mime {
            Some(mime) => {
                let mut url = self.endpoint(&["drive", "v3", "files", node_id, "export"])?;
                url.query_pairs_mut().append_pair("mimeType", mime);
                url
            }
            None => {
                let mut url = self.endpoint(&["drive", "v3", "files", node_id])?;
                url.query_pairs_mut().append_pair("alt", "media");
                url
            }
        };
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn start_cursor(&self) -> Result<String, DriveError> {
        let url = self.endpoint(&["drive", "v3", "changes", "startPageToken"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let payload: StartTokenResponse = Self::handle_response(response).await?;
        Ok(payload.start_page_token)
    }

    pub async fn list_changes(&self, cursor: &str) -> Result<ChangePage, DriveError> {
        let mut url = self.endpoint(&["drive", "v3", "changes"])?;
        url.query_pairs_mut()
            .append_pair("pageToken", cursor)
            .append_pair("fields", "nextPageToken,newStartPageToken,changes(fileId,removed)");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let payload: ChangeListResponse = Self::handle_response(response).await?;
        let (next_cursor, has_more) = match (payload.next_page_token, payload.new_start_page_token)
        {
            (Some(next), _) => (next, true),
            (None, Some(start)) => (start, false),
            (None, None) => return Err(DriveError::MissingCursor),
        };
        Ok(ChangePage {
            changes: payload.changes,
            next_cursor,
            has_more,
        })
    }

    /// Registers a push channel delivering change notifications to `address`.
    pub async fn watch_changes(
        &self,
        cursor: &str,
        channel_id: &str,
        address: &str,
        expires_at: OffsetDateTime,
    ) -> Result<WatchChannel, DriveError> {
        let mut url = self.endpoint(&["drive", "v3", "changes", "watch"])?;
        url.query_pairs_mut().append_pair("pageToken", cursor);
        let expiration_ms = expires_at.unix_timestamp_nanos() / 1_000_000;
        let body = WatchRequest {
            id: channel_id,
            kind: "web_hook",
            address,
            expiration: expiration_ms.to_string(),
        };
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn stop_channel(&self, channel_id: &str, resource_id: &str) -> Result<(), DriveError> {
        let url = self.endpoint(&["drive", "v3", "channels", "stop"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "id": channel_id, "resourceId": resource_id }))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, DriveError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DriveError::InvalidBaseUrl)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DriveError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            DriveError::Request(err) if err.is_timeout() || err.is_connect() => {
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

    pub fn is_not_found(&self) -> bool {
        self.classification() == Some(ApiErrorClass::NotFound)
    }

    /// True when repeating the same request cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            DriveError::Api { status, .. } => is_permanent_status(*status),
            DriveError::Url(_) | DriveError::InvalidBaseUrl => true,
            _ => false,
        }
    }
}

pub(crate) fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// 403 is refused access to one resource; 401 is the credential itself and
/// may recover once the token is replaced.
pub(crate) fn is_permanent_status(status: StatusCode) -> bool {
    status == StatusCode::FORBIDDEN || classify_api_status(status) == ApiErrorClass::Permanent
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    #[serde(default)]
    files: Vec<SourceNode>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartTokenResponse {
    start_page_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeListResponse {
    #[serde(default)]
    changes: Vec<ChangeRecord>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    new_start_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub file_id: String,
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePage {
    pub changes: Vec<ChangeRecord>,
    /// Cursor to resume from once every change in this page is applied.
    pub next_cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
struct WatchRequest<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    address: &'a str,
    expiration: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchChannel {
    pub id: String,
    pub resource_id: String,
    #[serde(default)]
    pub expiration: Option<String>,
}
