use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::sync::engine::MirrorEngine;
use crate::sync::webhook::{Notification, NotificationError};

pub const RESOURCE_ID_HEADER: &str = "x-goog-resource-id";
pub const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";
pub const CHANNEL_ID_HEADER: &str = "x-goog-channel-id";
pub const MESSAGE_NUMBER_HEADER: &str = "x-goog-message-number";

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    #[serde(default)]
    full: bool,
}

pub fn router(engine: Arc<MirrorEngine>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/sync", post(trigger_sync))
        .route("/notifications", post(receive_notification))
        .with_state(engine)
}

async fn trigger_sync(
    State(engine): State<Arc<MirrorEngine>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    let result = if query.full {
        engine.full_resync().await
    } else {
        engine.sync_manual().await
    };
    match result {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => {
            error!(full = query.full, error = %err, "manual sync failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

/// Acknowledges right away; the change is applied on a detached task.
async fn receive_notification(
    State(engine): State<Arc<MirrorEngine>>,
    headers: HeaderMap,
) -> StatusCode {
    let notification = match parse_notification(&headers) {
        Ok(notification) => notification,
        Err(err) => {
            warn!(error = %err, "malformed notification rejected");
            return StatusCode::BAD_REQUEST;
        }
    };
    debug!(
        resource = %notification.resource_id,
        state = notification.state.as_str(),
        channel = ?notification.channel_id,
        message = ?notification.message_number,
        "notification received"
    );
    tokio::spawn(async move {
        engine.handle_notification(notification).await;
    });
    StatusCode::OK
}

fn parse_notification(headers: &HeaderMap) -> Result<Notification, NotificationError> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let notification = Notification::new(header(RESOURCE_ID_HEADER), header(RESOURCE_STATE_HEADER))?;
    Ok(notification.with_channel(
        header(CHANNEL_ID_HEADER).map(str::to_string),
        header(MESSAGE_NUMBER_HEADER).and_then(|value| value.trim().parse().ok()),
    ))
}
