//! Notification endpoint for Microsoft Graph change notifications.
//!
//! The handler only validates and enqueues. Processing happens on the other
//! side of a bounded channel, read through `ChannelSource`.

use std::sync::LazyLock;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::pipeline::types::{ChangeType, NotificationEvent, NotificationSource};

static MESSAGE_RESOURCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)messages/([^/?]+)").expect("message resource pattern"));

// ── Hand-off queue ──────────────────────────────────────────────────

/// Receiving half of the webhook queue.
pub struct ChannelSource {
    rx: mpsc::Receiver<NotificationEvent>,
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn next(&mut self) -> Option<NotificationEvent> {
        self.rx.recv().await
    }
}

/// Bounded queue between the endpoint and the pipeline.
pub fn channel(capacity: usize) -> (mpsc::Sender<NotificationEvent>, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, ChannelSource { rx })
}

// ── Payload ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NotificationBatch {
    #[serde(default)]
    value: Vec<ChangeNotification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeNotification {
    #[serde(default)]
    subscription_id: String,
    #[serde(default)]
    change_type: String,
    #[serde(default)]
    resource: String,
    #[serde(default)]
    client_state: Option<String>,
    #[serde(default)]
    resource_data: Option<ResourceData>,
}

#[derive(Debug, Deserialize)]
struct ResourceData {
    #[serde(default)]
    id: Option<String>,
}

/// Message id named by a notification resource such as
/// `Users/{user}/Messages/{id}`.
fn message_id_from_resource(resource: &str) -> Option<String> {
    MESSAGE_RESOURCE
        .captures(resource)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Turn a notification payload into pipeline events.
///
/// Notifications that do not name a message, or whose `clientState` does not
/// match the expected secret, are dropped.
pub fn parse_notifications(
    body: &[u8],
    client_state: Option<&str>,
) -> Result<Vec<NotificationEvent>, serde_json::Error> {
    let batch: NotificationBatch = serde_json::from_slice(body)?;
    let mut events = Vec::with_capacity(batch.value.len());

    for n in batch.value {
        if let Some(expected) = client_state
            && n.client_state.as_deref() != Some(expected)
        {
            warn!(subscription_id = %n.subscription_id, "Dropping notification with wrong clientState");
            continue;
        }

        let Some(message_id) = message_id_from_resource(&n.resource)
            .or_else(|| n.resource_data.and_then(|d| d.id).filter(|id| !id.is_empty()))
        else {
            warn!(resource = %n.resource, "Dropping notification for a non-message resource");
            continue;
        };

        events.push(NotificationEvent {
            subscription_id: n.subscription_id,
            message_id,
            change_type: ChangeType::parse(&n.change_type),
            received_at: Utc::now(),
        });
    }

    Ok(events)
}

// ── Routes ──────────────────────────────────────────────────────────

/// State shared across handlers.
#[derive(Clone)]
pub struct WebhookState {
    pub tx: mpsc::Sender<NotificationEvent>,
    /// Expected `clientState`; `None` accepts any.
    pub client_state: Option<String>,
}

/// Build the Axum router with the health and notification routes.
pub fn webhook_routes(tx: mpsc::Sender<NotificationEvent>, config: &ServerConfig) -> Router {
    let state = WebhookState {
        tx,
        client_state: config.client_state.clone(),
    };

    let router = Router::new()
        .route("/api/health", get(health))
        .route("/api/graph-notifications", post(notifications))
        .with_state(state);

    if config.cors_permissive {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "success",
        "time": Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct ValidationQuery {
    #[serde(rename = "validationToken")]
    validation_token: Option<String>,
}

async fn notifications(
    State(state): State<WebhookState>,
    Query(query): Query<ValidationQuery>,
    body: Bytes,
) -> Response {
    // Subscription handshake: echo the token back as plain text.
    if let Some(token) = query.validation_token {
        info!("Answering subscription validation request");
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            token,
        )
            .into_response();
    }

    let events = match parse_notifications(&body, state.client_state.as_deref()) {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "Rejecting malformed notification payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"status": "error", "message": "invalid JSON payload"})),
            )
                .into_response();
        }
    };

    let count = events.len();
    for event in events {
        let message_id = event.message_id.clone();
        match state.tx.try_send(event) {
            Ok(()) => debug!(message_id = %message_id, "Queued notification"),
            Err(TrySendError::Full(_)) => {
                warn!(message_id = %message_id, "Notification queue full, asking for redelivery");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Notification queue closed");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        }
    }

    if count > 0 {
        info!(count, "Accepted notifications");
    }
    StatusCode::ACCEPTED.into_response()
}
