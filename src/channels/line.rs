use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::channel::{InboundEvent, UserKey};
use crate::channel_adapter::ChannelAdapter;
use crate::channels::signature::verify_line_signature;
use crate::config::LineConfig;
use crate::runtime::AppState;
use crate::text::preview;

pub const CHANNEL_NAME: &str = "line";
pub const LINE_MAX_CHARS: usize = 5000;
const LINE_PUSH_URL: &str = "https://api.line.me/v2/bot/message/push";

/// Replies go through the push API: a buffered reply can outlive the
/// webhook's reply token.
pub struct LineAdapter {
    channel_access_token: String,
    http_client: reqwest::Client,
}

impl LineAdapter {
    pub fn new(config: &LineConfig, http_client: reqwest::Client) -> Self {
        Self {
            channel_access_token: config.channel_access_token.trim().to_string(),
            http_client,
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for LineAdapter {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    fn max_message_chars(&self) -> usize {
        LINE_MAX_CHARS
    }

    async fn send_text(&self, external_user_id: &str, text: &str) -> Result<(), String> {
        let body = serde_json::json!({
            "to": external_user_id,
            "messages": [{ "type": "text", "text": text }],
        });
        let response = self
            .http_client
            .post(LINE_PUSH_URL)
            .bearer_auth(&self.channel_access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("LINE API request failed: {e}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("LINE API error {status}: {}", preview(&body, 300)));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct LineWebhookPayload {
    #[serde(default)]
    events: Vec<LineEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    source: Option<LineSource>,
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    webhook_event_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineSource {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

fn inbound_events(payload: LineWebhookPayload) -> Vec<InboundEvent> {
    let mut events = Vec::new();
    for event in payload.events {
        if event.event_type != "message" {
            continue;
        }
        let Some(message) = event.message else {
            continue;
        };
        if message.message_type != "text" {
            continue;
        }
        let Some(user_id) = event
            .source
            .and_then(|s| s.user_id)
            .filter(|id| !id.trim().is_empty())
        else {
            continue;
        };
        let text = message.text.as_deref().map(str::trim).unwrap_or("");
        if text.is_empty() {
            continue;
        }
        let timestamp = event
            .timestamp
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        events.push(InboundEvent {
            user: UserKey::new(CHANNEL_NAME, user_id.trim()),
            text: text.to_string(),
            message_id: message.id.or(event.webhook_event_id),
            timestamp,
        });
    }
    events
}

async fn line_webhook_handler(
    app_state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let signature = headers.get("x-line-signature").and_then(|v| v.to_str().ok());
    if !verify_line_signature(&app_state.config.line.channel_secret, signature, &body) {
        warn!("LINE webhook rejected: invalid signature");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let payload: LineWebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            debug!("LINE webhook body is not a valid payload: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    for event in inbound_events(payload) {
        if let Some(id) = event.message_id.as_deref() {
            if !app_state.dedup.first_sighting(&format!("line:{id}")) {
                debug!(id, "duplicate LINE delivery ignored");
                continue;
            }
        }
        info!(
            user = %event.user,
            text = %preview(&event.text, 120),
            "LINE message received"
        );
        app_state.sessions.ingest(event);
    }
    StatusCode::OK.into_response()
}

pub fn register_line_webhook(router: Router, app_state: Arc<AppState>) -> Router {
    if !app_state.config.line.enabled() {
        return router;
    }
    let path = app_state.config.line.webhook_path.trim().to_string();
    router.route(
        &path,
        axum::routing::post(move |headers: HeaderMap, body: Bytes| {
            let state = app_state.clone();
            async move { line_webhook_handler(state, headers, body).await }
        }),
    )
}
