use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::channel::{InboundEvent, UserKey};
use crate::channel_adapter::ChannelAdapter;
use crate::channels::signature::verify_hub_signature;
use crate::config::MessengerConfig;
use crate::runtime::AppState;
use crate::text::preview;

pub const CHANNEL_NAME: &str = "messenger";
pub const MESSENGER_MAX_CHARS: usize = 2000;
const GRAPH_BASE_URL: &str = "https://graph.facebook.com";

pub struct MessengerAdapter {
    page_access_token: String,
    send_url: String,
    http_client: reqwest::Client,
}

impl MessengerAdapter {
    pub fn new(config: &MessengerConfig, http_client: reqwest::Client) -> Self {
        Self {
            page_access_token: config.page_access_token.trim().to_string(),
            send_url: format!("{GRAPH_BASE_URL}/{}/me/messages", config.api_version.trim()),
            http_client,
        }
    }

    async fn post(&self, body: serde_json::Value) -> Result<(), String> {
        let response = self
            .http_client
            .post(&self.send_url)
            .query(&[("access_token", self.page_access_token.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Messenger API request failed: {e}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!(
                "Messenger API error {status}: {}",
                preview(&body, 300)
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for MessengerAdapter {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    fn max_message_chars(&self) -> usize {
        MESSENGER_MAX_CHARS
    }

    async fn send_text(&self, external_user_id: &str, text: &str) -> Result<(), String> {
        self.post(serde_json::json!({
            "recipient": { "id": external_user_id },
            "messaging_type": "RESPONSE",
            "message": { "text": text },
        }))
        .await
    }

    async fn send_typing(&self, external_user_id: &str) -> Result<(), String> {
        self.post(serde_json::json!({
            "recipient": { "id": external_user_id },
            "sender_action": "typing_on",
        }))
        .await
    }
}

#[derive(Debug, Deserialize)]
struct MessengerVerifyQuery {
    #[serde(rename = "hub.mode")]
    hub_mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    hub_verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    hub_challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessengerWebhookPayload {
    #[serde(default)]
    object: String,
    #[serde(default)]
    entry: Vec<MessengerEntry>,
}

#[derive(Debug, Deserialize)]
struct MessengerEntry {
    #[serde(default)]
    messaging: Vec<MessengerEvent>,
    #[serde(default)]
    standby: Vec<MessengerEvent>,
}

#[derive(Debug, Deserialize)]
struct MessengerEvent {
    #[serde(default)]
    sender: Option<MessengerParticipant>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    message: Option<MessengerMessage>,
}

#[derive(Debug, Deserialize)]
struct MessengerParticipant {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessengerMessage {
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    is_echo: bool,
}

fn verify_subscription(
    config: &MessengerConfig,
    query: MessengerVerifyQuery,
) -> axum::response::Response {
    if query.hub_mode.as_deref() != Some("subscribe") {
        return StatusCode::FORBIDDEN.into_response();
    }
    let expected = config.verify_token.trim();
    let provided = query.hub_verify_token.unwrap_or_default();
    if expected.is_empty() || provided.trim() != expected {
        return StatusCode::FORBIDDEN.into_response();
    }
    match query.hub_challenge {
        Some(challenge) => (StatusCode::OK, challenge).into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

fn inbound_events(payload: MessengerWebhookPayload) -> Vec<InboundEvent> {
    if payload.object != "page" {
        return Vec::new();
    }
    let mut events = Vec::new();
    for entry in payload.entry {
        for event in entry.messaging.into_iter().chain(entry.standby) {
            let Some(sender) = event.sender else {
                continue;
            };
            let Some(message) = event.message else {
                continue;
            };
            if message.is_echo {
                continue;
            }
            let text = message.text.as_deref().map(str::trim).unwrap_or("");
            if sender.id.trim().is_empty() || text.is_empty() {
                continue;
            }
            let timestamp = event
                .timestamp
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .unwrap_or_else(Utc::now);
            events.push(InboundEvent {
                user: UserKey::new(CHANNEL_NAME, sender.id.trim()),
                text: text.to_string(),
                message_id: message.mid,
                timestamp,
            });
        }
    }
    events
}

async fn messenger_webhook_handler(
    app_state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_hub_signature(&app_state.config.messenger.app_secret, signature, &body) {
        warn!("Messenger webhook rejected: invalid signature");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let payload: MessengerWebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            debug!("Messenger webhook body is not a valid payload: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    for event in inbound_events(payload) {
        if let Some(mid) = event.message_id.as_deref() {
            if !app_state.dedup.first_sighting(mid) {
                debug!(mid, "duplicate Messenger delivery ignored");
                continue;
            }
        }
        info!(
            user = %event.user,
            text = %preview(&event.text, 120),
            "Messenger message received"
        );
        app_state.sessions.ingest(event);
    }
    (StatusCode::OK, "EVENT_RECEIVED").into_response()
}

pub fn register_messenger_webhook(router: Router, app_state: Arc<AppState>) -> Router {
    let config = app_state.config.messenger.clone();
    if !config.enabled() {
        return router;
    }
    let path = config.webhook_path.trim().to_string();
    let post_state = app_state.clone();
    router.route(
        &path,
        axum::routing::get(move |Query(query): Query<MessengerVerifyQuery>| {
            let config = config.clone();
            async move { verify_subscription(&config, query) }
        })
        .post(move |headers: HeaderMap, body: Bytes| {
            let state = post_state.clone();
            async move { messenger_webhook_handler(state, headers, body).await }
        }),
    )
}
