use std::fmt;

use chrono::{DateTime, Utc};

use crate::channel_adapter::ChannelRegistry;
use shopchat_core::error::ShopChatError;
use shopchat_core::text::split_text;

/// Channel-qualified user identity, rendered as `"<channel>:<external id>"`.
///
/// The rendered form keys every per-user map (buffer, pending intent, history).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserKey {
    pub channel: String,
    pub external_id: String,
}

impl UserKey {
    pub fn new(channel: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            external_id: external_id.into(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (channel, external_id) = raw.split_once(':')?;
        if channel.is_empty() || external_id.is_empty() {
            return None;
        }
        Some(Self::new(channel, external_id))
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.external_id)
    }
}

/// A verified, plain-text inbound message. Transport envelopes never get past the webhook.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub user: UserKey,
    pub text: String,
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Sends `text` to the user through their channel, split to the platform limit.
pub async fn deliver_text(
    registry: &ChannelRegistry,
    user: &UserKey,
    text: &str,
) -> Result<(), ShopChatError> {
    let adapter = registry.get(&user.channel).ok_or_else(|| {
        ShopChatError::Delivery(format!("No adapter registered for channel '{}'", user.channel))
    })?;
    for chunk in split_text(text, adapter.max_message_chars()) {
        if chunk.trim().is_empty() {
            continue;
        }
        adapter
            .send_text(&user.external_id, &chunk)
            .await
            .map_err(ShopChatError::Delivery)?;
    }
    Ok(())
}
