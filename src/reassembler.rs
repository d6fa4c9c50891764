//! Merges a flushed batch of fragments into one utterance via a normalizer
//! completion. Any failure degrades to a deterministic join.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ShopChatError;
use crate::llm::{complete_text, LlmProvider};
use crate::llm_types::{ChatCompletionRequest, ChatMessage, ConversationTurn, TurnRole};

const FALLBACK_SEPARATOR: &str = " / ";
const HISTORY_CONTEXT_TURNS: usize = 4;

const NORMALIZER_PROMPT: &str = r#"You merge chat fragments typed in pieces by one customer of a building-materials shop into a single message.
Reply with strict JSON only, no prose and no code fences:
{"mergedText": "<one natural sentence in the customer's language>", "items": [{"product": "<product words>", "qty": <number or null>, "unit": "<unit or null>"}], "followups": ["<open question the customer asked>"]}
Keep product names, codes and numbers exactly as typed. Do not answer the customer. Use [] when there are no items or followups."#;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MergedItem {
    pub product: String,
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedTurn {
    pub merged_text: String,
    pub items: Vec<MergedItem>,
    pub followups: Vec<String>,
}

impl MergedTurn {
    /// Join of the raw fragments, used whenever the normalizer cannot be trusted.
    pub fn fallback(fragments: &[String]) -> Self {
        let joined = fragments
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .collect::<Vec<_>>()
            .join(FALLBACK_SEPARATOR);
        Self {
            merged_text: joined.clone(),
            items: Vec::new(),
            followups: vec![joined],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NormalizerReply {
    merged_text: String,
    #[serde(default)]
    items: Vec<MergedItem>,
    #[serde(default)]
    followups: Vec<String>,
}

/// Removes one surrounding markdown fence (```json ... ```), if present.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    match body.find('\n') {
        Some(newline) if body[..newline].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
            body[newline + 1..].trim()
        }
        _ => body.trim(),
    }
}

/// Strict parse: the whole reply must be one JSON object with a non-empty
/// `mergedText`.
pub fn parse_normalizer_reply(raw: &str) -> Result<MergedTurn, ShopChatError> {
    let reply: NormalizerReply = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| ShopChatError::CompletionParse(e.to_string()))?;
    let merged_text = reply.merged_text.trim().to_string();
    if merged_text.is_empty() {
        return Err(ShopChatError::CompletionParse("mergedText is empty".into()));
    }
    let items = reply
        .items
        .into_iter()
        .filter(|item| !item.product.trim().is_empty())
        .collect();
    Ok(MergedTurn {
        merged_text,
        items,
        followups: reply.followups,
    })
}

fn render_context(history: &[ConversationTurn]) -> String {
    let start = history.len().saturating_sub(HISTORY_CONTEXT_TURNS);
    history[start..]
        .iter()
        .map(|turn| {
            let who = match turn.role {
                TurnRole::User => "customer",
                TurnRole::Assistant => "shop",
            };
            format!("{who}: {}", turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct Reassembler {
    llm: Arc<dyn LlmProvider>,
    model: String,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(llm: Arc<dyn LlmProvider>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            llm,
            model: model.into(),
            timeout,
        }
    }

    pub fn from_config(llm: Arc<dyn LlmProvider>, config: &Config) -> Self {
        Self::new(llm, config.normalizer_model(), config.normalizer_timeout())
    }

    /// Never fails: normalizer errors and malformed replies yield
    /// [`MergedTurn::fallback`].
    pub async fn reassemble(
        &self,
        fragments: &[String],
        history: &[ConversationTurn],
    ) -> MergedTurn {
        match self.normalize(fragments, history).await {
            Ok(merged) => {
                debug!(
                    fragments = fragments.len(),
                    items = merged.items.len(),
                    "fragments merged"
                );
                merged
            }
            Err(e) => {
                warn!("normalizer failed, joining fragments: {e}");
                MergedTurn::fallback(fragments)
            }
        }
    }

    async fn normalize(
        &self,
        fragments: &[String],
        history: &[ConversationTurn],
    ) -> Result<MergedTurn, ShopChatError> {
        let mut body = String::new();
        let context = render_context(history);
        if !context.is_empty() {
            body.push_str("Recent conversation:\n");
            body.push_str(&context);
            body.push_str("\n\n");
        }
        body.push_str("Fragments in order:\n");
        for (idx, fragment) in fragments.iter().enumerate() {
            body.push_str(&format!("{}. {}\n", idx + 1, fragment.trim()));
        }

        let request = ChatCompletionRequest::new(
            self.model.clone(),
            0.0,
            NORMALIZER_PROMPT,
            vec![ChatMessage::user(body)],
        );
        let raw = complete_text(self.llm.as_ref(), &request, self.timeout).await?;
        parse_normalizer_reply(&raw)
    }
}
