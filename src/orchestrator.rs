use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::catalog::{Catalog, CatalogSnapshot};
use crate::config::Config;
use crate::llm::{complete_text, LlmProvider};
use crate::llm_types::{ChatCompletionRequest, ChatMessage, ConversationTurn};
use crate::reassembler::MergedTurn;
use crate::storage::conversation::ConversationStore;
use crate::text::preview;

#[derive(Debug, Clone)]
pub struct ReplySettings {
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub history_turns: usize,
    pub persona: String,
    pub fallback_reply: String,
}

impl ReplySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.completion_timeout(),
            history_turns: config.history_turns,
            persona: config.assistant_persona.clone(),
            fallback_reply: config.fallback_reply.clone(),
        }
    }
}

/// Builds the assistant system prompt: persona, the full product list and
/// details of products the customer mentioned.
pub fn build_system_prompt(persona: &str, catalog: &CatalogSnapshot, merged: &MergedTurn) -> String {
    let mut prompt = persona.trim().to_string();
    prompt.push_str("\n\nรายการสินค้าของร้าน (product list):\n");
    if catalog.is_empty() {
        prompt.push_str("(ยังไม่มีข้อมูลสินค้า ให้แจ้งลูกค้าว่าจะให้แอดมินตรวจสอบราคาให้)");
    } else {
        prompt.push_str(&catalog.render_lines());
    }

    let mut mentioned: Vec<String> = Vec::new();
    for item in &merged.items {
        let Some(record) = catalog.lookup(&item.product) else {
            continue;
        };
        let mut line = record.render_line();
        if let Some(qty) = item.qty {
            line.push_str(&format!(" | ลูกค้าต้องการ {qty}"));
            if let Some(unit) = &item.unit {
                line.push_str(&format!(" {unit}"));
            }
        }
        if !mentioned.contains(&line) {
            mentioned.push(line);
        }
    }
    if !mentioned.is_empty() {
        prompt.push_str("\n\nสินค้าที่ลูกค้ากล่าวถึงในข้อความนี้:\n");
        prompt.push_str(&mentioned.join("\n"));
    }
    prompt
}

pub struct ResponseOrchestrator {
    llm: Arc<dyn LlmProvider>,
    catalog: Arc<Catalog>,
    store: Arc<dyn ConversationStore>,
    settings: ReplySettings,
}

impl ResponseOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        catalog: Arc<Catalog>,
        store: Arc<dyn ConversationStore>,
        settings: ReplySettings,
    ) -> Self {
        Self {
            llm,
            catalog,
            store,
            settings,
        }
    }

    /// Produces the reply for one merged turn and records both sides of the
    /// exchange. Completion failures yield the configured fallback reply,
    /// which is recorded like any other reply.
    pub async fn handle_turn(
        &self,
        user_key: &str,
        merged: &MergedTurn,
        history: &[ConversationTurn],
    ) -> String {
        let snapshot = self.catalog.snapshot();
        let system_prompt = build_system_prompt(&self.settings.persona, &snapshot, merged);

        let start = history.len().saturating_sub(self.settings.history_turns);
        let mut messages: Vec<ChatMessage> =
            history[start..].iter().map(ChatMessage::from).collect();
        messages.push(ChatMessage::user(merged.merged_text.clone()));

        let request = ChatCompletionRequest::new(
            self.settings.model.clone(),
            self.settings.temperature,
            &system_prompt,
            messages,
        );

        let reply = match complete_text(self.llm.as_ref(), &request, self.settings.timeout).await {
            Ok(text) => {
                info!(
                    user = user_key,
                    reply = %preview(&text, 80),
                    "assistant reply ready"
                );
                text
            }
            Err(e) => {
                warn!(user = user_key, "completion failed, sending fallback reply: {e}");
                self.settings.fallback_reply.clone()
            }
        };

        if let Err(e) = self
            .store
            .append(
                user_key,
                vec![
                    ConversationTurn::user(merged.merged_text.clone()),
                    ConversationTurn::assistant(reply.clone()),
                ],
            )
            .await
        {
            warn!(user = user_key, "failed to record conversation: {e}");
        }
        reply
    }
}
