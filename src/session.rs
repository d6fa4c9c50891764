//! Owns every per-user map and drives one inbound message through
//! buffer -> reassembler -> intent carry -> orchestrator -> delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::buffer::{BufferSettings, FlushHandler, FlushedBatch, FragmentBuffer};
use crate::catalog::Catalog;
use crate::channel::{deliver_text, InboundEvent, UserKey};
use crate::channel_adapter::ChannelRegistry;
use crate::config::Config;
use crate::error::ShopChatError;
use crate::intent::IntentTracker;
use crate::llm::LlmProvider;
use crate::orchestrator::{ReplySettings, ResponseOrchestrator};
use crate::reassembler::Reassembler;
use crate::storage::conversation::ConversationStore;
use crate::text::preview;

pub struct SessionManager {
    buffer: FragmentBuffer,
    intents: IntentTracker,
    reassembler: Reassembler,
    orchestrator: ResponseOrchestrator,
    store: Arc<dyn ConversationStore>,
    catalog: Arc<Catalog>,
    registry: Arc<ChannelRegistry>,
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        config: &Config,
        llm: Arc<dyn LlmProvider>,
        catalog: Arc<Catalog>,
        store: Arc<dyn ConversationStore>,
        registry: Arc<ChannelRegistry>,
    ) -> Result<Self, ShopChatError> {
        Ok(Self {
            buffer: FragmentBuffer::new(BufferSettings::from_config(config)),
            intents: IntentTracker::new(std::time::Duration::from_secs(config.intent_ttl_secs))?,
            reassembler: Reassembler::from_config(Arc::clone(&llm), config),
            orchestrator: ResponseOrchestrator::new(
                llm,
                Arc::clone(&catalog),
                Arc::clone(&store),
                ReplySettings::from_config(config),
            ),
            store,
            catalog,
            registry,
            turn_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn buffer(&self) -> &FragmentBuffer {
        &self.buffer
    }

    pub fn intents(&self) -> &IntentTracker {
        &self.intents
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Entry point for verified inbound messages. Returns immediately; the
    /// reply is produced once the user's buffer flushes.
    pub fn ingest(self: &Arc<Self>, event: InboundEvent) {
        let text = event.text.trim();
        if text.is_empty() {
            return;
        }
        let user_key = event.user.to_string();
        debug!(user = %user_key, text = %preview(text, 120), "fragment received");

        if let Some(adapter) = self.registry.get(&event.user.channel).cloned() {
            let external_id = event.user.external_id.clone();
            tokio::spawn(async move {
                if let Err(e) = adapter.send_typing(&external_id).await {
                    debug!("typing indicator failed: {e}");
                }
            });
        }

        let manager = Arc::clone(self);
        let on_flush: FlushHandler = Arc::new(move |batch: FlushedBatch| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager.process_batch(batch).await;
            });
        });
        self.buffer.push(&user_key, text, on_flush);
    }

    fn turn_lock(&self, user_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.turn_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(user_key.to_string()).or_default())
    }

    fn release_turn_lock(&self, user_key: &str) {
        let mut locks = match self.turn_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if locks
            .get(user_key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(user_key);
        }
    }

    /// Runs one flushed batch to completion and returns the reply sent.
    ///
    /// Turns of one user never overlap; different users proceed in parallel.
    pub async fn process_batch(&self, batch: FlushedBatch) -> String {
        let lock = self.turn_lock(&batch.user_key);
        let reply = {
            let _guard = lock.lock().await;
            self.run_turn(&batch).await
        };
        drop(lock);
        self.release_turn_lock(&batch.user_key);
        reply
    }

    async fn run_turn(&self, batch: &FlushedBatch) -> String {
        let user_key = batch.user_key.as_str();
        let history = match self.store.get(user_key).await {
            Ok(history) => history,
            Err(e) => {
                warn!(user = user_key, "failed to read history: {e}");
                Vec::new()
            }
        };

        let mut merged = self.reassembler.reassemble(&batch.fragments, &history).await;
        let last_fragment = batch.fragments.last().map(String::as_str).unwrap_or("");
        merged.merged_text = self.intents.apply(
            user_key,
            last_fragment,
            &merged.merged_text,
            &self.catalog.snapshot(),
        );
        info!(
            user = user_key,
            fragments = batch.fragments.len(),
            reason = ?batch.reason,
            merged = %preview(&merged.merged_text, 80),
            "turn assembled"
        );

        let reply = self.orchestrator.handle_turn(user_key, &merged, &history).await;

        match UserKey::parse(user_key) {
            Some(user) => {
                if let Err(e) = deliver_text(&self.registry, &user, &reply).await {
                    warn!(user = user_key, "{e}");
                }
            }
            None => warn!(user = user_key, "cannot deliver reply: malformed user key"),
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogSnapshot;
    use crate::channel_adapter::ChannelAdapter;
    use crate::llm_types::{ChatCompletionRequest, ChatCompletionResponse, ConversationTurn};
    use crate::storage::conversation::MemoryConversationStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::Instant;

    struct EchoLlm {
        delay: Duration,
    }

    #[async_trait]
    impl LlmProvider for EchoLlm {
        async fn send_chat(
            &self,
            request: &ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, ShopChatError> {
            tokio::time::sleep(self.delay).await;
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(serde_json::from_value(serde_json::json!({
                "choices": [{"message": {"content": format!("re: {last}")}}]
            }))?)
        }
    }

    struct BrokenAdapter;

    #[async_trait]
    impl ChannelAdapter for BrokenAdapter {
        fn name(&self) -> &str {
            "messenger"
        }

        fn max_message_chars(&self) -> usize {
            2000
        }

        async fn send_text(&self, _external_user_id: &str, _text: &str) -> Result<(), String> {
            Err("HTTP 500".into())
        }
    }

    fn manager(delay: Duration) -> (Arc<SessionManager>, Arc<MemoryConversationStore>) {
        let mut config = Config::test_defaults();
        config.fragment_silence_ms = 1000;
        let store = Arc::new(MemoryConversationStore::new(10, Duration::from_secs(3600)));
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(BrokenAdapter));
        let manager = SessionManager::new(
            &config,
            Arc::new(EchoLlm { delay }),
            Arc::new(Catalog::new(None, CatalogSnapshot::empty())),
            store.clone(),
            Arc::new(registry),
        )
        .unwrap();
        (Arc::new(manager), store)
    }

    fn batch(user: &str, fragments: &[&str]) -> FlushedBatch {
        FlushedBatch {
            user_key: user.to_string(),
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            first_seen_at: Instant::now(),
            reason: crate::buffer::FlushReason::Silence,
        }
    }

    #[tokio::test]
    async fn test_delivery_failure_keeps_history() {
        let (manager, store) = manager(Duration::ZERO);
        let reply = manager.process_batch(batch("messenger:42", &["สวัสดี"])).await;
        assert_eq!(reply, "re: สวัสดี");
        let history = store.get("messenger:42").await.unwrap();
        assert_eq!(
            history,
            vec![
                ConversationTurn::user("สวัสดี"),
                ConversationTurn::assistant("re: สวัสดี"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_for_one_user_are_serialized() {
        let (manager, store) = manager(Duration::from_secs(5));
        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.process_batch(batch("messenger:1", &["a"])).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.process_batch(batch("messenger:1", &["b"])).await })
        };
        first.await.unwrap();
        second.await.unwrap();

        let history = store.get("messenger:1").await.unwrap();
        let contents: Vec<&str> = history.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "re: a", "b", "re: b"]);
        assert!(manager.turn_locks.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_fragments_are_ignored() {
        let (manager, _store) = manager(Duration::ZERO);
        manager.ingest(InboundEvent {
            user: UserKey::new("messenger", "7"),
            text: "   ".into(),
            message_id: None,
            timestamp: chrono::Utc::now(),
        });
        assert_eq!(
            manager.buffer().state("messenger:7"),
            crate::buffer::BufferState::Idle
        );
    }
}
