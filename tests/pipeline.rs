//! End-to-end turn pipeline: buffer, merge, intent carry, reply, delivery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use shopchat::catalog::csv::parse_catalog;
use shopchat::catalog::{Catalog, CatalogSnapshot};
use shopchat::channel::{InboundEvent, UserKey};
use shopchat::channel_adapter::{ChannelAdapter, ChannelRegistry};
use shopchat::config::Config;
use shopchat::error::ShopChatError;
use shopchat::intent::{BUNDLE_HINT, SPEC_HINT};
use shopchat::llm::LlmProvider;
use shopchat::llm_types::{ChatCompletionRequest, ChatCompletionResponse, ConversationTurn};
use shopchat::session::SessionManager;
use shopchat::storage::conversation::{ConversationStore, MemoryConversationStore};

const CATALOG: &str = "ชื่อสินค้า,ราคา,หน่วย,ชื่อเรียก,ขนาด,จำนวนต่อมัด\n\
    ซีลาย #26 เต็ม,120,เส้น,,0.5 มม. x 3 ม.,10\n\
    ซีลาย #26 เบา,95,เส้น,,0.35 มม. x 3 ม.,10\n\
    สตัด 4 นิ้ว,85,เส้น,stud4,,20\n";

#[derive(Clone, Copy)]
enum AssistantMode {
    Echo,
    Hang,
}

/// Normalizer calls merge numbered fragments with spaces; assistant calls
/// echo the final user message or never answer.
struct FakeLlm {
    assistant: AssistantMode,
    requests: Mutex<Vec<ChatCompletionRequest>>,
}

impl FakeLlm {
    fn new(assistant: AssistantMode) -> Arc<Self> {
        Arc::new(Self {
            assistant,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests_for(&self, model: &str) -> Vec<ChatCompletionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.model == model)
            .cloned()
            .collect()
    }
}

fn completion(text: &str) -> Result<ChatCompletionResponse, ShopChatError> {
    Ok(serde_json::from_value(serde_json::json!({
        "choices": [{"message": {"content": text}}]
    }))?)
}

#[async_trait]
impl LlmProvider for FakeLlm {
    async fn send_chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ShopChatError> {
        self.requests.lock().unwrap().push(request.clone());
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if request.model == "normalizer" {
            let merged: Vec<&str> = last
                .lines()
                .filter_map(|line| line.split_once(". "))
                .filter(|(n, _)| n.chars().all(|c| c.is_ascii_digit()))
                .map(|(_, text)| text)
                .collect();
            return completion(&serde_json::json!({ "mergedText": merged.join(" ") }).to_string());
        }
        match self.assistant {
            AssistantMode::Echo => completion(&format!("ตอบ: {last}")),
            AssistantMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                completion("too late")
            }
        }
    }
}

struct RecordingAdapter {
    sent: mpsc::UnboundedSender<(String, String)>,
    typing: Mutex<usize>,
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        "messenger"
    }

    fn max_message_chars(&self) -> usize {
        2000
    }

    async fn send_text(&self, external_user_id: &str, text: &str) -> Result<(), String> {
        let _ = self
            .sent
            .send((external_user_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_typing(&self, _external_user_id: &str) -> Result<(), String> {
        *self.typing.lock().unwrap() += 1;
        Ok(())
    }
}

struct Harness {
    sessions: Arc<SessionManager>,
    llm: Arc<FakeLlm>,
    store: Arc<MemoryConversationStore>,
    adapter: Arc<RecordingAdapter>,
    sent: mpsc::UnboundedReceiver<(String, String)>,
}

fn config() -> Config {
    Config {
        api_key: "test-key".into(),
        model: "assistant".into(),
        normalizer_model: "normalizer".into(),
        fallback_reply: "ขอโทษค่ะ กรุณาติดต่อแอดมิน".into(),
        ..Config::default()
    }
}

fn harness(assistant: AssistantMode, catalog: CatalogSnapshot) -> Harness {
    let config = config();
    let llm = FakeLlm::new(assistant);
    let store = Arc::new(MemoryConversationStore::new(
        config.history_turns,
        config.history_ttl(),
    ));
    let (tx, rx) = mpsc::unbounded_channel();
    let adapter = Arc::new(RecordingAdapter {
        sent: tx,
        typing: Mutex::new(0),
    });
    let mut registry = ChannelRegistry::new();
    registry.register(adapter.clone());
    let sessions = SessionManager::new(
        &config,
        llm.clone(),
        Arc::new(Catalog::new(None, catalog)),
        store.clone(),
        Arc::new(registry),
    )
    .unwrap();
    Harness {
        sessions: Arc::new(sessions),
        llm,
        store,
        adapter,
        sent: rx,
    }
}

fn sample_catalog() -> CatalogSnapshot {
    CatalogSnapshot::new(parse_catalog(CATALOG).unwrap())
}

fn event(user: &str, text: &str) -> InboundEvent {
    InboundEvent {
        user: UserKey::new("messenger", user),
        text: text.into(),
        message_id: None,
        timestamp: chrono::Utc::now(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_rapid_fragments_produce_one_turn() {
    let mut h = harness(AssistantMode::Echo, sample_catalog());

    h.sessions.ingest(event("100", "ซีลาย"));
    tokio::time::sleep(Duration::from_secs(5)).await;
    h.sessions.ingest(event("100", "26"));
    tokio::time::sleep(Duration::from_secs(5)).await;
    h.sessions.ingest(event("100", "เบา"));

    let (user, reply) = h.sent.recv().await.unwrap();
    assert_eq!(user, "100");
    assert_eq!(reply, "ตอบ: ซีลาย 26 เบา");

    let normalizer = h.llm.requests_for("normalizer");
    assert_eq!(normalizer.len(), 1);
    assert!(normalizer[0].messages[1]
        .content
        .contains("1. ซีลาย\n2. 26\n3. เบา"));
    assert_eq!(h.llm.requests_for("assistant").len(), 1);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(h.sent.try_recv().is_err());
    assert_eq!(*h.adapter.typing.lock().unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_spec_question_carries_into_bare_product_reply() {
    let mut h = harness(AssistantMode::Echo, sample_catalog());

    h.sessions.ingest(event("200", "ขนาดซีลาย26เท่าไหร่"));
    let (_, first) = h.sent.recv().await.unwrap();
    assert_eq!(first, "ตอบ: ขนาดซีลาย26เท่าไหร่");
    assert!(h.sessions.intents().pending("messenger:200").is_some());

    h.sessions.ingest(event("200", "26เต็ม"));
    let (_, second) = h.sent.recv().await.unwrap();
    assert!(second.starts_with("ตอบ: 26เต็ม"));
    assert!(second.contains(SPEC_HINT));
    assert!(!second.contains(BUNDLE_HINT));
    assert!(h.sessions.intents().pending("messenger:200").is_none());

    // The second assistant call saw the first exchange as history.
    let assistant = h.llm.requests_for("assistant");
    assert_eq!(assistant.len(), 2);
    let contents: Vec<&str> = assistant[1]
        .messages
        .iter()
        .skip(1)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents[0], "ขนาดซีลาย26เท่าไหร่");
    assert_eq!(contents[1], "ตอบ: ขนาดซีลาย26เท่าไหร่");
}

#[tokio::test(start_paused = true)]
async fn test_switching_product_drops_pending_intent() {
    let mut h = harness(AssistantMode::Echo, sample_catalog());

    h.sessions.ingest(event("300", "ซีลาย26มัดละกี่เส้น"));
    h.sent.recv().await.unwrap();
    h.sessions.ingest(event("300", "stud4"));
    let (_, reply) = h.sent.recv().await.unwrap();
    assert_eq!(reply, "ตอบ: stud4");
    assert!(h.sessions.intents().pending("messenger:300").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_completion_timeout_sends_and_records_fallback() {
    let mut h = harness(AssistantMode::Hang, sample_catalog());

    h.sessions.ingest(event("400", "สวัสดีค่ะ"));
    let (_, reply) = h.sent.recv().await.unwrap();
    assert_eq!(reply, "ขอโทษค่ะ กรุณาติดต่อแอดมิน");

    let history = h.store.get("messenger:400").await.unwrap();
    assert_eq!(
        history,
        vec![
            ConversationTurn::user("สวัสดีค่ะ"),
            ConversationTurn::assistant("ขอโทษค่ะ กรุณาติดต่อแอดมิน"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_catalog_still_serves_requests() {
    let missing = std::env::temp_dir()
        .join(format!("shopchat_absent_{}.csv", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string();
    let catalog = Catalog::open(Some(missing), &reqwest::Client::new()).await;
    assert!(catalog.snapshot().lookup("ซีลาย 26").is_none());
    assert!(catalog.snapshot().lookup("stud4").is_none());

    let mut h = harness(AssistantMode::Echo, CatalogSnapshot::empty());
    h.sessions.ingest(event("500", "ขนาดซีลาย26เท่าไหร่"));
    let (_, reply) = h.sent.recv().await.unwrap();
    assert_eq!(reply, "ตอบ: ขนาดซีลาย26เท่าไหร่");
    let pending = h.sessions.intents().pending("messenger:500").unwrap();
    assert_eq!(pending.product_group, None);
}

#[tokio::test(start_paused = true)]
async fn test_users_are_buffered_independently() {
    let mut h = harness(AssistantMode::Echo, sample_catalog());

    h.sessions.ingest(event("a", "ซีลาย"));
    h.sessions.ingest(event("b", "สตัด"));
    h.sessions.ingest(event("a", "26"));

    let mut replies = vec![h.sent.recv().await.unwrap(), h.sent.recv().await.unwrap()];
    replies.sort();
    assert_eq!(
        replies,
        vec![
            ("a".to_string(), "ตอบ: ซีลาย 26".to_string()),
            ("b".to_string(), "ตอบ: สตัด".to_string()),
        ]
    );
}
