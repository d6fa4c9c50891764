use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::db::{call_blocking, Database, StoredConversation};
use shopchat_core::error::ShopChatError;
use shopchat_core::llm_types::ConversationTurn;

/// Bounded, expiring per-user history.
///
/// `append` keeps only the most recent `max_turns` turns and restarts the
/// expiry clock. Concurrent appends for one user are last-write-wins.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, user_key: &str) -> Result<Vec<ConversationTurn>, ShopChatError>;

    async fn append(
        &self,
        user_key: &str,
        new_turns: Vec<ConversationTurn>,
    ) -> Result<(), ShopChatError>;

    /// Drops expired entries; returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, ShopChatError>;
}

fn keep_recent(mut turns: Vec<ConversationTurn>, max_turns: usize) -> Vec<ConversationTurn> {
    if turns.len() > max_turns {
        turns.drain(..turns.len() - max_turns);
    }
    turns
}

struct MemoryEntry {
    turns: Vec<ConversationTurn>,
    expires_at: Instant,
}

pub struct MemoryConversationStore {
    max_turns: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryConversationStore {
    pub fn new(max_turns: usize, ttl: Duration) -> Self {
        Self {
            max_turns: max_turns.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, MemoryEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get(&self, user_key: &str) -> Result<Vec<ConversationTurn>, ShopChatError> {
        let now = Instant::now();
        let mut entries = self.lock_entries();
        match entries.get(user_key) {
            Some(entry) if entry.expires_at > now => Ok(entry.turns.clone()),
            Some(_) => {
                entries.remove(user_key);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn append(
        &self,
        user_key: &str,
        new_turns: Vec<ConversationTurn>,
    ) -> Result<(), ShopChatError> {
        let now = Instant::now();
        let mut entries = self.lock_entries();
        let mut turns = match entries.remove(user_key) {
            Some(entry) if entry.expires_at > now => entry.turns,
            _ => Vec::new(),
        };
        turns.extend(new_turns);
        entries.insert(
            user_key.to_string(),
            MemoryEntry {
                turns: keep_recent(turns, self.max_turns),
                expires_at: now + self.ttl,
            },
        );
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, ShopChatError> {
        let now = Instant::now();
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        Ok(before - entries.len())
    }
}

/// History persisted as one JSON row per user with an absolute expiry.
pub struct SqliteConversationStore {
    db: Arc<Database>,
    max_turns: usize,
    ttl: Duration,
}

impl SqliteConversationStore {
    pub fn new(db: Arc<Database>, max_turns: usize, ttl: Duration) -> Self {
        Self {
            db,
            max_turns: max_turns.max(1),
            ttl,
        }
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn get(&self, user_key: &str) -> Result<Vec<ConversationTurn>, ShopChatError> {
        let key = user_key.to_string();
        let stored = call_blocking(self.db.clone(), move |db| db.get_conversation(&key)).await?;
        let now = chrono::Utc::now().timestamp();
        Ok(match stored {
            Some(conv) if conv.expires_at > now => conv.turns,
            _ => Vec::new(),
        })
    }

    async fn append(
        &self,
        user_key: &str,
        new_turns: Vec<ConversationTurn>,
    ) -> Result<(), ShopChatError> {
        let key = user_key.to_string();
        let max_turns = self.max_turns;
        let ttl_secs = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        call_blocking(self.db.clone(), move |db| {
            let now = chrono::Utc::now().timestamp();
            let mut turns = match db.get_conversation(&key)? {
                Some(conv) if conv.expires_at > now => conv.turns,
                _ => Vec::new(),
            };
            turns.extend(new_turns);
            db.put_conversation(&StoredConversation {
                user_key: key,
                turns: keep_recent(turns, max_turns),
                expires_at: now.saturating_add(ttl_secs),
            })
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, ShopChatError> {
        let now = chrono::Utc::now().timestamp();
        call_blocking(self.db.clone(), move |db| db.purge_expired_conversations(now)).await
    }
}
