use rusqlite::OptionalExtension;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use shopchat_core::error::ShopChatError;
use shopchat_core::llm_types::ConversationTurn;

const SCHEMA_VERSION_CURRENT: i64 = 1;

pub struct Database {
    conn: Mutex<Connection>,
}

pub async fn call_blocking<T, F>(db: std::sync::Arc<Database>, f: F) -> Result<T, ShopChatError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, ShopChatError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| ShopChatError::Io(std::io::Error::other(format!("DB task join error: {e}"))))?
}

/// A user's stored history window plus its absolute expiry (unix seconds).
#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub user_key: String,
    pub turns: Vec<ConversationTurn>,
    pub expires_at: i64,
}

impl Database {
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn new(data_dir: &str) -> Result<Self, ShopChatError> {
        let db_path = Path::new(data_dir).join("shopchat.db");
        std::fs::create_dir_all(data_dir)?;

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);

            CREATE TABLE IF NOT EXISTS conversations (
                user_key TEXT PRIMARY KEY,
                turns_json TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_expires_at
                ON conversations(expires_at);",
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO db_meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION_CURRENT.to_string()],
        )?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    pub fn get_conversation(
        &self,
        user_key: &str,
    ) -> Result<Option<StoredConversation>, ShopChatError> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                "SELECT user_key, turns_json, expires_at FROM conversations WHERE user_key = ?1",
                params![user_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((user_key, turns_json, expires_at)) = row else {
            return Ok(None);
        };
        let turns: Vec<ConversationTurn> = serde_json::from_str(&turns_json)?;
        Ok(Some(StoredConversation {
            user_key,
            turns,
            expires_at,
        }))
    }

    pub fn put_conversation(&self, conversation: &StoredConversation) -> Result<(), ShopChatError> {
        let turns_json = serde_json::to_string(&conversation.turns)?;
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO conversations (user_key, turns_json, expires_at)
             VALUES (?1, ?2, ?3)",
            params![conversation.user_key, turns_json, conversation.expires_at],
        )?;
        Ok(())
    }

    /// Removes every conversation whose expiry is at or before `now_unix`.
    pub fn purge_expired_conversations(&self, now_unix: i64) -> Result<usize, ShopChatError> {
        let conn = self.lock_conn();
        let n = conn.execute(
            "DELETE FROM conversations WHERE expires_at <= ?1",
            params![now_unix],
        )?;
        Ok(n)
    }
}
