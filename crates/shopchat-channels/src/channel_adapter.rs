use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique name: "messenger", "line"
    fn name(&self) -> &str;

    /// Longest text the platform accepts in one message, in characters.
    fn max_message_chars(&self) -> usize;

    /// Send one message (already within `max_message_chars`) to a user.
    async fn send_text(&self, external_user_id: &str, text: &str) -> Result<(), String>;

    /// Show a typing indicator. Default: not supported, silently ignored.
    async fn send_typing(&self, _external_user_id: &str) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ChannelRegistry {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ChannelAdapter>> {
        self.adapters.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_any(&self) -> bool {
        !self.adapters.is_empty()
    }
}
