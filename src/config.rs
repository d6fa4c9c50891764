use crate::error::ShopChatError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.4
}
fn default_completion_timeout_secs() -> u64 {
    25
}
fn default_normalizer_timeout_secs() -> u64 {
    15
}
fn default_fragment_silence_ms() -> u64 {
    15_000
}
fn default_fragment_max_count() -> usize {
    16
}
fn default_fragment_max_window_ms() -> u64 {
    60_000
}
fn default_history_turns() -> usize {
    10
}
fn default_history_ttl_secs() -> u64 {
    86_400
}
fn default_intent_ttl_secs() -> u64 {
    600
}
fn default_data_dir() -> String {
    "./shopchat.data".into()
}
fn default_web_host() -> String {
    "0.0.0.0".into()
}
fn default_web_port() -> u16 {
    3000
}
fn default_dedup_window_secs() -> u64 {
    300
}
fn default_fallback_reply() -> String {
    "ขอโทษค่ะ ระบบขัดข้องชั่วคราว รบกวนลองพิมพ์อีกครั้ง หรือติดต่อแอดมินของร้านโดยตรงได้เลยค่ะ 🙏"
        .into()
}
fn default_assistant_persona() -> String {
    "You are a helpful Thai customer support assistant for an online shop. \
     ตอบเป็นภาษาไทยสุภาพ กระชับ ช่วยถามต่อเมื่อข้อมูลไม่พอ. \
     Only quote prices, units, specifications and bundle counts that appear in the product list; \
     if a product is not in the list, say so and offer to connect the customer with a staff member."
        .into()
}
fn default_messenger_api_version() -> String {
    "v16.0".into()
}
fn default_messenger_webhook_path() -> String {
    "/webhook".into()
}
fn default_line_webhook_path() -> String {
    "/line/webhook".into()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStoreKind {
    Memory,
    Sqlite,
}

fn default_conversation_store() -> ConversationStoreKind {
    ConversationStoreKind::Memory
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessengerConfig {
    #[serde(default)]
    pub page_access_token: String,
    #[serde(default)]
    pub verify_token: String,
    /// When set, `X-Hub-Signature-256` is required on every POST.
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_messenger_api_version")]
    pub api_version: String,
    #[serde(default = "default_messenger_webhook_path")]
    pub webhook_path: String,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            page_access_token: String::new(),
            verify_token: String::new(),
            app_secret: String::new(),
            api_version: default_messenger_api_version(),
            webhook_path: default_messenger_webhook_path(),
        }
    }
}

impl MessengerConfig {
    pub fn enabled(&self) -> bool {
        !self.page_access_token.trim().is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LineConfig {
    #[serde(default)]
    pub channel_access_token: String,
    #[serde(default)]
    pub channel_secret: String,
    #[serde(default = "default_line_webhook_path")]
    pub webhook_path: String,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            channel_access_token: String::new(),
            channel_secret: String::new(),
            webhook_path: default_line_webhook_path(),
        }
    }
}

impl LineConfig {
    pub fn enabled(&self) -> bool {
        !self.channel_access_token.trim().is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Model for fragment merging; empty means `model`.
    #[serde(default)]
    pub normalizer_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    #[serde(default = "default_normalizer_timeout_secs")]
    pub normalizer_timeout_secs: u64,
    #[serde(default = "default_fragment_silence_ms")]
    pub fragment_silence_ms: u64,
    #[serde(default = "default_fragment_max_count")]
    pub fragment_max_count: usize,
    #[serde(default = "default_fragment_max_window_ms")]
    pub fragment_max_window_ms: u64,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_history_ttl_secs")]
    pub history_ttl_secs: u64,
    #[serde(default = "default_intent_ttl_secs")]
    pub intent_ttl_secs: u64,
    #[serde(default = "default_conversation_store")]
    pub conversation_store: ConversationStoreKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// CSV file path or http(s) URL.
    #[serde(default)]
    pub catalog_source: Option<String>,
    #[serde(default)]
    pub catalog_reload_interval_secs: u64,
    #[serde(default = "default_web_host")]
    pub web_host: String,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    #[serde(default = "default_assistant_persona")]
    pub assistant_persona: String,
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default)]
    pub messenger: MessengerConfig,
    #[serde(default)]
    pub line: LineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_model(),
            normalizer_model: String::new(),
            temperature: default_temperature(),
            completion_timeout_secs: default_completion_timeout_secs(),
            normalizer_timeout_secs: default_normalizer_timeout_secs(),
            fragment_silence_ms: default_fragment_silence_ms(),
            fragment_max_count: default_fragment_max_count(),
            fragment_max_window_ms: default_fragment_max_window_ms(),
            history_turns: default_history_turns(),
            history_ttl_secs: default_history_ttl_secs(),
            intent_ttl_secs: default_intent_ttl_secs(),
            conversation_store: default_conversation_store(),
            data_dir: default_data_dir(),
            catalog_source: None,
            catalog_reload_interval_secs: 0,
            web_host: default_web_host(),
            web_port: default_web_port(),
            admin_token: None,
            dedup_window_secs: default_dedup_window_secs(),
            fallback_reply: default_fallback_reply(),
            assistant_persona: default_assistant_persona(),
            log_to_file: false,
            messenger: MessengerConfig::default(),
            line: LineConfig::default(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn resolve_config_path() -> Result<Option<PathBuf>, ShopChatError> {
        if let Ok(custom) = std::env::var("SHOPCHAT_CONFIG") {
            if std::path::Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(ShopChatError::Config(format!(
                "SHOPCHAT_CONFIG points to non-existent file: {custom}"
            )));
        }

        for candidate in ["./shopchat.config.yaml", "./shopchat.config.yml"] {
            if std::path::Path::new(candidate).exists() {
                return Ok(Some(PathBuf::from(candidate)));
            }
        }
        Ok(None)
    }

    /// Loads the YAML file if one exists, then applies process environment overrides.
    pub fn load() -> Result<Self, ShopChatError> {
        let mut config = match Self::resolve_config_path()? {
            Some(path) => {
                let path_str = path.to_string_lossy().to_string();
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    ShopChatError::Config(format!("Failed to read {path_str}: {e}"))
                })?;
                serde_yaml::from_str::<Config>(&content).map_err(|e| {
                    ShopChatError::Config(format!("Failed to parse {path_str}: {e}"))
                })?
            }
            None => Config::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.post_deserialize()?;
        Ok(config)
    }

    /// Overrides from environment-style keys; blank values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        if let Some(v) = get("OPENROUTER_API_KEY").or_else(|| get("LLM_API_KEY")) {
            self.api_key = v;
        }
        if let Some(v) = get("LLM_BASE_URL") {
            self.llm_base_url = v;
        }
        if let Some(v) = get("MODEL") {
            self.model = v;
        }
        if let Some(v) = get("NORMALIZER_MODEL") {
            self.normalizer_model = v;
        }
        if let Some(v) = get("CATALOG_SOURCE") {
            self.catalog_source = Some(v);
        }
        if let Some(v) = get("ADMIN_TOKEN") {
            self.admin_token = Some(v);
        }
        if let Some(v) = get("FACEBOOK_PAGE_ACCESS_TOKEN") {
            self.messenger.page_access_token = v;
        }
        if let Some(v) = get("FACEBOOK_VERIFY_TOKEN") {
            self.messenger.verify_token = v;
        }
        if let Some(v) = get("FACEBOOK_APP_SECRET") {
            self.messenger.app_secret = v;
        }
        if let Some(v) = get("LINE_CHANNEL_ACCESS_TOKEN") {
            self.line.channel_access_token = v;
        }
        if let Some(v) = get("LINE_CHANNEL_SECRET") {
            self.line.channel_secret = v;
        }

        if let Some(v) = get("PORT").and_then(|v| v.parse().ok()) {
            self.web_port = v;
        }
        if let Some(v) = get("HISTORY_TURNS").and_then(|v| v.parse().ok()) {
            self.history_turns = v;
        }
        if let Some(v) = get("CHAT_TTL_SECONDS").and_then(|v| v.parse().ok()) {
            self.history_ttl_secs = v;
        }
        if let Some(v) = get("COMPLETION_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.completion_timeout_secs = v;
        }
        if let Some(v) = get("FRAGMENT_SILENCE_MS").and_then(|v| v.parse().ok()) {
            self.fragment_silence_ms = v;
        }
        if let Some(v) = get("FRAGMENT_MAX_COUNT").and_then(|v| v.parse().ok()) {
            self.fragment_max_count = v;
        }
        if let Some(v) = get("FRAGMENT_MAX_WINDOW_MS").and_then(|v| v.parse().ok()) {
            self.fragment_max_window_ms = v;
        }
    }

    /// Apply post-deserialization normalization and validation.
    pub fn post_deserialize(&mut self) -> Result<(), ShopChatError> {
        self.api_key = self.api_key.trim().to_string();
        self.model = self.model.trim().to_string();
        if self.model.is_empty() {
            self.model = default_model();
        }
        self.normalizer_model = self.normalizer_model.trim().to_string();
        if self.llm_base_url.trim().is_empty() {
            self.llm_base_url = default_llm_base_url();
        }
        if self.web_host.trim().is_empty() {
            self.web_host = default_web_host();
        }
        self.catalog_source = non_empty(self.catalog_source.take());
        self.admin_token = non_empty(self.admin_token.take());

        if self.completion_timeout_secs == 0 {
            self.completion_timeout_secs = default_completion_timeout_secs();
        }
        if self.normalizer_timeout_secs == 0 {
            self.normalizer_timeout_secs = default_normalizer_timeout_secs();
        }
        if self.fragment_silence_ms == 0 {
            self.fragment_silence_ms = default_fragment_silence_ms();
        }
        if self.fragment_max_count == 0 {
            self.fragment_max_count = default_fragment_max_count();
        }
        if self.fragment_max_window_ms == 0 {
            self.fragment_max_window_ms = default_fragment_max_window_ms();
        }
        if self.history_turns == 0 {
            self.history_turns = default_history_turns();
        }
        if self.history_ttl_secs == 0 {
            self.history_ttl_secs = default_history_ttl_secs();
        }
        if self.intent_ttl_secs == 0 {
            self.intent_ttl_secs = default_intent_ttl_secs();
        }
        if self.dedup_window_secs == 0 {
            self.dedup_window_secs = default_dedup_window_secs();
        }
        if self.fallback_reply.trim().is_empty() {
            self.fallback_reply = default_fallback_reply();
        }
        if !(self.temperature.is_finite() && (0.0..=2.0).contains(&self.temperature)) {
            return Err(ShopChatError::Config(format!(
                "temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }
        if self.fragment_silence_ms > self.fragment_max_window_ms {
            return Err(ShopChatError::Config(format!(
                "fragment_silence_ms ({}) must not exceed fragment_max_window_ms ({})",
                self.fragment_silence_ms, self.fragment_max_window_ms
            )));
        }
        for (name, path) in [
            ("messenger.webhook_path", &self.messenger.webhook_path),
            ("line.webhook_path", &self.line.webhook_path),
        ] {
            if !path.starts_with('/') {
                return Err(ShopChatError::Config(format!(
                    "{name} must start with '/', got '{path}'"
                )));
            }
        }
        if self.messenger.enabled()
            && self.line.enabled()
            && self.messenger.webhook_path == self.line.webhook_path
        {
            return Err(ShopChatError::Config(
                "messenger and line webhook paths must differ".into(),
            ));
        }
        if self.api_key.is_empty() {
            return Err(ShopChatError::Config(
                "api_key is required (set OPENROUTER_API_KEY)".into(),
            ));
        }
        Ok(())
    }

    pub fn normalizer_model(&self) -> &str {
        if self.normalizer_model.is_empty() {
            &self.model
        } else {
            &self.normalizer_model
        }
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn normalizer_timeout(&self) -> Duration {
        Duration::from_secs(self.normalizer_timeout_secs)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }

    pub fn has_channel(&self) -> bool {
        self.messenger.enabled() || self.line.enabled()
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Config {
            api_key: "test-key".into(),
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_config_yaml_defaults() {
        let config: Config = serde_yaml::from_str("api_key: key\n").unwrap();
        assert_eq!(config.llm_base_url, "https://openrouter.ai/api/v1");
        assert_eq!(config.completion_timeout_secs, 25);
        assert_eq!(config.fragment_silence_ms, 15_000);
        assert_eq!(config.fragment_max_count, 16);
        assert_eq!(config.fragment_max_window_ms, 60_000);
        assert_eq!(config.history_turns, 10);
        assert_eq!(config.history_ttl_secs, 86_400);
        assert_eq!(config.conversation_store, ConversationStoreKind::Memory);
        assert_eq!(config.messenger.api_version, "v16.0");
        assert_eq!(config.messenger.webhook_path, "/webhook");
        assert_eq!(config.line.webhook_path, "/line/webhook");
        assert!(!config.has_channel());
    }

    #[test]
    fn test_env_overrides_use_deployment_names() {
        let vars = env(&[
            ("OPENROUTER_API_KEY", " sk-or "),
            ("MODEL", "anthropic/claude-3.5-haiku"),
            ("FACEBOOK_PAGE_ACCESS_TOKEN", "page-token"),
            ("FACEBOOK_VERIFY_TOKEN", "verify"),
            ("PORT", "8080"),
            ("HISTORY_TURNS", "20"),
            ("CHAT_TTL_SECONDS", "3600"),
            ("LINE_CHANNEL_SECRET", ""),
        ]);
        let mut config = Config::default();
        config.apply_env_overrides(|k| vars.get(k).cloned());
        config.post_deserialize().unwrap();

        assert_eq!(config.api_key, "sk-or");
        assert_eq!(config.model, "anthropic/claude-3.5-haiku");
        assert_eq!(config.normalizer_model(), "anthropic/claude-3.5-haiku");
        assert!(config.messenger.enabled());
        assert_eq!(config.messenger.verify_token, "verify");
        assert_eq!(config.web_port, 8080);
        assert_eq!(config.history_turns, 20);
        assert_eq!(config.history_ttl_secs, 3600);
        assert!(config.line.channel_secret.is_empty());
    }

    #[test]
    fn test_env_override_ignores_unparsable_numbers() {
        let vars = env(&[("PORT", "not-a-port")]);
        let mut config = Config::test_defaults();
        config.apply_env_overrides(|k| vars.get(k).cloned());
        assert_eq!(config.web_port, 3000);
    }

    #[test]
    fn test_post_deserialize_missing_api_key() {
        let mut config = Config::default();
        let err = config.post_deserialize().unwrap_err();
        assert!(err.to_string().contains("api_key is required"));
    }

    #[test]
    fn test_post_deserialize_zero_values_use_defaults() {
        let yaml = "api_key: key\nfragment_max_count: 0\ncompletion_timeout_secs: 0\nhistory_turns: 0\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.post_deserialize().unwrap();
        assert_eq!(config.fragment_max_count, 16);
        assert_eq!(config.completion_timeout(), Duration::from_secs(25));
        assert_eq!(config.history_turns, 10);
    }

    #[test]
    fn test_post_deserialize_rejects_silence_longer_than_window() {
        let yaml = "api_key: key\nfragment_silence_ms: 90000\nfragment_max_window_ms: 60000\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.post_deserialize().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn test_post_deserialize_rejects_relative_webhook_path() {
        let yaml = "api_key: key\nline:\n  channel_access_token: t\n  webhook_path: line\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.post_deserialize().unwrap_err();
        assert!(err.to_string().contains("line.webhook_path"));
    }

    #[test]
    fn test_post_deserialize_blank_optionals_become_none() {
        let yaml = "api_key: key\ncatalog_source: '  '\nadmin_token: ''\n";
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.post_deserialize().unwrap();
        assert!(config.catalog_source.is_none());
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_config_yaml_roundtrip() {
        let mut config = Config::test_defaults();
        config.conversation_store = ConversationStoreKind::Sqlite;
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.api_key, "test-key");
        assert_eq!(parsed.conversation_store, ConversationStoreKind::Sqlite);
    }
}
