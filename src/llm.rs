use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::Config;
use crate::error::ShopChatError;
use crate::llm_types::{ChatCompletionRequest, ChatCompletionResponse};

const OPENROUTER_REFERER: &str = "https://github.com/shopchat/shopchat";
const OPENROUTER_TITLE: &str = "shopchat retail assistant";

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn send_chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ShopChatError>;
}

/// Runs one completion under `timeout` and returns the trimmed first choice.
///
/// Dropping the in-flight future on timeout cancels the HTTP request. No retries.
pub async fn complete_text(
    provider: &dyn LlmProvider,
    request: &ChatCompletionRequest,
    timeout: Duration,
) -> Result<String, ShopChatError> {
    let response = tokio::time::timeout(timeout, provider.send_chat(request))
        .await
        .map_err(|_| ShopChatError::CompletionTimeout(timeout.as_secs()))??;
    response
        .first_text()
        .map(ToOwned::to_owned)
        .ok_or(ShopChatError::EmptyCompletion)
}

pub fn create_provider(config: &Config) -> Box<dyn LlmProvider> {
    Box::new(OpenAiCompatibleProvider::new(config))
}

/// `/chat/completions` client; OpenRouter gets its attribution headers.
pub struct OpenAiCompatibleProvider {
    http: reqwest::Client,
    api_key: String,
    chat_url: String,
    is_openrouter: bool,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &Config) -> Self {
        let base = config.llm_base_url.trim_end_matches('/');
        OpenAiCompatibleProvider {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            chat_url: format!("{base}/chat/completions"),
            is_openrouter: base.contains("openrouter.ai"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OaiErrorResponse {
    error: OaiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OaiErrorDetail {
    message: String,
}

fn describe_http_error(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(err) = serde_json::from_str::<OaiErrorResponse>(body) {
        return format!("HTTP {status}: {}", err.error.message);
    }
    format!(
        "HTTP {status}: {}",
        body.chars().take(300).collect::<String>()
    )
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn send_chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ShopChatError> {
        let mut req = self
            .http
            .post(&self.chat_url)
            .header("Content-Type", "application/json")
            .json(request);
        if !self.api_key.trim().is_empty() {
            req = req.bearer_auth(self.api_key.trim());
        }
        if self.is_openrouter {
            req = req
                .header("HTTP-Referer", OPENROUTER_REFERER)
                .header("X-Title", OPENROUTER_TITLE);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ShopChatError::CompletionTransport(format!("request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ShopChatError::CompletionTransport(format!("reading body: {e}")))?;

        if !status.is_success() {
            return Err(ShopChatError::CompletionTransport(describe_http_error(
                status, &body,
            )));
        }
        debug!(model = %request.model, bytes = body.len(), "completion received");
        serde_json::from_str(&body).map_err(|e| {
            ShopChatError::CompletionTransport(format!(
                "unparsable completion body: {e}; body: {}",
                body.chars().take(300).collect::<String>()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_types::ChatMessage;
    use serde_json::json;

    struct FixedLlm(serde_json::Value);

    #[async_trait]
    impl LlmProvider for FixedLlm {
        async fn send_chat(
            &self,
            _request: &ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, ShopChatError> {
            Ok(serde_json::from_value(self.0.clone())?)
        }
    }

    struct SlowLlm;

    #[async_trait]
    impl LlmProvider for SlowLlm {
        async fn send_chat(
            &self,
            _request: &ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, ShopChatError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ShopChatError::CompletionTransport("unreachable".into()))
        }
    }

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest::new("m", 0.4, "sys", vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn test_complete_text_returns_trimmed_content() {
        let llm = FixedLlm(json!({"choices": [{"message": {"content": " ok \n"}}]}));
        let text = complete_text(&llm, &request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(text, "ok");
    }

    #[tokio::test]
    async fn test_complete_text_empty_choice_is_error() {
        let llm = FixedLlm(json!({"choices": [{"message": {"content": ""}}]}));
        let err = complete_text(&llm, &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ShopChatError::EmptyCompletion));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_text_times_out() {
        let err = complete_text(&SlowLlm, &request(), Duration::from_secs(25))
            .await
            .unwrap_err();
        assert!(matches!(err, ShopChatError::CompletionTimeout(25)));
        assert!(err.is_completion_failure());
    }

    #[test]
    fn test_provider_builds_chat_url() {
        let mut config = Config::test_defaults();
        config.llm_base_url = "https://api.openai.com/v1/".into();
        let provider = OpenAiCompatibleProvider::new(&config);
        assert_eq!(provider.chat_url, "https://api.openai.com/v1/chat/completions");
        assert!(!provider.is_openrouter);

        let provider = OpenAiCompatibleProvider::new(&Config::test_defaults());
        assert!(provider.is_openrouter);
    }

    #[test]
    fn test_describe_http_error_prefers_api_message() {
        let status = reqwest::StatusCode::BAD_GATEWAY;
        let msg = describe_http_error(status, r#"{"error":{"message":"upstream down"}}"#);
        assert!(msg.contains("upstream down"));
        let msg = describe_http_error(status, "plain failure");
        assert!(msg.contains("plain failure"));
    }
}
