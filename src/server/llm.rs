use crate::config::{ConfigError, ServerConfig};
use crate::retry::RetryPolicy;
use crate::util::truncate_str;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum error-body length carried into an error message
const MAX_ERROR_CONTENT_LEN: usize = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Provider failures, as seen by the handlers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model provider rate limited the request: {0}")]
    RateLimited(String),
    #[error("model provider unavailable: {0}")]
    Unavailable(String),
    #[error("model rejected the request: {0}")]
    InvalidRequest(String),
}

impl ModelError {
    fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("HTTP {}: {}", status, sanitize_api_response(body));
        match status {
            429 => ModelError::RateLimited(detail),
            400..=499 => ModelError::InvalidRequest(detail),
            _ => ModelError::Unavailable(detail),
        }
    }
}

/// Which configured model answers a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Code generation and bug fixing
    Generate,
    /// Conversation and completions
    Chat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One call: messages in, reply text out.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, tier: ModelTier, messages: &[Message]) -> Result<String, ModelError>;

    /// Short name for health reporting
    fn describe(&self) -> String {
        "language model".to_string()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Truncate and redact a provider error body before it is logged or
/// returned to a caller.
fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-",
    ];

    let truncated = truncate_str(content.trim(), MAX_ERROR_CONTENT_LEN);
    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(response details redacted - may contain sensitive data)".to_string();
        }
    }
    truncated.to_string()
}

/// OpenAI-compatible `/v1/chat/completions` client
pub struct OpenAiChatModel {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model_generate: String,
    model_chat: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
}

impl OpenAiChatModel {
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .openai_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key,
            model_generate: config.model_generate.clone(),
            model_chat: config.model_chat.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Generate => &self.model_generate,
            ModelTier::Chat => &self.model_chat,
        }
    }

    async fn attempt(&self, model: &str, messages: &[Message]) -> Result<String, ModelError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = ChatRequest {
            model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(ModelError::from_status(status.as_u16(), &text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            ModelError::Unavailable(format!("failed to parse provider response: {}", e))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ModelError::Unavailable("provider returned no choices".to_string()))
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    /// Rate limits are retried with the shared backoff policy; every other
    /// failure is returned at once.
    async fn complete(&self, tier: ModelTier, messages: &[Message]) -> Result<String, ModelError> {
        let model = self.model_for(tier).to_string();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&model, messages).await {
                Err(ModelError::RateLimited(detail)) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Provider rate limited. Retrying in {:?} (attempt {}/{})",
                        delay, attempt, self.retry.max_attempts
                    );
                    debug!("rate limit detail: {}", detail);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    fn describe(&self) -> String {
        format!("{} / {}", self.model_generate, self.model_chat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model_for(server: &MockServer) -> OpenAiChatModel {
        let config = ServerConfig {
            openai_api_key: Some("test_key_12345".into()),
            openai_base_url: server.uri(),
            ..ServerConfig::default()
        };
        OpenAiChatModel::from_config(&config)
            .unwrap()
            .with_retry(RetryPolicy::new(3).with_delays(
                Duration::from_millis(5),
                Duration::from_millis(10),
            ))
    }

    fn reply(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        }))
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let result = OpenAiChatModel::from_config(&ServerConfig::default());
        assert!(matches!(result, Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn test_error_bodies_are_redacted() {
        assert_eq!(
            sanitize_api_response("Incorrect API key provided: sk-abc123"),
            "(response details redacted - may contain sensitive data)"
        );
        assert_eq!(sanitize_api_response("  model overloaded "), "model overloaded");
        let long = "x".repeat(500);
        assert_eq!(sanitize_api_response(&long).len(), MAX_ERROR_CONTENT_LEN);
    }

    #[tokio::test]
    async fn test_generate_tier_uses_generate_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(bearer_token("test_key_12345"))
            .and(body_partial_json(json!({"model": "gpt-4o", "max_tokens": 1000})))
            .respond_with(reply("fn main() {}"))
            .expect(1)
            .mount(&server)
            .await;

        let model = model_for(&server);
        let out = model
            .complete(ModelTier::Generate, &[Message::user("hello")])
            .await
            .unwrap();
        assert_eq!(out, "fn main() {}");
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried_then_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .expect(3)
            .mount(&server)
            .await;

        let err = model_for(&server)
            .complete(ModelTier::Chat, &[Message::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::RateLimited(_)));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad messages"))
            .expect(1)
            .mount(&server)
            .await;
        let err = model_for(&server)
            .complete(ModelTier::Chat, &[Message::user("hi")])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ModelError::InvalidRequest("HTTP 400: bad messages".into())
        );

        assert!(matches!(
            ModelError::from_status(502, "gateway"),
            ModelError::Unavailable(_)
        ));
    }
}
