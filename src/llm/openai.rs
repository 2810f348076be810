//! OpenAI LLM client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ChatDbError, Result};
use crate::llm::types::{Message, ModelInfo};
use crate::llm::{LlmClient, LlmProvider};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// OpenAI API base URL.
const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Maximum number of retry attempts for transient errors.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// OpenAI client configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Model to use (e.g. "gpt-4o").
    pub model: String,
    /// Completion-token ceiling per request.
    pub max_completion_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    /// Creates a new config with the given API key and model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            max_completion_tokens: 4096,
            temperature: 0.2,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Sets the completion-token ceiling.
    pub fn with_max_completion_tokens(mut self, max: u32) -> Self {
        self.max_completion_tokens = max;
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// OpenAI LLM client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiClient {
    /// Creates a new OpenAI client with the given configuration.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatDbError::upstream_llm(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn convert_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
        messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect()
    }

    /// Parses an API error response and returns (error, is_retryable).
    fn parse_error(status: reqwest::StatusCode, body: &str) -> (ChatDbError, bool) {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return (
                ChatDbError::upstream_llm("Authentication failed. Check the OpenAI API key."),
                false,
            );
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return (
                ChatDbError::upstream_llm("Rate limited by OpenAI. Please wait and retry."),
                true,
            );
        }

        let is_retryable = status.is_server_error();

        if let Ok(error_response) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            return (
                ChatDbError::upstream_llm(format!(
                    "OpenAI API error: {}",
                    error_response.error.message
                )),
                is_retryable,
            );
        }

        (
            ChatDbError::upstream_llm(format!("OpenAI API error ({status}): {body}")),
            is_retryable,
        )
    }

    fn is_retryable_request_error(error: &reqwest::Error) -> bool {
        error.is_timeout() || error.is_connect()
    }

    async fn send_once(&self, request: &OpenAiRequest) -> std::result::Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, messages: &[Message], cancel: &CancellationToken) -> Result<String> {
        let request = OpenAiRequest {
            model: self.config.model.clone(),
            messages: Self::convert_messages(messages),
            temperature: self.config.temperature,
            max_completion_tokens: self.config.max_completion_tokens,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let mut last_error = None;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            debug!(attempt, max = MAX_RETRY_ATTEMPTS, "OpenAI API request");

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the in-flight future closes the HTTP stream.
                    return Err(ChatDbError::cancelled("LLM call cancelled"));
                }
                result = self.send_once(&request) => result,
            };

            match result {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.map_err(|e| {
                        ChatDbError::upstream_llm(format!("Failed to read response: {e}"))
                    })?;

                    if status.is_success() {
                        let response: OpenAiResponse = serde_json::from_str(&body).map_err(|e| {
                            ChatDbError::upstream_llm(format!("Failed to parse response: {e}"))
                        })?;

                        let choice = response.choices.into_iter().next().ok_or_else(|| {
                            ChatDbError::upstream_llm("No choices in OpenAI response")
                        })?;

                        return Ok(choice.message.content.unwrap_or_default());
                    }

                    let (error, is_retryable) = Self::parse_error(status, &body);
                    last_error = Some(error);

                    if !is_retryable || attempt >= MAX_RETRY_ATTEMPTS {
                        break;
                    }
                }
                Err(e) => {
                    let is_retryable = Self::is_retryable_request_error(&e);
                    last_error = Some(ChatDbError::upstream_llm(format!(
                        "OpenAI request failed: {e}"
                    )));

                    if !is_retryable || attempt >= MAX_RETRY_ATTEMPTS {
                        break;
                    }
                }
            }

            warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying OpenAI request");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ChatDbError::cancelled("LLM call cancelled"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay *= 2;
        }

        Err(last_error
            .unwrap_or_else(|| ChatDbError::upstream_llm("OpenAI request failed without detail")))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo::new(LlmProvider::OpenAi, self.config.model.clone())
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f64,
    max_completion_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiErrorBody,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = OpenAiConfig::new("sk-test", "gpt-4o")
            .with_temperature(0.5)
            .with_max_completion_tokens(1024)
            .with_timeout(30);
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.temperature, 0.5);
        assert_eq!(config.max_completion_tokens, 1024);
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn test_request_serialization() {
        let request = OpenAiRequest {
            model: "gpt-4o".to_string(),
            messages: OpenAiClient::convert_messages(&[
                Message::system("prompt"),
                Message::user("show users"),
            ]),
            temperature: 0.2,
            max_completion_tokens: 4096,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "show users");
        assert_eq!(json["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_parse_error_unauthorized_not_retryable() {
        let (err, retryable) =
            OpenAiClient::parse_error(reqwest::StatusCode::UNAUTHORIZED, "{}");
        assert_eq!(err.code(), "UPSTREAM_LLM_ERROR");
        assert!(!retryable);
    }

    #[test]
    fn test_parse_error_rate_limit_retryable() {
        let (_, retryable) =
            OpenAiClient::parse_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "{}");
        assert!(retryable);
    }

    #[test]
    fn test_parse_error_body_message() {
        let body = r#"{"error": {"message": "model overloaded"}}"#;
        let (err, retryable) =
            OpenAiClient::parse_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, body);
        assert!(err.to_string().contains("model overloaded"));
        assert!(retryable);
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let client = OpenAiClient::new(OpenAiConfig::new("sk-test", "gpt-4o")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .generate(&[Message::user("hi")], &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }
}
