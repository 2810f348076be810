//! Google Gemini LLM client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ChatDbError, Result};
use crate::llm::types::{Message, ModelInfo, Role};
use crate::llm::{LlmClient, LlmProvider};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Gemini API base URL.
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Maximum number of retry attempts for transient errors.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// Gemini client configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Model to use (e.g. "gemini-2.0-flash").
    pub model: String,
    /// Completion-token ceiling per request.
    pub max_output_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl GeminiConfig {
    /// Creates a new config with the given API key and model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            max_output_tokens: 4096,
            temperature: 0.2,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Sets the completion-token ceiling.
    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = max;
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Gemini LLM client.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    client: Client,
}

impl GeminiClient {
    /// Creates a new Gemini client with the given configuration.
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatDbError::upstream_llm(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{GEMINI_API_BASE}/{}:generateContent?key={}",
            self.config.model, self.config.api_key
        )
    }

    /// Splits the message list into the system instruction and the
    /// alternating user/model contents Gemini expects.
    fn convert_messages(messages: &[Message]) -> (Option<GeminiSystemInstruction>, Vec<GeminiContent>) {
        let system_text = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let system = if system_text.is_empty() {
            None
        } else {
            Some(GeminiSystemInstruction {
                parts: vec![GeminiPart { text: system_text }],
            })
        };

        let contents = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| GeminiContent {
                role: match m.role {
                    Role::Assistant => "model".to_string(),
                    _ => "user".to_string(),
                },
                parts: vec![GeminiPart {
                    text: m.content.clone(),
                }],
            })
            .collect();

        (system, contents)
    }

    fn parse_error(status: reqwest::StatusCode, body: &str) -> (ChatDbError, bool) {
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED {
            return (
                ChatDbError::upstream_llm("Authentication failed. Check the Gemini API key."),
                false,
            );
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return (
                ChatDbError::upstream_llm("Rate limited by Gemini. Please wait and retry."),
                true,
            );
        }

        let is_retryable = status.is_server_error();

        if let Ok(error_response) = serde_json::from_str::<GeminiErrorResponse>(body) {
            return (
                ChatDbError::upstream_llm(format!(
                    "Gemini API error: {}",
                    error_response.error.message
                )),
                is_retryable,
            );
        }

        (
            ChatDbError::upstream_llm(format!("Gemini API error ({status}): {body}")),
            is_retryable,
        )
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(&self, messages: &[Message], cancel: &CancellationToken) -> Result<String> {
        let (system_instruction, contents) = Self::convert_messages(messages);
        let request = GeminiRequest {
            system_instruction,
            contents,
            generation_config: GeminiGenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
                response_mime_type: "application/json".to_string(),
            },
        };

        let mut last_error = None;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            debug!(attempt, max = MAX_RETRY_ATTEMPTS, "Gemini API request");

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ChatDbError::cancelled("LLM call cancelled"));
                }
                result = self.client.post(self.endpoint()).json(&request).send() => result,
            };

            match result {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.map_err(|e| {
                        ChatDbError::upstream_llm(format!("Failed to read response: {e}"))
                    })?;

                    if status.is_success() {
                        let response: GeminiResponse = serde_json::from_str(&body).map_err(|e| {
                            ChatDbError::upstream_llm(format!("Failed to parse response: {e}"))
                        })?;

                        let text = response
                            .candidates
                            .into_iter()
                            .next()
                            .and_then(|c| c.content.parts.into_iter().next())
                            .map(|p| p.text)
                            .ok_or_else(|| {
                                ChatDbError::upstream_llm("No candidates in Gemini response")
                            })?;

                        return Ok(text);
                    }

                    let (error, is_retryable) = Self::parse_error(status, &body);
                    last_error = Some(error);

                    if !is_retryable || attempt >= MAX_RETRY_ATTEMPTS {
                        break;
                    }
                }
                Err(e) => {
                    let is_retryable = e.is_timeout() || e.is_connect();
                    last_error = Some(ChatDbError::upstream_llm(format!(
                        "Gemini request failed: {e}"
                    )));

                    if !is_retryable || attempt >= MAX_RETRY_ATTEMPTS {
                        break;
                    }
                }
            }

            warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying Gemini request");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ChatDbError::cancelled("LLM call cancelled"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay *= 2;
        }

        Err(last_error
            .unwrap_or_else(|| ChatDbError::upstream_llm("Gemini request failed without detail")))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo::new(LlmProvider::Gemini, self.config.model.clone())
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiCandidateContent,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiErrorBody,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    message: String,
}
