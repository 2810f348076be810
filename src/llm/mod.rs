//! LLM integration (C5).
//!
//! Provider-agnostic gateway that assembles the database-aware prompt,
//! requests a structured JSON plan, and validates it. The raw HTTP clients
//! live behind the [`LlmClient`] trait.

pub mod gateway;
pub mod gemini;
pub mod mock;
pub mod openai;
pub mod parser;
pub mod plan;
pub mod prompt;
pub mod types;

pub use gateway::LlmGateway;
pub use gemini::{GeminiClient, GeminiConfig};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, OpenAiConfig};
pub use parser::{parse_plan, ParsedPlan};
pub use plan::{AssistantPlan, PlannedButton, PlannedPagination, PlannedQuery};
pub use prompt::PromptRegistry;
pub use types::{Message, ModelInfo, Role};

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Trait for LLM clients that can generate completions.
///
/// Implementations must be thread-safe and must abort the in-flight HTTP
/// request when `cancel` fires.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generates a completion for the given messages.
    ///
    /// The returned text is expected to be a JSON object conforming to the
    /// per-database response schema injected by the gateway.
    async fn generate(&self, messages: &[Message], cancel: &CancellationToken) -> Result<String>;

    /// Returns the provider and model behind this client.
    fn model_info(&self) -> ModelInfo;
}

/// LLM provider type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LlmProvider {
    /// OpenAI (GPT family).
    #[default]
    OpenAi,
    /// Google Gemini.
    Gemini,
    /// Mock client for testing (no API key required).
    Mock,
}

impl LlmProvider {
    /// Returns the provider as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Mock => "mock",
        }
    }

    /// Parses a provider from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "gemini" | "google" => Some(Self::Gemini),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
