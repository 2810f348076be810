//! Provider-agnostic plan generation (C5).

use crate::db::DatabaseType;
use crate::error::{ChatDbError, Result};
use crate::llm::parser::{parse_plan, ParsedPlan};
use crate::llm::prompt::PromptRegistry;
use crate::llm::types::Message;
use crate::llm::{LlmClient, LlmProvider, ModelInfo};
use crate::model::{LlmContent, LlmMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Assembles prompts, drives the selected provider, and validates the
/// structured response.
pub struct LlmGateway {
    clients: HashMap<LlmProvider, Arc<dyn LlmClient>>,
    default_provider: LlmProvider,
    prompts: PromptRegistry,
}

impl LlmGateway {
    /// Creates a gateway with no clients registered.
    pub fn new(default_provider: LlmProvider) -> Self {
        Self {
            clients: HashMap::new(),
            default_provider,
            prompts: PromptRegistry::new(),
        }
    }

    /// Registers a client for a provider.
    pub fn with_client(mut self, provider: LlmProvider, client: Arc<dyn LlmClient>) -> Self {
        self.clients.insert(provider, client);
        self
    }

    /// Replaces the prompt registry.
    pub fn with_prompts(mut self, prompts: PromptRegistry) -> Self {
        self.prompts = prompts;
        self
    }

    /// The provider answering by default.
    pub fn default_provider(&self) -> LlmProvider {
        self.default_provider
    }

    /// Model info for the active client.
    pub fn model_info(&self) -> Result<ModelInfo> {
        Ok(self.client()?.model_info())
    }

    fn client(&self) -> Result<&Arc<dyn LlmClient>> {
        self.clients.get(&self.default_provider).ok_or_else(|| {
            ChatDbError::upstream_llm(format!(
                "No client registered for provider {}",
                self.default_provider
            ))
        })
    }

    /// Builds the provider request: base system prompt, then the mirror
    /// history in order, then the optional extra user message.
    pub fn build_messages(
        &self,
        history: &[LlmMessage],
        extra_user_message: Option<&str>,
        db_type: DatabaseType,
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(
            self.prompts.system_prompt(self.default_provider, db_type),
        ));

        for row in history {
            let message = match &row.content {
                LlmContent::User { user_message } => Message::user(user_message.clone()),
                LlmContent::Assistant { assistant_response } => {
                    Message::assistant(assistant_response.to_string())
                }
                LlmContent::System { schema_update } => {
                    Message::system(format!("Current database schema:\n\n{schema_update}"))
                }
            };
            messages.push(message);
        }

        if let Some(extra) = extra_user_message {
            messages.push(Message::user(extra));
        }

        messages
    }

    /// Generates and validates one assistant plan.
    ///
    /// The call observes `cancel`: a fired token aborts the provider request
    /// and surfaces as a cancelled error.
    pub async fn generate_plan(
        &self,
        history: &[LlmMessage],
        extra_user_message: Option<&str>,
        db_type: DatabaseType,
        cancel: &CancellationToken,
    ) -> Result<ParsedPlan> {
        let client = self.client()?;
        let messages = self.build_messages(history, extra_user_message, db_type);

        debug!(
            provider = %self.default_provider,
            db_type = %db_type,
            message_count = messages.len(),
            "requesting assistant plan"
        );

        let start = Instant::now();
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ChatDbError::cancelled("LLM call cancelled"));
            }
            result = client.generate(&messages, cancel) => result?,
        };

        let parsed = parse_plan(&response)?;

        info!(
            provider = %self.default_provider,
            duration_ms = start.elapsed().as_millis() as u64,
            query_count = parsed.plan.queries.len(),
            "assistant plan validated"
        );

        Ok(parsed)
    }
}
