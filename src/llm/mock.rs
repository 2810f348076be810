//! Mock LLM client for testing.
//!
//! Returns canned plan JSON based on the last user message, records every
//! request, and can simulate slow providers for cancellation tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ChatDbError, Result};
use crate::llm::types::{Message, ModelInfo, Role};
use crate::llm::{LlmClient, LlmProvider};

/// Mock LLM client scripted by substring pattern.
#[derive(Default)]
pub struct MockLlmClient {
    /// Custom response mappings (pattern in last user message -> response).
    responses: Mutex<Vec<(String, String)>>,
    /// Artificial latency before answering.
    delay: Option<Duration>,
    /// Requests served so far.
    calls: Arc<AtomicUsize>,
    /// Captured request histories.
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl MockLlmClient {
    /// Creates a new mock client with default responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a custom response for user messages containing `pattern`.
    pub fn with_response(self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.into(), response.into()));
        self
    }

    /// Makes every request wait before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of requests served.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Message lists of every request, in order.
    pub fn captured_requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    fn mock_response(&self, input: &str) -> String {
        let input_lower = input.to_lowercase();

        {
            let responses = self.responses.lock().unwrap();
            for (pattern, response) in responses.iter() {
                if input_lower.contains(&pattern.to_lowercase()) {
                    return response.clone();
                }
            }
        }

        if input_lower.contains("rollback") {
            return serde_json::json!({
                "assistantMessage": "Rollback generated from the dependent result.",
                "queries": [{
                    "query": "DELETE FROM shipping_addresses WHERE user_id = 4",
                    "queryType": "DELETE",
                    "explanation": "Remove shipping addresses for user 4",
                    "isCritical": true,
                    "canRollback": true,
                    "rollbackQuery": "INSERT INTO shipping_addresses (user_id, street) VALUES (4, 'Main St 1')"
                }]
            })
            .to_string();
        }

        if input_lower.contains("users") {
            return serde_json::json!({
                "assistantMessage": "Here are the users.",
                "queries": [{
                    "query": "SELECT * FROM users ORDER BY created_at DESC LIMIT 5",
                    "queryType": "SELECT",
                    "tables": ["users"],
                    "explanation": "Latest five users",
                    "isCritical": false,
                    "canRollback": false
                }]
            })
            .to_string();
        }

        serde_json::json!({
            "assistantMessage": "I could not map that request to a query."
        })
        .to_string()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, messages: &[Message], cancel: &CancellationToken) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(messages.to_vec());

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ChatDbError::cancelled("LLM call cancelled"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(ChatDbError::cancelled("LLM call cancelled"));
        }

        let input = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        Ok(self.mock_response(input))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo::new(LlmProvider::Mock, "mock-1")
    }
}
