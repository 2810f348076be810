//! LLM-visible mirror of the conversation.
//!
//! Every user/assistant message has exactly one mirror row whose `content`
//! is a tagged union by role, stored as a single one-key JSON object. A
//! chat holds at most one system-role row (schema updates overwrite).

use serde::{Deserialize, Serialize};

/// Role of a mirror row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    User,
    Assistant,
    System,
}

impl LlmRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "assistant" => Self::Assistant,
            "system" => Self::System,
            _ => Self::User,
        }
    }
}

/// The role-shaped content payload.
///
/// Serialized shapes are exactly `{"user_message": …}`,
/// `{"assistant_response": …}`, and `{"schema_update": …}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LlmContent {
    User {
        user_message: String,
    },
    Assistant {
        /// The original plan JSON exactly as validated from the provider.
        assistant_response: serde_json::Value,
    },
    System {
        schema_update: String,
    },
}

impl LlmContent {
    /// The role implied by the payload shape.
    pub fn role(&self) -> LlmRole {
        match self {
            Self::User { .. } => LlmRole::User,
            Self::Assistant { .. } => LlmRole::Assistant,
            Self::System { .. } => LlmRole::System,
        }
    }

    /// The flat text handed to the LLM for this row.
    pub fn as_prompt_text(&self) -> String {
        match self {
            Self::User { user_message } => user_message.clone(),
            Self::Assistant { assistant_response } => assistant_response.to_string(),
            Self::System { schema_update } => schema_update.clone(),
        }
    }
}

/// A row in the LLM-visible view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmMessage {
    pub id: i64,
    pub chat_id: i64,
    /// The mirrored user/assistant message; absent for system rows.
    pub message_id: Option<i64>,
    pub role: LlmRole,
    pub content: LlmContent,
    #[serde(default)]
    pub is_edited: bool,
    pub created_at: String,
}
