//! Chat entity: one conversation bound to one database connection.

use crate::config::ConnectionInfo;
use serde::{Deserialize, Serialize};

/// Sentinel meaning "project every table into the LLM prompt".
pub const ALL_COLLECTIONS: &str = "ALL";

/// Per-chat behavior toggles.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    /// When true, non-critical planned queries run without user review.
    pub auto_execute_query: bool,
    /// When true, example rows may be shared with the LLM.
    #[serde(rename = "shareDataWithAI")]
    pub share_data_with_ai: bool,
}

/// A user-owned conversation bound to exactly one connection descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: i64,
    pub user_id: String,
    /// Plaintext only within request scope; sealed at rest.
    pub connection: ConnectionInfo,
    /// `"ALL"`, `""`, or a comma-separated table list.
    pub selected_collections: String,
    pub settings: ChatSettings,
    pub created_at: String,
    pub updated_at: String,
}

impl Chat {
    /// Returns the selected tables, or `None` when every table is selected.
    pub fn selected_collection_list(&self) -> Option<Vec<String>> {
        let trimmed = self.selected_collections.trim();
        if trimmed.is_empty() || trimmed == ALL_COLLECTIONS {
            return None;
        }
        Some(
            trimmed
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    /// True when the caller owns this chat.
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}
