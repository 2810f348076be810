//! User-visible message view: messages, their embedded queries, and the
//! derived action buttons.

use crate::error::QueryError;
use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    User,
    Assistant,
    System,
}

impl MessageType {
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

/// A message in the user-visible view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub is_edited: bool,
    /// For assistant messages, the triggering user message.
    pub user_message_id: Option<i64>,
    pub queries: Option<Vec<Query>>,
    pub action_buttons: Option<Vec<ActionButton>>,
    pub created_at: String,
    pub updated_at: String,
}

impl Message {
    /// Finds an embedded query by id.
    pub fn query(&self, query_id: &str) -> Option<&Query> {
        self.queries
            .as_ref()
            .and_then(|qs| qs.iter().find(|q| q.id == query_id))
    }

    /// Finds an embedded query by id, mutably.
    pub fn query_mut(&mut self, query_id: &str) -> Option<&mut Query> {
        self.queries
            .as_mut()
            .and_then(|qs| qs.iter_mut().find(|q| q.id == query_id))
    }

    /// True when any embedded query carries an execution error.
    pub fn has_query_error(&self) -> bool {
        self.queries
            .as_ref()
            .map(|qs| qs.iter().any(|q| q.error.is_some()))
            .unwrap_or(false)
    }
}

/// Pagination material attached to a fetch query by the LLM.
///
/// `paginated_query` carries the literal `offset_size` placeholder; both
/// fields stay empty when the raw query cannot exceed the row cap.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryPagination {
    pub total_records_count: Option<i64>,
    pub paginated_query: Option<String>,
    pub count_query: Option<String>,
}

impl QueryPagination {
    /// True when there is a usable paginated form.
    pub fn has_paginated_query(&self) -> bool {
        self.paginated_query
            .as_deref()
            .map(|q| !q.trim().is_empty())
            .unwrap_or(false)
    }

    /// True when there is a usable count probe.
    pub fn has_count_query(&self) -> bool {
        self.count_query
            .as_deref()
            .map(|q| !q.trim().is_empty())
            .unwrap_or(false)
    }
}

/// A query proposed by the LLM, embedded in an assistant message.
///
/// Lifecycle over `(is_executed, is_rolled_back, error)`:
/// proposed → executed → rolled-back, with failed-execution and
/// failed-rollback branches carrying an error, and an edited reset back to
/// proposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub id: String,
    pub query: String,
    pub query_type: Option<String>,
    #[serde(default)]
    pub tables: Vec<String>,
    pub description: String,
    #[serde(default)]
    pub can_rollback: bool,
    #[serde(default)]
    pub is_critical: bool,
    #[serde(default)]
    pub is_executed: bool,
    #[serde(default)]
    pub is_rolled_back: bool,
    #[serde(default)]
    pub is_edited: bool,
    pub rollback_query: Option<String>,
    pub rollback_dependent_query: Option<String>,
    pub example_result: Option<serde_json::Value>,
    pub execution_result: Option<serde_json::Value>,
    /// Milliseconds; overwritten by a successful rollback.
    pub execution_time: Option<i64>,
    pub error: Option<QueryError>,
    #[serde(default)]
    pub pagination: QueryPagination,
    pub metadata: Option<serde_json::Value>,
    /// When the last execute/rollback action happened.
    pub action_at: Option<String>,
}

impl Query {
    /// True when execution has not been attempted (or was reset by an edit).
    pub fn is_proposed(&self) -> bool {
        !self.is_executed && !self.is_rolled_back
    }

    /// True when a rollback may be attempted.
    pub fn rollback_allowed(&self) -> bool {
        self.is_executed && !self.is_rolled_back && self.can_rollback
    }

    /// True when the stored rollback query is present and non-empty.
    pub fn has_rollback_query(&self) -> bool {
        self.rollback_query
            .as_deref()
            .map(|q| !q.trim().is_empty())
            .unwrap_or(false)
    }

    /// True when a dependent query must run to synthesize the rollback.
    pub fn needs_rollback_generation(&self) -> bool {
        !self.has_rollback_query()
            && self
                .rollback_dependent_query
                .as_deref()
                .map(|q| !q.trim().is_empty())
                .unwrap_or(false)
    }

    /// Clears all execution state, returning the query to proposed.
    pub fn reset_execution_state(&mut self) {
        self.is_executed = false;
        self.is_rolled_back = false;
        self.execution_result = None;
        self.execution_time = None;
        self.error = None;
        self.pagination.total_records_count = None;
        self.action_at = None;
    }
}

/// Well-known action-button actions.
pub mod actions {
    pub const REFRESH_SCHEMA: &str = "refresh_schema";
    pub const FIX_ERROR: &str = "fix_error";
    pub const FIX_ROLLBACK_ERROR: &str = "fix_rollback_error";
}

/// A UI affordance rendered alongside an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionButton {
    pub id: String,
    pub label: String,
    pub action: String,
    #[serde(default)]
    pub is_primary: bool,
}

impl ActionButton {
    /// Creates a button; the id is derived from the action.
    pub fn new(label: impl Into<String>, action: impl Into<String>, is_primary: bool) -> Self {
        let action = action.into();
        Self {
            id: format!("btn-{action}"),
            label: label.into(),
            action,
            is_primary,
        }
    }

    /// The button offered when an embedded query carries an error.
    pub fn fix_error() -> Self {
        Self::new("Fix error", actions::FIX_ERROR, true)
    }

    /// Transient button attached to a failed-rollback response.
    pub fn fix_rollback_error() -> Self {
        Self::new("Fix rollback error", actions::FIX_ROLLBACK_ERROR, true)
    }
}
