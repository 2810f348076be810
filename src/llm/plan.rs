//! The structured plan the LLM returns for one user turn.
//!
//! Non-required fields default so a slightly sloppy provider response still
//! validates; `assistantMessage` is the only hard requirement, enforced by
//! the parser.

use crate::model::{ActionButton, Query, QueryPagination};
use serde::{Deserialize, Serialize};

/// A validated assistant plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssistantPlan {
    /// Markdown prose shown to the user.
    pub assistant_message: String,

    /// Proposed queries, possibly empty.
    #[serde(default)]
    pub queries: Vec<PlannedQuery>,

    /// Buttons proposed by the LLM itself.
    #[serde(default)]
    pub action_buttons: Vec<PlannedButton>,
}

/// One query inside a plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlannedQuery {
    pub query: String,

    #[serde(default)]
    pub query_type: Option<String>,

    /// SQL engines say `tables`; document stores say `collections`.
    #[serde(default, alias = "collections")]
    pub tables: Vec<String>,

    #[serde(default)]
    pub pagination: Option<PlannedPagination>,

    #[serde(default)]
    pub is_critical: bool,

    #[serde(default)]
    pub can_rollback: bool,

    #[serde(default)]
    pub explanation: String,

    #[serde(default)]
    pub example_result: Option<serde_json::Value>,

    #[serde(default)]
    pub rollback_query: Option<String>,

    #[serde(default)]
    pub rollback_dependent_query: Option<String>,

    /// Free-form estimate ("2s", 2, ...); kept opaque.
    #[serde(default)]
    pub estimate_response_time: Option<serde_json::Value>,

    // ClickHouse-only planning hints.
    #[serde(default)]
    pub engine_type: Option<String>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub order_by_key: Option<String>,
}

/// Pagination material inside a plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlannedPagination {
    #[serde(default)]
    pub paginated_query: Option<String>,
    #[serde(default)]
    pub count_query: Option<String>,
}

/// A button inside a plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlannedButton {
    pub label: String,
    pub action: String,
    #[serde(default)]
    pub is_primary: bool,
}

impl PlannedQuery {
    /// Materializes this plan entry as a persisted query embedded in the
    /// assistant message `message_id`, at position `index`.
    pub fn into_query(self, message_id: i64, index: usize) -> Query {
        let pagination = self
            .pagination
            .map(|p| QueryPagination {
                total_records_count: None,
                paginated_query: p.paginated_query,
                count_query: p.count_query,
            })
            .unwrap_or_default();

        let metadata = build_metadata(
            self.estimate_response_time,
            self.engine_type,
            self.partition_key,
            self.order_by_key,
        );

        Query {
            id: format!("{message_id}:q{index}"),
            query: self.query,
            query_type: self.query_type,
            tables: self.tables,
            description: self.explanation,
            can_rollback: self.can_rollback,
            is_critical: self.is_critical,
            is_executed: false,
            is_rolled_back: false,
            is_edited: false,
            rollback_query: self.rollback_query,
            rollback_dependent_query: self.rollback_dependent_query,
            example_result: self.example_result,
            execution_result: None,
            execution_time: None,
            error: None,
            pagination,
            metadata,
            action_at: None,
        }
    }
}

fn build_metadata(
    estimate: Option<serde_json::Value>,
    engine_type: Option<String>,
    partition_key: Option<String>,
    order_by_key: Option<String>,
) -> Option<serde_json::Value> {
    let mut map = serde_json::Map::new();
    if let Some(estimate) = estimate {
        map.insert("estimateResponseTime".to_string(), estimate);
    }
    if let Some(engine_type) = engine_type {
        map.insert("engineType".to_string(), engine_type.into());
    }
    if let Some(partition_key) = partition_key {
        map.insert("partitionKey".to_string(), partition_key.into());
    }
    if let Some(order_by_key) = order_by_key {
        map.insert("orderByKey".to_string(), order_by_key.into());
    }

    if map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(map))
    }
}

impl PlannedButton {
    /// Materializes this plan entry as a persisted action button.
    pub fn into_button(self) -> ActionButton {
        ActionButton::new(self.label, self.action, self.is_primary)
    }
}
