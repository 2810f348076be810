//! Execution result types shared between drivers and the executor.

use serde::{Deserialize, Serialize};

/// Options accompanying one driver execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Statement kind as reported by the LLM plan ("SELECT", "INSERT", ...).
    pub query_type: Option<String>,
    /// True when executing a rollback for a previously executed query.
    pub is_rollback: bool,
    /// True for count probes; implementations must not mutate state.
    pub is_count_probe: bool,
}

impl ExecuteOptions {
    /// Options for a plain fetch/mutation execution.
    pub fn query(query_type: Option<String>) -> Self {
        Self {
            query_type,
            ..Default::default()
        }
    }

    /// Options for a rollback execution.
    pub fn rollback() -> Self {
        Self {
            is_rollback: true,
            ..Default::default()
        }
    }

    /// Options for a count probe.
    pub fn count_probe() -> Self {
        Self {
            is_count_probe: true,
            ..Default::default()
        }
    }
}

/// JSON-normalized result of one driver execution.
///
/// Fetch results carry `{"results": [row, ...]}`; mutations carry
/// `{"affectedRows": n}`. The executor caps materialized rows and derives
/// the serialized form from `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverResult {
    /// Structured result value.
    pub result: serde_json::Value,
    /// Wall time the engine spent executing, in milliseconds.
    pub execution_time_ms: i64,
}

impl DriverResult {
    /// Wraps fetched rows in the canonical result shape.
    pub fn rows(rows: Vec<serde_json::Value>, execution_time_ms: i64) -> Self {
        Self {
            result: serde_json::json!({ "results": rows }),
            execution_time_ms,
        }
    }

    /// Wraps a mutation outcome in the canonical result shape.
    pub fn affected(count: u64, execution_time_ms: i64) -> Self {
        Self {
            result: serde_json::json!({ "affectedRows": count }),
            execution_time_ms,
        }
    }

    /// Returns the fetched rows when the result carries any.
    pub fn result_rows(&self) -> Option<&Vec<serde_json::Value>> {
        self.result.get("results").and_then(|v| v.as_array())
    }
}
