//! Query execution against the chat's live connection.
//!
//! Handles auto-connect with a single settle retry, the count probe, the
//! `offset_size` substitution with raw-query fallback, the row cap, and
//! per-stream cancellation. Driver failures land in the outcome's error
//! envelope, never in the transport error channel.

use crate::connection::ConnectionManager;
use crate::db::{classify_query, DatabaseConnection, ExecuteOptions, QueryKind};
use crate::error::{query_error_codes, QueryError};
use crate::executor::CancelRegistry;
use crate::model::{Chat, Query};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cap on materialized result rows; the count probe is the sole source of
/// the true total.
pub const MAX_RESULT_ROWS: usize = 50;

/// Deadline for interactive execute/rollback calls.
pub const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Settle delay before the single auto-connect retry.
const CONNECT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Placeholder substituted with the page offset.
const OFFSET_PLACEHOLDER: &str = "offset_size";

/// Output of one execution attempt.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    /// Capped structured result; `None` when execution failed.
    pub result: Option<serde_json::Value>,
    /// Serialized form of `result`.
    pub result_json: Option<String>,
    /// Wall time of the final attempt, in milliseconds.
    pub execution_time_ms: i64,
    /// Total from the count probe, when one ran and parsed.
    pub total_records_count: Option<i64>,
    /// Driver error, recorded on the query rather than thrown.
    pub error: Option<QueryError>,
}

/// Executes queries for chats through the connection manager.
pub struct QueryExecutor {
    manager: Arc<ConnectionManager>,
    cancels: Arc<CancelRegistry>,
}

impl QueryExecutor {
    pub fn new(manager: Arc<ConnectionManager>, cancels: Arc<CancelRegistry>) -> Self {
        Self { manager, cancels }
    }

    /// The cancel registry governing in-flight executions.
    pub fn cancels(&self) -> &Arc<CancelRegistry> {
        &self.cancels
    }

    /// Cancels the stream's in-flight execution, if any.
    pub fn cancel(&self, stream_id: &str) -> bool {
        self.cancels.cancel(stream_id)
    }

    /// Executes a persisted query with pagination handling.
    ///
    /// `offset` is 0 on the first execute; pagination walks pass 50, 100, …
    pub async fn execute_query(
        &self,
        chat: &Chat,
        query: &Query,
        stream_id: &str,
        offset: i64,
    ) -> ExecutionOutcome {
        let token = self.cancels.register(stream_id);
        let outcome = self.execute_query_inner(chat, query, stream_id, offset, &token).await;
        self.cancels.clear(stream_id);
        outcome
    }

    async fn execute_query_inner(
        &self,
        chat: &Chat,
        query: &Query,
        stream_id: &str,
        offset: i64,
        token: &CancellationToken,
    ) -> ExecutionOutcome {
        let handle = match self.ensure_connection(chat, stream_id).await {
            Ok(handle) => handle,
            Err(error) => {
                return ExecutionOutcome {
                    error: Some(error),
                    ..Default::default()
                }
            }
        };

        // Count probe, first execute only. Missing total is non-fatal.
        let mut total_records_count = None;
        if offset == 0 && query.pagination.has_count_query() {
            let count_text = query.pagination.count_query.as_deref().unwrap_or_default();
            total_records_count = self.run_count_probe(&handle, count_text, token).await;
        }

        let opts = ExecuteOptions::query(query.query_type.clone());

        // Paginated form first, raw query as the single fallback.
        let (attempt, used_pagination) = if query.pagination.has_paginated_query() {
            let paginated = query
                .pagination
                .paginated_query
                .as_deref()
                .unwrap_or_default()
                .replace(OFFSET_PLACEHOLDER, &offset.to_string());
            (paginated, true)
        } else {
            (query.query.clone(), false)
        };

        let mut result = self.run_with_deadline(&handle, &attempt, &opts, token).await;

        if used_pagination {
            if let Err(error) = &result {
                if error.code != query_error_codes::QUERY_EXECUTION_CANCELLED {
                    warn!(
                        query_id = %query.id,
                        code = %error.code,
                        "paginated form rejected, retrying raw query"
                    );
                    result = self.run_with_deadline(&handle, &query.query, &opts, token).await;
                }
            }
        }

        match result {
            Ok(driver_result) => {
                let capped = cap_result(driver_result.result);
                let result_json = serde_json::to_string(&capped).ok();
                ExecutionOutcome {
                    result: Some(capped),
                    result_json,
                    execution_time_ms: driver_result.execution_time_ms,
                    total_records_count,
                    error: None,
                }
            }
            Err(error) => ExecutionOutcome {
                total_records_count,
                error: Some(error),
                ..Default::default()
            },
        }
    }

    /// Executes free-form text (rollback or rollback-dependent queries).
    pub async fn execute_text(
        &self,
        chat: &Chat,
        text: &str,
        stream_id: &str,
        is_rollback: bool,
    ) -> Result<crate::db::DriverResult, QueryError> {
        let token = self.cancels.register(stream_id);

        let result = match self.ensure_connection(chat, stream_id).await {
            Ok(handle) => {
                let opts = if is_rollback {
                    ExecuteOptions::rollback()
                } else {
                    ExecuteOptions::query(None)
                };
                self.run_with_deadline(&handle, text, &opts, &token).await
            }
            Err(error) => Err(error),
        };

        self.cancels.clear(stream_id);
        result
    }

    /// Resolves the chat's live handle, auto-connecting with one settle
    /// retry when none exists.
    async fn ensure_connection(
        &self,
        chat: &Chat,
        stream_id: &str,
    ) -> Result<Arc<dyn DatabaseConnection>, QueryError> {
        if let Some(handle) = self.manager.handle(chat.id).await {
            return Ok(handle);
        }

        debug!(chat_id = chat.id, "no live connection, auto-connecting");
        let first = self
            .manager
            .connect(chat.id, &chat.user_id, stream_id, &chat.connection)
            .await;

        if let Err(first_err) = first {
            // Single retry after a settle delay; never loops.
            tokio::time::sleep(CONNECT_SETTLE_DELAY).await;
            if let Err(retry_err) = self
                .manager
                .connect(chat.id, &chat.user_id, stream_id, &chat.connection)
                .await
            {
                return Err(QueryError::new(
                    query_error_codes::CONNECTION_FAILED,
                    format!("Could not connect to the database: {retry_err}"),
                )
                .with_details(first_err.to_string()));
            }
        }

        self.manager.handle(chat.id).await.ok_or_else(|| {
            QueryError::new(
                query_error_codes::CONNECTION_FAILED,
                "Connection vanished after connect",
            )
        })
    }

    /// Runs the count probe; refuses non-fetch probes; failures are
    /// swallowed (total stays unknown).
    async fn run_count_probe(
        &self,
        handle: &Arc<dyn DatabaseConnection>,
        count_text: &str,
        token: &CancellationToken,
    ) -> Option<i64> {
        if classify_query(count_text) != QueryKind::Fetch && !count_text.starts_with("db.") {
            warn!("count probe is not a fetch query, skipping");
            return None;
        }

        match self
            .run_with_deadline(handle, count_text, &ExecuteOptions::count_probe(), token)
            .await
        {
            Ok(result) => extract_total(&result.result),
            Err(error) => {
                warn!(code = %error.code, "count probe failed, total unknown");
                None
            }
        }
    }

    async fn run_with_deadline(
        &self,
        handle: &Arc<dyn DatabaseConnection>,
        text: &str,
        opts: &ExecuteOptions,
        token: &CancellationToken,
    ) -> Result<crate::db::DriverResult, QueryError> {
        match tokio::time::timeout(INTERACTIVE_TIMEOUT, handle.execute(text, opts, token)).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(QueryError::new(
                    "QUERY_EXECUTION_TIMEOUT",
                    format!(
                        "Query did not complete within {} seconds",
                        INTERACTIVE_TIMEOUT.as_secs()
                    ),
                ))
            }
        }
    }
}

/// Caps materialized rows at [`MAX_RESULT_ROWS`].
fn cap_result(mut result: serde_json::Value) -> serde_json::Value {
    if let Some(rows) = result.get_mut("results").and_then(|v| v.as_array_mut()) {
        if rows.len() > MAX_RESULT_ROWS {
            rows.truncate(MAX_RESULT_ROWS);
        }
    }
    result
}

/// Extracts the integer total from a count-probe result.
///
/// Fallbacks in order: top-level `count`, first element of `results[]`,
/// a `results` map, then a bare numeric scalar.
pub fn extract_total(value: &serde_json::Value) -> Option<i64> {
    if let Some(total) = coerce_count(value.get("count")) {
        return Some(total);
    }

    if let Some(results) = value.get("results") {
        if let Some(first) = results.as_array().and_then(|a| a.first()) {
            if let Some(total) = coerce_count(first.get("count")) {
                return Some(total);
            }
            // Single-column COUNT results may come back under an
            // engine-specific name.
            if let Some(object) = first.as_object() {
                if object.len() == 1 {
                    if let Some(total) = coerce_count(object.values().next()) {
                        return Some(total);
                    }
                }
            }
        }
        if results.is_object() {
            if let Some(total) = coerce_count(results.get("count")) {
                return Some(total);
            }
        }
    }

    value.as_i64()
}

fn coerce_count(value: Option<&serde_json::Value>) -> Option<i64> {
    let value = value?;
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    if let Some(f) = value.as_f64() {
        return Some(f as i64);
    }
    value.as_str().and_then(|s| s.trim().parse().ok())
}
