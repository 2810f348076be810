//! Mock database driver for tests.
//!
//! Scripted by substring pattern, records every executed query, and can
//! simulate slow engines so cancellation paths are testable.

use crate::config::ConnectionInfo;
use crate::db::{
    DatabaseConnection, DatabaseDriver, DatabaseType, DriverResult, ExecuteOptions, Schema,
};
use crate::error::{ChatDbError, QueryError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct MockShared {
    responses: Mutex<Vec<(String, serde_json::Value)>>,
    failures: Mutex<Vec<(String, QueryError)>>,
    schema: Mutex<Schema>,
    delay: Mutex<Option<Duration>>,
    executed: Mutex<Vec<String>>,
    connect_count: AtomicUsize,
}

impl Default for MockShared {
    fn default() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            schema: Mutex::new(Schema::default()),
            delay: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
            connect_count: AtomicUsize::new(0),
        }
    }
}

/// Mock driver whose connections share scripted behavior with the driver,
/// so tests can configure and observe through one handle.
#[derive(Clone, Default)]
pub struct MockDriver {
    shared: Arc<MockShared>,
    db_type: DatabaseType,
}

impl MockDriver {
    /// Creates a mock driver registered as PostgreSQL.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the engine this mock reports.
    pub fn for_type(mut self, db_type: DatabaseType) -> Self {
        self.db_type = db_type;
        self
    }

    /// Scripts fetched rows for queries containing `pattern`.
    pub fn with_rows(self, pattern: impl Into<String>, rows: Vec<serde_json::Value>) -> Self {
        self.shared
            .responses
            .lock()
            .unwrap()
            .push((pattern.into(), serde_json::json!({ "results": rows })));
        self
    }

    /// Scripts an arbitrary result value for queries containing `pattern`.
    pub fn with_result(self, pattern: impl Into<String>, result: serde_json::Value) -> Self {
        self.shared
            .responses
            .lock()
            .unwrap()
            .push((pattern.into(), result));
        self
    }

    /// Scripts a failure for queries containing `pattern`.
    pub fn with_failure(self, pattern: impl Into<String>, error: QueryError) -> Self {
        self.shared
            .failures
            .lock()
            .unwrap()
            .push((pattern.into(), error));
        self
    }

    /// Sets the schema introspection result.
    pub fn with_schema(self, schema: Schema) -> Self {
        *self.shared.schema.lock().unwrap() = schema;
        self
    }

    /// Makes every execution wait before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.shared.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Queries executed so far, in order.
    pub fn executed_queries(&self) -> Vec<String> {
        self.shared.executed.lock().unwrap().clone()
    }

    /// How many times `connect` succeeded.
    pub fn connect_count(&self) -> usize {
        self.shared.connect_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseDriver for MockDriver {
    fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn test_connection(&self, _info: &ConnectionInfo) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, _info: &ConnectionInfo) -> Result<Arc<dyn DatabaseConnection>> {
        self.shared.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockConnection {
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// A live mock connection.
pub struct MockConnection {
    shared: Arc<MockShared>,
}

#[async_trait]
impl DatabaseConnection for MockConnection {
    async fn execute(
        &self,
        text: &str,
        _opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> std::result::Result<DriverResult, QueryError> {
        self.shared.executed.lock().unwrap().push(text.to_string());

        let delay = *self.shared.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(QueryError::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(QueryError::cancelled());
        }

        {
            let failures = self.shared.failures.lock().unwrap();
            if let Some((_, error)) = failures.iter().find(|(p, _)| text.contains(p)) {
                return Err(error.clone());
            }
        }

        {
            let responses = self.shared.responses.lock().unwrap();
            if let Some((_, result)) = responses.iter().find(|(p, _)| text.contains(p)) {
                return Ok(DriverResult {
                    result: result.clone(),
                    execution_time_ms: 1,
                });
            }
        }

        // Unscripted queries: fetches answer one row, mutations one affected.
        match crate::db::classify_query(text) {
            crate::db::QueryKind::Fetch => Ok(DriverResult::rows(
                vec![serde_json::json!({"id": 1})],
                1,
            )),
            _ => Ok(DriverResult::affected(1, 1)),
        }
    }

    async fn fetch_schema(
        &self,
        selected_tables: Option<&[String]>,
        _cancel: &CancellationToken,
    ) -> Result<Schema> {
        let schema = self.shared.schema.lock().unwrap().clone();
        Ok(match selected_tables {
            Some(selected) => schema.project(selected),
            None => schema,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Driver whose connect always fails; for retry and surfacing tests.
#[derive(Debug, Default)]
pub struct FailingDriver;

#[async_trait]
impl DatabaseDriver for FailingDriver {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn test_connection(&self, info: &ConnectionInfo) -> Result<()> {
        Err(ChatDbError::upstream_db(format!(
            "Cannot reach {}",
            info.display_string()
        )))
    }

    async fn connect(&self, info: &ConnectionInfo) -> Result<Arc<dyn DatabaseConnection>> {
        Err(ChatDbError::upstream_db(format!(
            "Cannot reach {}",
            info.display_string()
        )))
    }
}
