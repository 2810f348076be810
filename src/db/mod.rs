//! Database abstraction layer for chatdb.
//!
//! Provides the driver seam the rest of the system programs against: a
//! factory trait per engine plus a live-connection trait for execution and
//! schema introspection. Per-engine wire adapters beyond PostgreSQL are
//! external collaborators behind this seam.

mod classify;
mod mock;
mod postgres;
mod schema;
mod types;

pub use classify::{classify_query, QueryKind};
pub use mock::{FailingDriver, MockConnection, MockDriver};
pub use postgres::PostgresDriver;
pub use schema::{Column, Schema, SchemaDiff, Table};
pub use types::{DriverResult, ExecuteOptions};

use crate::config::ConnectionInfo;
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Postgres,
    Yugabyte,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "clickhouse")]
    ClickHouse,
    #[serde(rename = "mongodb")]
    MongoDb,
}

impl DatabaseType {
    /// Returns the engine as a string for persistence and prompt lookup.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Yugabyte => "yugabyte",
            Self::MySql => "mysql",
            Self::ClickHouse => "clickhouse",
            Self::MongoDb => "mongodb",
        }
    }

    /// Parses an engine from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "yugabyte" | "yugabytedb" => Some(Self::Yugabyte),
            "mysql" => Some(Self::MySql),
            "clickhouse" => Some(Self::ClickHouse),
            "mongodb" | "mongo" => Some(Self::MongoDb),
            _ => None,
        }
    }

    /// Returns the default port for this engine.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Yugabyte => 5433,
            Self::MySql => 3306,
            Self::ClickHouse => 9000,
            Self::MongoDb => 27017,
        }
    }

    /// Whether this engine speaks SQL (drives statement classification).
    pub fn is_sql(&self) -> bool {
        !matches!(self, Self::MongoDb)
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Factory for live connections to one engine.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// The engine this driver serves.
    fn db_type(&self) -> DatabaseType;

    /// Verifies the descriptor can reach a live server. Single attempt.
    async fn test_connection(&self, info: &ConnectionInfo) -> Result<()>;

    /// Opens a live connection for the descriptor.
    async fn connect(&self, info: &ConnectionInfo) -> Result<Arc<dyn DatabaseConnection>>;
}

/// A live connection to a user's database.
///
/// Execution failures are returned as the persisted [`QueryError`] envelope
/// rather than a transport error; connection-level failures use the
/// transport taxonomy.
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    /// Executes a query and returns the JSON-normalized result.
    ///
    /// Implementations must observe `cancel` and abort in-flight work when
    /// it fires.
    async fn execute(
        &self,
        text: &str,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> std::result::Result<DriverResult, QueryError>;

    /// Introspects the schema, optionally restricted to the named tables,
    /// including a few example rows per table.
    async fn fetch_schema(
        &self,
        selected_tables: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<Schema>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<()>;

    /// Closes the connection and releases engine resources.
    async fn close(&self) -> Result<()>;
}
