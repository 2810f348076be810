//! Error types for chatdb.
//!
//! Two layers: `ChatDbError` is the transport-facing taxonomy returned by
//! orchestrator operations, and `QueryError` is the structured envelope
//! persisted on a query when execution against the user's database fails.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for chatdb operations.
///
/// Each variant maps to a stable user-visible code and an HTTP-like status.
/// Driver failures during query execution do NOT become a `ChatDbError`;
/// they are recorded as a [`QueryError`] on the query itself so the client
/// can render a "fix error" affordance.
#[derive(Error, Debug)]
pub enum ChatDbError {
    /// Malformed or missing request fields.
    #[error("Invalid input: {0}")]
    BadInput(String),

    /// The caller is not authenticated.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The caller does not own the addressed resource.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Chat, message, or query does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation conflicts with persisted state (e.g. double execute).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A deadline elapsed before the operation completed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The user's database rejected a connection-level operation.
    #[error("Database error: {0}")]
    UpstreamDb(String),

    /// The LLM provider failed or returned an unusable response.
    #[error("LLM error: {0}")]
    UpstreamLlm(String),

    /// The operation was cancelled by an explicit user action.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration errors (invalid config file, missing required fields).
    #[error("Configuration error: {0}")]
    Config(String),

    /// State-database errors (the service's own storage, not the user's).
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Internal application errors (unexpected states, bugs).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatDbError {
    /// Creates a bad-input error with the given message.
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }

    /// Creates an unauthorized error with the given message.
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Creates a forbidden error with the given message.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Creates a not-found error with the given message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates a conflict error with the given message.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Creates a timeout error with the given message.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates an upstream-database error with the given message.
    pub fn upstream_db(msg: impl Into<String>) -> Self {
        Self::UpstreamDb(msg.into())
    }

    /// Creates an upstream-LLM error with the given message.
    pub fn upstream_llm(msg: impl Into<String>) -> Self {
        Self::UpstreamLlm(msg.into())
    }

    /// Creates a cancelled error with the given message.
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a persistence error with the given message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the stable user-visible error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadInput(_) => "BAD_INPUT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Timeout(_) => "TIMEOUT",
            Self::UpstreamDb(_) => "UPSTREAM_DB_ERROR",
            Self::UpstreamLlm(_) => "UPSTREAM_LLM_ERROR",
            Self::Cancelled(_) => "CANCELLED",
            Self::Config(_) => "INTERNAL",
            Self::Persistence(_) => "INTERNAL",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns the HTTP-like numeric status for transport mapping.
    pub fn status(&self) -> u16 {
        match self {
            Self::BadInput(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Timeout(_) => 408,
            Self::UpstreamDb(_) => 502,
            Self::UpstreamLlm(_) => 502,
            Self::Cancelled(_) => 499,
            Self::Config(_) | Self::Persistence(_) | Self::Internal(_) => 500,
        }
    }
}

/// Result type alias using ChatDbError.
pub type Result<T> = std::result::Result<T, ChatDbError>;

/// Structured error stored on a query after a failed execution attempt.
///
/// This is persisted state, not a transport error: the orchestrator still
/// answers 2xx with the error populated so the client can offer a fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable summary.
    pub message: String,
    /// Driver-specific detail, if any.
    #[serde(default)]
    pub details: String,
}

/// Error codes the executor assigns itself (driver-mapped codes otherwise).
pub mod query_error_codes {
    pub const FAILED_TO_START_TRANSACTION: &str = "FAILED_TO_START_TRANSACTION";
    pub const QUERY_EXECUTION_CANCELLED: &str = "QUERY_EXECUTION_CANCELLED";
    pub const PAGINATION_UNSUPPORTED: &str = "PAGINATION_UNSUPPORTED";
    pub const QUERY_EXECUTION_FAILED: &str = "QUERY_EXECUTION_FAILED";
    pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";
}

impl QueryError {
    /// Creates a query error with the given code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: String::new(),
        }
    }

    /// Attaches driver-specific details.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Creates the cancellation error the executor records when a stream's
    /// in-flight query is interrupted.
    pub fn cancelled() -> Self {
        Self::new(
            query_error_codes::QUERY_EXECUTION_CANCELLED,
            "Query execution was cancelled by the user",
        )
    }
}
