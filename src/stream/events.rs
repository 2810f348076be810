//! Typed events pushed to stream consumers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The framed event kinds a consumer can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Connected,
    Heartbeat,
    AiResponseStep,
    AiResponse,
    AiResponseError,
    ResponseCancelled,
    DbConnected,
    DbDisconnected,
    QueryCancelled,
    QueryPaginatedResults,
    RollbackExecuted,
    RollbackQueryFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Heartbeat => "heartbeat",
            Self::AiResponseStep => "ai-response-step",
            Self::AiResponse => "ai-response",
            Self::AiResponseError => "ai-response-error",
            Self::ResponseCancelled => "response-cancelled",
            Self::DbConnected => "db-connected",
            Self::DbDisconnected => "db-disconnected",
            Self::QueryCancelled => "query-cancelled",
            Self::QueryPaginatedResults => "query-paginated-results",
            Self::RollbackExecuted => "rollback-executed",
            Self::RollbackQueryFailed => "rollback-query-failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `{event, data}` frame serialized to the consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub event: EventKind,
    pub data: serde_json::Value,
}

impl Envelope {
    /// Creates an envelope with arbitrary data.
    pub fn new(event: EventKind, data: serde_json::Value) -> Self {
        Self { event, data }
    }

    /// Creates an intermediate progress step.
    pub fn step(message: impl Into<String>) -> Self {
        Self::new(
            EventKind::AiResponseStep,
            serde_json::Value::String(message.into()),
        )
    }

    /// Creates a heartbeat frame.
    pub fn heartbeat() -> Self {
        Self::new(EventKind::Heartbeat, serde_json::Value::Null)
    }

    /// Creates the greeting frame sent when a consumer attaches.
    pub fn connected() -> Self {
        Self::new(EventKind::Connected, serde_json::Value::Null)
    }
}

/// Identifies one stream channel: `userId:chatId:streamId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(user_id: &str, chat_id: i64, stream_id: &str) -> Self {
        Self(format!("{user_id}:{chat_id}:{stream_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
