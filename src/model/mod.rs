//! Persisted entities: chats, the user-visible message view, and the
//! LLM-visible mirror.

mod chat;
mod llm_message;
mod message;

pub use chat::{Chat, ChatSettings, ALL_COLLECTIONS};
pub use llm_message::{LlmContent, LlmMessage, LlmRole};
pub use message::{actions, ActionButton, Message, MessageType, Query, QueryPagination};
