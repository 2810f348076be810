//! Chat orchestration (C6): the state machine driving a user turn from
//! message to plan to execution, across both persistence views.

pub mod buttons;
mod duplicate;
pub mod matching;
mod orchestrator;

pub use duplicate::duplicate_chat;
pub use orchestrator::{
    ChatOrchestrator, CreateMessageOutcome, ExecuteQueryRequest, QueryActionOutcome,
    UpdateChatRequest,
};
