//! chatdb - a multi-tenant backend mediating between users, an LLM, and
//! their databases.
//!
//! This library exposes the chat-orchestration core for embedding and for
//! integration tests; the binary in `main.rs` wires it for standalone use.

pub mod chat;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod executor;
pub mod llm;
pub mod logging;
pub mod model;
pub mod persistence;
pub mod schema_cache;
pub mod store;
pub mod stream;
