//! Integration tests for chatdb.
//!
//! Hermetic: the database driver and the LLM provider are the in-tree
//! mocks, and the state store runs on in-memory SQLite.
//!
//! Run with: `cargo test --test integration_tests`

mod integration;
