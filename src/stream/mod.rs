//! Per-chat event streaming (C1).
//!
//! A stream is a bounded channel keyed by `(user, chat, stream)` that one
//! server-push consumer drains. Emitters never block the hot path: sends
//! time out and drop.

mod events;
mod hub;

pub use events::{Envelope, EventKind, StreamKey};
pub use hub::{StreamHub, EMIT_TIMEOUT, HEARTBEAT_INTERVAL, STREAM_BUFFER};
