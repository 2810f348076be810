//! Per-stream cancellation handles.
//!
//! One mutex-guarded map `{stream_id → token}`; registering a stream that
//! already holds an in-flight token cancels the prior one first.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Registry of in-flight cancellation tokens keyed by stream id.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh token for the stream, cancelling any prior one.
    pub fn register(&self, stream_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let prior = self
            .tokens
            .lock()
            .unwrap()
            .insert(stream_id.to_string(), token.clone());
        if let Some(prior) = prior {
            prior.cancel();
        }
        token
    }

    /// Fires the stream's token, if any. Returns whether one was in flight.
    pub fn cancel(&self, stream_id: &str) -> bool {
        match self.tokens.lock().unwrap().remove(stream_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes the stream's token without firing it (normal completion).
    pub fn clear(&self, stream_id: &str) {
        self.tokens.lock().unwrap().remove(stream_id);
    }

    /// True when the stream holds an in-flight token.
    pub fn is_active(&self, stream_id: &str) -> bool {
        self.tokens.lock().unwrap().contains_key(stream_id)
    }
}
