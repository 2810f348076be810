//! Bounded channel registry and consumer loop.

use super::{Envelope, StreamKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Channel buffer per stream.
pub const STREAM_BUFFER: usize = 100;

/// How long an emitter waits for buffer space before dropping.
pub const EMIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Idle interval between heartbeat frames.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Registry of live stream channels.
///
/// At most one channel exists per key; re-opening a key replaces (and
/// thereby closes) the prior channel so a reconnecting client never leaves
/// a stale buffer accumulating.
#[derive(Default)]
pub struct StreamHub {
    streams: RwLock<HashMap<StreamKey, mpsc::Sender<Envelope>>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a channel for the key, replacing any prior one.
    pub async fn open(&self, key: StreamKey) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let prior = self.streams.write().await.insert(key.clone(), tx);
        if prior.is_some() {
            debug!(stream = %key, "replaced existing stream channel");
        }
        rx
    }

    /// Emits an event to the key's channel.
    ///
    /// Never blocks the caller beyond [`EMIT_TIMEOUT`]: a full buffer drops
    /// the event with a warning, and an absent key is a silent no-op (the
    /// client is gone).
    pub async fn emit(&self, key: &StreamKey, envelope: Envelope) -> bool {
        let sender = { self.streams.read().await.get(key).cloned() };
        let Some(sender) = sender else {
            return false;
        };

        match sender.send_timeout(envelope, EMIT_TIMEOUT).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(envelope)) => {
                warn!(stream = %key, event = %envelope.event, "stream buffer full, dropping event");
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                debug!(stream = %key, "stream channel closed, dropping event");
                false
            }
        }
    }

    /// Removes the key's channel, closing it.
    pub async fn close(&self, key: &StreamKey) {
        if self.streams.write().await.remove(key).is_some() {
            debug!(stream = %key, "stream channel closed");
        }
    }

    /// True when a channel is registered for the key.
    pub async fn is_open(&self, key: &StreamKey) -> bool {
        self.streams.read().await.contains_key(key)
    }

    /// Number of live channels.
    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    /// True when no channel is registered.
    pub async fn is_empty(&self) -> bool {
        self.streams.read().await.is_empty()
    }

    /// Drives one consumer until disconnect or cancellation.
    ///
    /// Forwards every buffered event to `sink` in emit order, interleaving
    /// a heartbeat every [`HEARTBEAT_INTERVAL`] of idle. The channel is
    /// removed from the registry on exit.
    pub async fn consume<F>(
        self: &Arc<Self>,
        key: StreamKey,
        mut receiver: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
        mut sink: F,
    ) where
        F: FnMut(Envelope),
    {
        sink(Envelope::connected());

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; swallow it.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(stream = %key, "consumer cancelled");
                    break;
                }
                _ = heartbeat.tick() => {
                    sink(Envelope::heartbeat());
                }
                event = receiver.recv() => {
                    match event {
                        Some(envelope) => {
                            heartbeat.reset();
                            sink(envelope);
                        }
                        None => {
                            debug!(stream = %key, "stream channel replaced or dropped");
                            break;
                        }
                    }
                }
            }
        }

        self.close(&key).await;
    }
}
