//! Lifecycle of live database connections, keyed by chat.

use crate::config::ConnectionInfo;
use crate::connection::CertBundle;
use crate::db::{DatabaseConnection, DatabaseDriver, DatabaseType};
use crate::error::{ChatDbError, Result};
use crate::stream::{Envelope, EventKind, StreamHub, StreamKey};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

struct ConnectionEntry {
    info: ConnectionInfo,
    user_id: String,
    handle: Arc<dyn DatabaseConnection>,
    subscribers: HashSet<String>,
    last_used: Instant,
    certs: CertBundle,
}

/// Point-in-time connection status for one chat.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub info: ConnectionInfo,
    pub subscriber_count: usize,
    pub idle_secs: u64,
}

/// Manages live connections per chat and the driver registry.
///
/// Public operations serialize on the entries lock; each chat owns at most
/// one live entry.
pub struct ConnectionManager {
    drivers: RwLock<HashMap<DatabaseType, Arc<dyn DatabaseDriver>>>,
    entries: RwLock<HashMap<i64, ConnectionEntry>>,
    hub: Arc<StreamHub>,
}

impl ConnectionManager {
    pub fn new(hub: Arc<StreamHub>) -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
            hub,
        }
    }

    /// Registers a driver for the engine it serves.
    pub async fn register_driver(&self, driver: Arc<dyn DatabaseDriver>) {
        let db_type = driver.db_type();
        self.drivers.write().await.insert(db_type, driver);
        debug!(db_type = %db_type, "driver registered");
    }

    async fn driver_for(&self, db_type: DatabaseType) -> Result<Arc<dyn DatabaseDriver>> {
        self.drivers.read().await.get(&db_type).cloned().ok_or_else(|| {
            ChatDbError::bad_input(format!("No driver registered for {db_type}"))
        })
    }

    /// Verifies a descriptor against a live server. Single attempt;
    /// failures surface to the user.
    pub async fn test_connection(&self, info: &ConnectionInfo) -> Result<()> {
        let driver = self.driver_for(info.db_type).await?;
        let (resolved, mut certs) = CertBundle::materialize(info).await?;
        let result = driver.test_connection(&resolved).await;
        certs.cleanup();
        result
    }

    /// Opens (or reuses) the chat's connection and subscribes the stream.
    ///
    /// Idempotent: an existing entry counts as success, the stream is
    /// subscribed, and `db-connected` is emitted either way.
    pub async fn connect(
        &self,
        chat_id: i64,
        user_id: &str,
        stream_id: &str,
        info: &ConnectionInfo,
    ) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(&chat_id) {
                entry.subscribers.insert(stream_id.to_string());
                entry.last_used = Instant::now();
                drop(entries);
                self.emit_to_stream(user_id, chat_id, stream_id, EventKind::DbConnected)
                    .await;
                return Ok(());
            }
        }

        let driver = self.driver_for(info.db_type).await?;
        let (resolved, certs) = CertBundle::materialize(info).await?;
        let handle = driver.connect(&resolved).await?;

        info!(chat_id, db = %info.display_string(), "database connected");

        {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(chat_id).or_insert_with(|| ConnectionEntry {
                info: info.clone(),
                user_id: user_id.to_string(),
                handle,
                subscribers: HashSet::new(),
                last_used: Instant::now(),
                certs,
            });
            entry.subscribers.insert(stream_id.to_string());
        }

        self.emit_to_stream(user_id, chat_id, stream_id, EventKind::DbConnected)
            .await;
        Ok(())
    }

    /// Closes the chat's connection.
    ///
    /// Without `force`, an absent entry is an error; with `force` it is a
    /// no-op (used when credentials change underneath a maybe-dead entry).
    pub async fn disconnect(&self, chat_id: i64, user_id: &str, force: bool) -> Result<()> {
        let entry = self.entries.write().await.remove(&chat_id);

        let Some(mut entry) = entry else {
            if force {
                return Ok(());
            }
            return Err(ChatDbError::not_found(format!(
                "Chat {chat_id} has no live connection"
            )));
        };

        let _ = entry.handle.close().await;
        entry.certs.cleanup();
        info!(chat_id, "database disconnected");

        for stream_id in &entry.subscribers {
            self.emit_to_stream(user_id, chat_id, stream_id, EventKind::DbDisconnected)
                .await;
        }

        Ok(())
    }

    /// True when the chat holds a live entry.
    pub async fn is_connected(&self, chat_id: i64) -> bool {
        self.entries.read().await.contains_key(&chat_id)
    }

    /// Connection status for the chat, if connected.
    pub async fn get_info(&self, chat_id: i64) -> Option<ConnectionStatus> {
        self.entries.read().await.get(&chat_id).map(|entry| ConnectionStatus {
            info: entry.info.clone(),
            subscriber_count: entry.subscribers.len(),
            idle_secs: entry.last_used.elapsed().as_secs(),
        })
    }

    /// Subscribes a stream to the chat's connection events.
    pub async fn subscribe(&self, chat_id: i64, stream_id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&chat_id).ok_or_else(|| {
            ChatDbError::not_found(format!("Chat {chat_id} has no live connection"))
        })?;
        entry.subscribers.insert(stream_id.to_string());
        Ok(())
    }

    /// Returns the live handle for the chat, bumping `last_used`.
    pub async fn handle(&self, chat_id: i64) -> Option<Arc<dyn DatabaseConnection>> {
        let mut entries = self.entries.write().await;
        entries.get_mut(&chat_id).map(|entry| {
            entry.last_used = Instant::now();
            Arc::clone(&entry.handle)
        })
    }

    /// Stream ids subscribed to the chat's connection.
    pub async fn subscribers(&self, chat_id: i64) -> Vec<String> {
        self.entries
            .read()
            .await
            .get(&chat_id)
            .map(|entry| entry.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn emit_to_stream(
        &self,
        user_id: &str,
        chat_id: i64,
        stream_id: &str,
        kind: EventKind,
    ) {
        let key = StreamKey::new(user_id, chat_id, stream_id);
        self.hub
            .emit(
                &key,
                Envelope::new(kind, serde_json::json!({ "chatId": chat_id })),
            )
            .await;
    }
}
