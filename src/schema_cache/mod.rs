//! Schema fetch, caching, and LLM formatting (C3).
//!
//! Two modes: first-time emission (full formatted schema, example rows when
//! the chat shares data with the AI) and incremental refresh (same
//! formatted text plus an opaque diff against the cached copy). Selected
//! collections project uniformly into both modes.

use crate::connection::ConnectionManager;
use crate::db::{Schema, SchemaDiff};
use crate::error::{ChatDbError, Result};
use crate::model::Chat;
use crate::store::MessageStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Ceiling for a detached background refresh (huge schemas).
pub const REFRESH_CEILING: Duration = Duration::from_secs(60 * 60);

struct CachedSchema {
    schema: Schema,
}

/// Result of an incremental refresh.
#[derive(Debug, Clone)]
pub struct SchemaRefresh {
    /// Formatted text for the LLM.
    pub formatted: String,
    /// Structural changes since the cached copy; empty on first fetch.
    pub diff: SchemaDiff,
    /// True when no cached copy existed.
    pub first_time: bool,
}

/// Per-chat schema cache.
pub struct SchemaCache {
    manager: Arc<ConnectionManager>,
    store: Arc<MessageStore>,
    cache: RwLock<HashMap<i64, CachedSchema>>,
}

impl SchemaCache {
    pub fn new(manager: Arc<ConnectionManager>, store: Arc<MessageStore>) -> Self {
        Self {
            manager,
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// True when the chat has a cached schema line.
    pub async fn has_cached(&self, chat_id: i64) -> bool {
        self.cache.read().await.contains_key(&chat_id)
    }

    /// Drops the chat's cache line (disconnect, chat delete).
    pub async fn invalidate(&self, chat_id: i64) {
        self.cache.write().await.remove(&chat_id);
    }

    /// Fetches the chat's schema through its live connection, applying the
    /// selected-collections projection.
    async fn fetch(&self, chat: &Chat, cancel: &CancellationToken) -> Result<Schema> {
        let handle = match self.manager.handle(chat.id).await {
            Some(handle) => handle,
            None => {
                // Schema work can race a dropped connection; reconnect with
                // the chat's stored descriptor, one attempt.
                self.manager
                    .connect(chat.id, &chat.user_id, "schema-refresh", &chat.connection)
                    .await?;
                self.manager.handle(chat.id).await.ok_or_else(|| {
                    ChatDbError::upstream_db("Connection vanished after connect")
                })?
            }
        };

        let selected = chat.selected_collection_list();
        handle.fetch_schema(selected.as_deref(), cancel).await
    }

    /// First-time emission: fetch, cache, format.
    pub async fn first_time(&self, chat: &Chat, cancel: &CancellationToken) -> Result<String> {
        let schema = self.fetch(chat, cancel).await?;
        let formatted = schema.format_for_llm(chat.settings.share_data_with_ai);

        self.cache
            .write()
            .await
            .insert(chat.id, CachedSchema { schema });

        Ok(formatted)
    }

    /// Incremental refresh: fetch, diff against the cached copy, cache.
    pub async fn refresh(&self, chat: &Chat, cancel: &CancellationToken) -> Result<SchemaRefresh> {
        let schema = self.fetch(chat, cancel).await?;
        let formatted = schema.format_for_llm(chat.settings.share_data_with_ai);

        let mut cache = self.cache.write().await;
        let (diff, first_time) = match cache.get(&chat.id) {
            Some(cached) => (schema.diff_from(&cached.schema), false),
            None => (SchemaDiff::default(), true),
        };
        cache.insert(chat.id, CachedSchema { schema });

        Ok(SchemaRefresh {
            formatted,
            diff,
            first_time,
        })
    }

    /// Refreshes and replaces the chat's single system-role mirror row.
    pub async fn refresh_and_store(
        &self,
        chat: &Chat,
        cancel: &CancellationToken,
    ) -> Result<SchemaRefresh> {
        let refresh = self.refresh(chat, cancel).await?;
        self.store
            .replace_system_message(chat.id, &refresh.formatted)
            .await?;

        info!(
            chat_id = chat.id,
            first_time = refresh.first_time,
            changed = !refresh.diff.is_empty(),
            "schema refresh stored"
        );
        Ok(refresh)
    }

    /// Spawns a detached background refresh, isolated from any request
    /// context and bounded only by the long ceiling.
    pub fn spawn_background_refresh(self: &Arc<Self>, chat: Chat) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let result =
                tokio::time::timeout(REFRESH_CEILING, cache.refresh_and_store(&chat, &cancel))
                    .await;

            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(chat_id = chat.id, "background schema refresh failed: {e}");
                }
                Err(_) => {
                    cancel.cancel();
                    warn!(chat_id = chat.id, "background schema refresh hit the ceiling");
                }
            }
        })
    }
}
