//! The central state machine (C6).
//!
//! Processes a user turn end to end: persist the user message, refresh
//! schema context when absent, drive the LLM gateway, persist the assistant
//! plan into both views, auto-execute non-critical queries when the chat
//! asks for it, and stream progress to the caller's channel. Also owns the
//! query actions (execute, rollback, edit) and both cancellation surfaces.

use crate::chat::matching::natural_key_eq;
use crate::config::{ConnectionInfo, LimitsConfig};
use crate::connection::ConnectionManager;
use crate::db::classify_query;
use crate::error::{ChatDbError, QueryError, Result};
use crate::executor::{ExecutionOutcome, QueryExecutor};
use crate::llm::LlmGateway;
use crate::model::{ActionButton, Chat, ChatSettings, Message, MessageType, Query};
use crate::schema_cache::SchemaCache;
use crate::store::MessageStore;
use crate::stream::{Envelope, EventKind, StreamHub, StreamKey};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ceiling per auto-executed query inside one turn.
const AUTO_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Content of the synthetic assistant message written on cancel.
const CANCELLED_MESSAGE: &str = "Operation cancelled by user";

struct ActiveTurn {
    id: u64,
    token: CancellationToken,
    chat_id: i64,
    user_id: String,
    user_message_id: i64,
}

/// Result of createMessage / updateMessage.
#[derive(Debug, Clone)]
pub struct CreateMessageOutcome {
    pub user_message: Message,
    /// Present on the synchronous auto-execute path; the review path
    /// delivers the assistant message over the stream instead.
    pub assistant_message: Option<Message>,
}

/// Addressing for executeQuery / rollbackQuery.
#[derive(Debug, Clone)]
pub struct ExecuteQueryRequest {
    pub user_id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub query_id: String,
    pub stream_id: String,
    /// 0 on the first execute; pagination walks pass 50, 100, …
    pub offset: i64,
}

/// Result of a query action.
#[derive(Debug, Clone)]
pub struct QueryActionOutcome {
    pub message: Message,
    pub query: Query,
    /// Response-only buttons, never persisted (`fix_rollback_error`).
    pub transient_buttons: Vec<ActionButton>,
}

/// Mutable fields of a chat update.
#[derive(Debug, Clone, Default)]
pub struct UpdateChatRequest {
    pub connection: Option<ConnectionInfo>,
    pub settings: Option<ChatSettings>,
    pub selected_collections: Option<String>,
}

/// The chat orchestration engine.
pub struct ChatOrchestrator {
    hub: Arc<StreamHub>,
    manager: Arc<ConnectionManager>,
    schema_cache: Arc<SchemaCache>,
    executor: Arc<QueryExecutor>,
    gateway: Arc<LlmGateway>,
    store: Arc<MessageStore>,
    limits: LimitsConfig,
    active_turns: Mutex<HashMap<String, ActiveTurn>>,
    turn_counter: AtomicU64,
}

impl ChatOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub: Arc<StreamHub>,
        manager: Arc<ConnectionManager>,
        schema_cache: Arc<SchemaCache>,
        executor: Arc<QueryExecutor>,
        gateway: Arc<LlmGateway>,
        store: Arc<MessageStore>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            hub,
            manager,
            schema_cache,
            executor,
            gateway,
            store,
            limits,
            active_turns: Mutex::new(HashMap::new()),
            turn_counter: AtomicU64::new(0),
        }
    }

    pub fn hub(&self) -> &Arc<StreamHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    // ---- chats -------------------------------------------------------

    /// Creates a chat, enforcing the per-user cap (trial mode caps at 2).
    pub async fn create_chat(
        &self,
        user_id: &str,
        connection: &ConnectionInfo,
        selected_collections: &str,
        settings: ChatSettings,
    ) -> Result<Chat> {
        let cap = self.limits.effective_chat_cap();
        if self.store.count_chats(user_id).await? >= cap {
            return Err(ChatDbError::conflict(format!(
                "Chat limit of {cap} reached"
            )));
        }

        self.store
            .create_chat(user_id, connection, selected_collections, settings)
            .await
    }

    /// Updates a chat. A credential change force-disconnects the live
    /// connection before the new descriptor is stored and resets the
    /// selection; a selection change triggers a detached schema refresh.
    pub async fn update_chat(
        self: &Arc<Self>,
        user_id: &str,
        chat_id: i64,
        request: UpdateChatRequest,
    ) -> Result<Chat> {
        let chat = self.store.get_owned_chat(chat_id, user_id).await?;

        if let Some(connection) = &request.connection {
            self.manager.disconnect(chat_id, user_id, true).await?;
            self.schema_cache.invalidate(chat_id).await;
            self.store.update_chat_connection(chat_id, connection).await?;
            info!(chat_id, "connection credentials replaced");
        }

        if let Some(settings) = request.settings {
            self.store.update_chat_settings(chat_id, settings).await?;
        }

        let mut selection_changed = false;
        if let Some(selected) = &request.selected_collections {
            if request.connection.is_none() && *selected != chat.selected_collections {
                self.store
                    .update_selected_collections(chat_id, selected)
                    .await?;
                selection_changed = true;
            }
        }

        let updated = self.store.get_chat(chat_id).await?;

        if selection_changed {
            // Isolated from this request's lifetime; huge schemas get the
            // long ceiling.
            self.schema_cache.spawn_background_refresh(updated.clone());
        }

        Ok(updated)
    }

    /// Deletes a chat: live connection, schema line, messages, mirrors.
    pub async fn delete_chat(&self, user_id: &str, chat_id: i64) -> Result<()> {
        self.store.get_owned_chat(chat_id, user_id).await?;

        let _ = self.manager.disconnect(chat_id, user_id, true).await;
        self.schema_cache.invalidate(chat_id).await;
        self.store.delete_chat(chat_id).await
    }

    /// Duplicates a chat, optionally with its conversation.
    pub async fn duplicate_chat(
        &self,
        user_id: &str,
        chat_id: i64,
        with_messages: bool,
    ) -> Result<Chat> {
        let cap = self.limits.effective_chat_cap();
        if self.store.count_chats(user_id).await? >= cap {
            return Err(ChatDbError::conflict(format!(
                "Chat limit of {cap} reached"
            )));
        }

        crate::chat::duplicate_chat(&self.store, user_id, chat_id, with_messages).await
    }

    /// Opens the chat's database connection and subscribes the stream.
    pub async fn connect_db(&self, user_id: &str, chat_id: i64, stream_id: &str) -> Result<()> {
        let chat = self.store.get_owned_chat(chat_id, user_id).await?;
        self.manager
            .connect(chat.id, user_id, stream_id, &chat.connection)
            .await
    }

    /// Closes the chat's database connection.
    pub async fn disconnect_db(&self, user_id: &str, chat_id: i64, force: bool) -> Result<()> {
        self.store.get_owned_chat(chat_id, user_id).await?;
        self.schema_cache.invalidate(chat_id).await;
        self.manager.disconnect(chat_id, user_id, force).await
    }

    // ---- messages ----------------------------------------------------

    /// Persists a user message and answers it.
    ///
    /// Auto-execute chats are answered synchronously (the assistant message
    /// is in the outcome); review chats answer on a detached task and
    /// deliver over the stream.
    pub async fn create_message(
        self: &Arc<Self>,
        user_id: &str,
        chat_id: i64,
        stream_id: &str,
        content: &str,
    ) -> Result<CreateMessageOutcome> {
        if content.trim().is_empty() {
            return Err(ChatDbError::bad_input("Message content is empty"));
        }

        let chat = self.store.get_owned_chat(chat_id, user_id).await?;
        let user_message = self.store.create_user_message(&chat, content).await?;

        let assistant_message = self
            .dispatch_turn(chat, user_message.id, stream_id, None)
            .await?;

        Ok(CreateMessageOutcome {
            user_message,
            assistant_message,
        })
    }

    /// Edits a user message and re-answers it in place.
    ///
    /// The linked assistant message's per-query execution state is reset
    /// and its id is reused by the follow-up turn; a fresh assistant row is
    /// created only when there was no prior reply.
    pub async fn update_message(
        self: &Arc<Self>,
        user_id: &str,
        chat_id: i64,
        message_id: i64,
        stream_id: &str,
        new_content: &str,
    ) -> Result<CreateMessageOutcome> {
        if new_content.trim().is_empty() {
            return Err(ChatDbError::bad_input("Message content is empty"));
        }

        let chat = self.store.get_owned_chat(chat_id, user_id).await?;
        let message = self.store.get_message(message_id).await?;
        if message.chat_id != chat.id {
            return Err(ChatDbError::not_found("Message does not belong to this chat"));
        }
        if message.message_type != MessageType::User {
            return Err(ChatDbError::bad_input("Only user messages can be edited"));
        }

        let user_message = self
            .store
            .update_user_message_content(message_id, new_content)
            .await?;

        let reuse_assistant_id = match self.store.find_assistant_reply(message_id).await? {
            Some(assistant) => {
                self.store.reset_assistant_execution(assistant.id).await?;
                Some(assistant.id)
            }
            None => None,
        };

        let assistant_message = self
            .dispatch_turn(chat, message_id, stream_id, reuse_assistant_id)
            .await?;

        Ok(CreateMessageOutcome {
            user_message,
            assistant_message,
        })
    }

    async fn dispatch_turn(
        self: &Arc<Self>,
        chat: Chat,
        user_message_id: i64,
        stream_id: &str,
        reuse_assistant_id: Option<i64>,
    ) -> Result<Option<Message>> {
        if chat.settings.auto_execute_query {
            let assistant = Arc::clone(self)
                .run_turn(chat, user_message_id, stream_id.to_string(), reuse_assistant_id)
                .await?;
            return Ok(Some(assistant));
        }

        let key = StreamKey::new(&chat.user_id, chat.id, stream_id);
        let hub = Arc::clone(&self.hub);
        let this = Arc::clone(self);
        let stream_id = stream_id.to_string();

        let turn = tokio::spawn(async move {
            this.run_turn(chat, user_message_id, stream_id, reuse_assistant_id)
                .await
        });

        // Recovery boundary: a panicking turn still tells the client.
        tokio::spawn(async move {
            if let Err(join_error) = turn.await {
                if join_error.is_panic() {
                    warn!("assistant turn panicked: {join_error}");
                    hub.emit(
                        &key,
                        Envelope::new(
                            EventKind::AiResponseError,
                            json!({ "message": "Internal error while answering", "code": "INTERNAL" }),
                        ),
                    )
                    .await;
                }
            }
        });

        Ok(None)
    }

    /// One LLM turn: schema context, plan generation, persistence of both
    /// views, optional auto-execution, terminal `ai-response`.
    async fn run_turn(
        self: Arc<Self>,
        chat: Chat,
        user_message_id: i64,
        stream_id: String,
        reuse_assistant_id: Option<i64>,
    ) -> Result<Message> {
        let key = StreamKey::new(&chat.user_id, chat.id, &stream_id);
        let (turn_id, token) = self.register_turn(&stream_id, &chat, user_message_id);

        let result = self
            .run_turn_inner(&chat, user_message_id, &stream_id, &key, reuse_assistant_id, &token)
            .await;

        self.clear_turn(&stream_id, turn_id);

        if let Err(error) = &result {
            match error {
                // cancel_processing already wrote the synthetic message and
                // emitted response-cancelled.
                ChatDbError::Cancelled(_) => {}
                _ => {
                    self.hub
                        .emit(
                            &key,
                            Envelope::new(
                                EventKind::AiResponseError,
                                json!({ "message": error.to_string(), "code": error.code() }),
                            ),
                        )
                        .await;
                }
            }
        }

        result
    }

    async fn run_turn_inner(
        &self,
        chat: &Chat,
        user_message_id: i64,
        stream_id: &str,
        key: &StreamKey,
        reuse_assistant_id: Option<i64>,
        token: &CancellationToken,
    ) -> Result<Message> {
        self.hub.emit(key, Envelope::step("Analyzing your request")).await;

        // First turn on this chat: put the schema in front of the LLM.
        if self.store.count_system_messages(chat.id).await? == 0 {
            self.hub
                .emit(key, Envelope::step("Fetching database schema"))
                .await;
            match self.schema_cache.first_time(chat, token).await {
                Ok(formatted) => {
                    self.store.replace_system_message(chat.id, &formatted).await?;
                }
                Err(error) if matches!(error, ChatDbError::Cancelled(_)) => return Err(error),
                Err(error) => {
                    // The turn can still answer from conversation context.
                    warn!(chat_id = chat.id, "schema fetch failed, answering without: {error}");
                }
            }
        }

        if token.is_cancelled() {
            return Err(ChatDbError::cancelled("Turn cancelled"));
        }

        let history = self.store.llm_history(chat.id, user_message_id).await?;
        self.hub.emit(key, Envelope::step("Generating response")).await;

        let parsed = self
            .gateway
            .generate_plan(&history, None, chat.connection.db_type, token)
            .await?;

        if token.is_cancelled() {
            return Err(ChatDbError::cancelled("Turn cancelled"));
        }

        let assistant = match reuse_assistant_id {
            Some(assistant_id) => {
                self.store
                    .replace_assistant_message(assistant_id, &parsed.plan, &parsed.raw)
                    .await?
            }
            None => {
                self.store
                    .create_assistant_message(chat, user_message_id, &parsed.plan, &parsed.raw)
                    .await?
            }
        };

        if chat.settings.auto_execute_query {
            self.auto_execute_queries(chat, &assistant, stream_id, key, token)
                .await?;
        }

        let final_message = self.store.get_message(assistant.id).await?;
        self.hub
            .emit(
                key,
                Envelope::new(
                    EventKind::AiResponse,
                    serde_json::to_value(&final_message)
                        .map_err(|e| ChatDbError::internal(format!("DTO serialization: {e}")))?,
                ),
            )
            .await;

        Ok(final_message)
    }

    /// Runs every non-critical planned query with a per-call ceiling.
    async fn auto_execute_queries(
        &self,
        chat: &Chat,
        assistant: &Message,
        stream_id: &str,
        key: &StreamKey,
        token: &CancellationToken,
    ) -> Result<()> {
        let queries = assistant.queries.clone().unwrap_or_default();
        for query in queries {
            if is_effectively_critical(chat, &query) {
                debug!(query_id = %query.id, "skipping critical query in auto-execute");
                continue;
            }

            self.hub.emit(key, Envelope::step("Executing query")).await;

            let outcome = match tokio::time::timeout(
                AUTO_EXECUTE_TIMEOUT,
                self.executor.execute_query(chat, &query, stream_id, 0),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => ExecutionOutcome {
                    error: Some(QueryError::new(
                        "QUERY_EXECUTION_TIMEOUT",
                        format!(
                            "Query did not complete within {} seconds",
                            AUTO_EXECUTE_TIMEOUT.as_secs()
                        ),
                    )),
                    ..Default::default()
                },
            };

            let now = self.store.now_utc().await?;
            self.store
                .patch_query(assistant.id, &query.id, |q| {
                    apply_outcome(q, &outcome, &now);
                })
                .await?;

            if token.is_cancelled() {
                return Err(ChatDbError::cancelled("Turn cancelled"));
            }
        }

        Ok(())
    }

    // ---- query actions ----------------------------------------------

    /// Executes one proposed query (or fetches a further page).
    pub async fn execute_query(&self, request: ExecuteQueryRequest) -> Result<QueryActionOutcome> {
        let (chat, message, query) = self.resolve_query(&request).await?;

        if request.offset == 0 && query.is_executed {
            return Err(ChatDbError::conflict("Query was already executed"));
        }
        if request.offset > 0 && !query.is_executed {
            return Err(ChatDbError::conflict(
                "Execute the query before requesting more pages",
            ));
        }

        let outcome = self
            .executor
            .execute_query(&chat, &query, &request.stream_id, request.offset)
            .await;

        let key = StreamKey::new(&chat.user_id, chat.id, &request.stream_id);

        if request.offset > 0 {
            // Page fetches stream their rows and leave persisted state as
            // the first execute recorded it.
            self.hub
                .emit(
                    &key,
                    Envelope::new(
                        EventKind::QueryPaginatedResults,
                        json!({
                            "messageId": message.id,
                            "queryId": query.id,
                            "offset": request.offset,
                            "results": outcome.result,
                            "error": outcome.error,
                        }),
                    ),
                )
                .await;
            return Ok(QueryActionOutcome {
                message,
                query,
                transient_buttons: Vec::new(),
            });
        }

        let now = self.store.now_utc().await?;
        let (message, query) = self
            .store
            .patch_query(request.message_id, &request.query_id, |q| {
                apply_outcome(q, &outcome, &now);
            })
            .await?;

        self.store.touch_chat_async(chat.id);
        Ok(QueryActionOutcome {
            message,
            query,
            transient_buttons: Vec::new(),
        })
    }

    /// Rolls back a previously executed query.
    ///
    /// When no concrete rollback is stored, the dependent query runs first
    /// and a second gateway turn synthesizes the rollback from its result.
    pub async fn rollback_query(&self, request: ExecuteQueryRequest) -> Result<QueryActionOutcome> {
        let (chat, message, query) = self.resolve_query(&request).await?;

        if !query.is_executed {
            return Err(ChatDbError::conflict("Query has not been executed"));
        }
        if query.is_rolled_back {
            return Err(ChatDbError::conflict("Query was already rolled back"));
        }
        if !query.can_rollback {
            return Err(ChatDbError::bad_input("Query cannot be rolled back"));
        }

        let key = StreamKey::new(&chat.user_id, chat.id, &request.stream_id);

        let rollback_text = if query.has_rollback_query() {
            query.rollback_query.clone().unwrap_or_default()
        } else if query.needs_rollback_generation() {
            match self
                .generate_rollback(&chat, &message, &query, &request.stream_id)
                .await
            {
                Ok(text) => {
                    // Store the synthesized rollback before running it.
                    let stored = text.clone();
                    self.store
                        .patch_query(request.message_id, &request.query_id, move |q| {
                            q.rollback_query = Some(stored);
                        })
                        .await?;
                    text
                }
                Err(error) => {
                    return self
                        .rollback_failed(&request, &key, error)
                        .await;
                }
            }
        } else {
            return Err(ChatDbError::bad_input(
                "Query has neither a rollback query nor a dependent query",
            ));
        };

        match self
            .executor
            .execute_text(&chat, &rollback_text, &request.stream_id, true)
            .await
        {
            Ok(result) => {
                let now = self.store.now_utc().await?;
                let (message, query) = self
                    .store
                    .patch_query(request.message_id, &request.query_id, |q| {
                        q.is_rolled_back = true;
                        q.error = None;
                        // The rollback's time overwrites the execute's.
                        q.execution_time = Some(result.execution_time_ms);
                        q.action_at = Some(now.clone());
                    })
                    .await?;

                self.hub
                    .emit(
                        &key,
                        Envelope::new(
                            EventKind::RollbackExecuted,
                            json!({ "messageId": message.id, "queryId": query.id }),
                        ),
                    )
                    .await;

                self.store.touch_chat_async(chat.id);
                Ok(QueryActionOutcome {
                    message,
                    query,
                    transient_buttons: Vec::new(),
                })
            }
            Err(error) => self.rollback_failed(&request, &key, error).await,
        }
    }

    /// Runs the dependent query and asks the gateway for a concrete
    /// rollback, read from the plan entry matching the target's natural
    /// key.
    async fn generate_rollback(
        &self,
        chat: &Chat,
        message: &Message,
        query: &Query,
        stream_id: &str,
    ) -> std::result::Result<String, QueryError> {
        let dependent = query
            .rollback_dependent_query
            .clone()
            .unwrap_or_default();

        let dependent_result = self
            .executor
            .execute_text(chat, &dependent, stream_id, false)
            .await?;

        let (turn_id, token) = self.register_turn(
            stream_id,
            chat,
            message.user_message_id.unwrap_or(message.id),
        );

        let history = self
            .store
            .llm_history(chat.id, message.user_message_id.unwrap_or(i64::MAX))
            .await
            .map_err(|e| QueryError::new("ROLLBACK_GENERATION_FAILED", e.to_string()))?;

        let extra = format!(
            "The following query was executed and must now be rolled back.\n\
             Query: {}\nQuery type: {}\nExplanation: {}\n\n\
             The dependent query `{}` returned:\n{}\n\n\
             Respond with the same queries array, where the entry for this \
             query carries a concrete rollbackQuery restoring the previous \
             state from the data above.",
            query.query,
            query.query_type.as_deref().unwrap_or(""),
            query.description,
            dependent,
            dependent_result.result
        );

        let generated = self
            .gateway
            .generate_plan(&history, Some(&extra), chat.connection.db_type, &token)
            .await;

        self.clear_turn(stream_id, turn_id);

        let parsed = generated.map_err(|e| match e {
            ChatDbError::Cancelled(_) => QueryError::cancelled(),
            other => QueryError::new("ROLLBACK_GENERATION_FAILED", other.to_string()),
        })?;

        // The regenerated rollback is read from the slot whose natural key
        // matches the target query.
        parsed
            .plan
            .queries
            .iter()
            .find(|entry| {
                natural_key_eq(
                    &entry.query,
                    entry.query_type.as_deref(),
                    &entry.explanation,
                    &query.query,
                    query.query_type.as_deref(),
                    &query.description,
                )
            })
            .and_then(|entry| entry.rollback_query.clone())
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                QueryError::new(
                    "ROLLBACK_GENERATION_FAILED",
                    "The model did not produce a rollback for the matching query",
                )
            })
    }

    async fn rollback_failed(
        &self,
        request: &ExecuteQueryRequest,
        key: &StreamKey,
        error: QueryError,
    ) -> Result<QueryActionOutcome> {
        let now = self.store.now_utc().await?;
        let stored_error = error.clone();
        let (message, query) = self
            .store
            .patch_query(request.message_id, &request.query_id, move |q| {
                q.error = Some(stored_error);
                q.action_at = Some(now);
            })
            .await?;

        self.hub
            .emit(
                key,
                Envelope::new(
                    EventKind::RollbackQueryFailed,
                    json!({ "messageId": message.id, "queryId": query.id, "error": error }),
                ),
            )
            .await;

        // The fix-rollback affordance travels with the response only.
        Ok(QueryActionOutcome {
            message,
            query,
            transient_buttons: vec![ActionButton::fix_rollback_error()],
        })
    }

    /// Rewrites a proposed query's text in both views.
    pub async fn edit_query(
        &self,
        user_id: &str,
        chat_id: i64,
        message_id: i64,
        query_id: &str,
        new_text: &str,
    ) -> Result<QueryActionOutcome> {
        if new_text.trim().is_empty() {
            return Err(ChatDbError::bad_input("Query text is empty"));
        }

        let chat = self.store.get_owned_chat(chat_id, user_id).await?;
        let message = self.store.get_message(message_id).await?;
        if message.chat_id != chat.id {
            return Err(ChatDbError::not_found("Message does not belong to this chat"));
        }
        let query = message
            .query(query_id)
            .cloned()
            .ok_or_else(|| ChatDbError::not_found(format!("Query {query_id} does not exist")))?;

        if query.is_executed || query.is_rolled_back {
            return Err(ChatDbError::conflict(
                "Executed queries cannot be edited; edit the message instead",
            ));
        }

        let new_text = new_text.to_string();
        let (message, query) = self
            .store
            .patch_query(message_id, query_id, move |q| {
                let old = q.query.clone();
                if let Some(paginated) = q.pagination.paginated_query.take() {
                    // Single replacement keeps the rest of the template.
                    q.pagination.paginated_query = Some(paginated.replacen(&old, &new_text, 1));
                }
                q.query = new_text;
                q.is_edited = true;
            })
            .await?;

        self.store.touch_chat_async(chat.id);
        Ok(QueryActionOutcome {
            message,
            query,
            transient_buttons: Vec::new(),
        })
    }

    // ---- cancellation ------------------------------------------------

    /// Cancels the stream's in-flight LLM turn.
    ///
    /// Persists the synthetic assistant message and emits
    /// `response-cancelled`. A second call for the same stream is a no-op.
    pub async fn cancel_processing(&self, stream_id: &str) -> Result<Option<Message>> {
        let turn = self.active_turns.lock().unwrap().remove(stream_id);
        let Some(turn) = turn else {
            return Ok(None);
        };

        turn.token.cancel();
        info!(stream_id, chat_id = turn.chat_id, "processing cancelled");

        let chat = self.store.get_chat(turn.chat_id).await?;
        let synthetic = self
            .store
            .create_plain_assistant_message(&chat, Some(turn.user_message_id), CANCELLED_MESSAGE)
            .await?;

        let key = StreamKey::new(&turn.user_id, turn.chat_id, stream_id);
        self.hub
            .emit(
                &key,
                Envelope::new(
                    EventKind::ResponseCancelled,
                    serde_json::to_value(&synthetic)
                        .map_err(|e| ChatDbError::internal(format!("DTO serialization: {e}")))?,
                ),
            )
            .await;

        Ok(Some(synthetic))
    }

    /// Cancels the stream's in-flight query execution.
    pub async fn cancel_query_execution(
        &self,
        user_id: &str,
        chat_id: i64,
        stream_id: &str,
    ) -> Result<bool> {
        self.store.get_owned_chat(chat_id, user_id).await?;

        let cancelled = self.executor.cancel(stream_id);
        if cancelled {
            let key = StreamKey::new(user_id, chat_id, stream_id);
            self.hub
                .emit(
                    &key,
                    Envelope::new(
                        EventKind::QueryCancelled,
                        json!({ "streamId": stream_id }),
                    ),
                )
                .await;
        }

        Ok(cancelled)
    }

    // ---- internals ---------------------------------------------------

    async fn resolve_query(
        &self,
        request: &ExecuteQueryRequest,
    ) -> Result<(Chat, Message, Query)> {
        let chat = self
            .store
            .get_owned_chat(request.chat_id, &request.user_id)
            .await?;
        let message = self.store.get_message(request.message_id).await?;
        if message.chat_id != chat.id {
            return Err(ChatDbError::not_found("Message does not belong to this chat"));
        }
        let query = message
            .query(&request.query_id)
            .cloned()
            .ok_or_else(|| {
                ChatDbError::not_found(format!("Query {} does not exist", request.query_id))
            })?;
        Ok((chat, message, query))
    }

    fn register_turn(
        &self,
        stream_id: &str,
        chat: &Chat,
        user_message_id: i64,
    ) -> (u64, CancellationToken) {
        let id = self.turn_counter.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let prior = self.active_turns.lock().unwrap().insert(
            stream_id.to_string(),
            ActiveTurn {
                id,
                token: token.clone(),
                chat_id: chat.id,
                user_id: chat.user_id.clone(),
                user_message_id,
            },
        );
        if let Some(prior) = prior {
            prior.token.cancel();
        }
        (id, token)
    }

    fn clear_turn(&self, stream_id: &str, turn_id: u64) {
        let mut turns = self.active_turns.lock().unwrap();
        if turns.get(stream_id).map(|t| t.id) == Some(turn_id) {
            turns.remove(stream_id);
        }
    }
}

/// Whether a query must never run without explicit user action.
///
/// The LLM's own flag is honored; for SQL engines the statement classifier
/// double-checks, so a mislabeled DELETE still cannot auto-execute.
fn is_effectively_critical(chat: &Chat, query: &Query) -> bool {
    if query.is_critical {
        return true;
    }
    chat.connection.db_type.is_sql() && classify_query(&query.query).is_critical()
}

/// Writes an execution outcome into a query's lifecycle fields.
fn apply_outcome(q: &mut Query, outcome: &ExecutionOutcome, now: &str) {
    q.is_executed = true;
    q.execution_result = outcome.result.clone();
    q.error = outcome.error.clone();
    q.execution_time = if outcome.error.is_none() {
        Some(outcome.execution_time_ms)
    } else {
        None
    };
    if let Some(total) = outcome.total_records_count {
        q.pagination.total_records_count = Some(total);
    }
    q.action_at = Some(now.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseType, MockDriver};
    use crate::llm::{LlmProvider, MockLlmClient};
    use crate::persistence::{Base64Cipher, StateDb};

    fn connection_info() -> ConnectionInfo {
        ConnectionInfo {
            db_type: DatabaseType::Postgres,
            host: "localhost".to_string(),
            database: "app".to_string(),
            ..Default::default()
        }
    }

    async fn harness_with_limits(
        driver: MockDriver,
        llm: MockLlmClient,
        limits: LimitsConfig,
    ) -> Arc<ChatOrchestrator> {
        let hub = Arc::new(StreamHub::new());
        let manager = Arc::new(ConnectionManager::new(Arc::clone(&hub)));
        manager.register_driver(Arc::new(driver)).await;

        let db = StateDb::open_in_memory(Arc::new(Base64Cipher::default()))
            .await
            .unwrap();
        let store = Arc::new(MessageStore::new(Arc::new(db)));
        let schema_cache = Arc::new(SchemaCache::new(Arc::clone(&manager), Arc::clone(&store)));
        let executor = Arc::new(QueryExecutor::new(
            Arc::clone(&manager),
            Arc::new(crate::executor::CancelRegistry::new()),
        ));
        let gateway = Arc::new(
            LlmGateway::new(LlmProvider::Mock).with_client(LlmProvider::Mock, Arc::new(llm)),
        );

        Arc::new(ChatOrchestrator::new(
            hub,
            manager,
            schema_cache,
            executor,
            gateway,
            store,
            limits,
        ))
    }

    async fn harness(driver: MockDriver, llm: MockLlmClient) -> Arc<ChatOrchestrator> {
        harness_with_limits(
            driver,
            llm,
            LimitsConfig {
                max_chats_per_user: 10,
            },
        )
        .await
    }

    #[tokio::test]
    async fn test_chat_cap_enforced() {
        let orchestrator = harness_with_limits(
            MockDriver::new(),
            MockLlmClient::new(),
            LimitsConfig {
                max_chats_per_user: 0,
            },
        )
        .await;

        // Trial mode: two chats pass, the third conflicts.
        for _ in 0..2 {
            orchestrator
                .create_chat("u1", &connection_info(), "ALL", ChatSettings::default())
                .await
                .unwrap();
        }
        let err = orchestrator
            .create_chat("u1", &connection_info(), "ALL", ChatSettings::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_auto_execute_turn_persists_both_views() {
        let orchestrator = harness(MockDriver::new(), MockLlmClient::new()).await;
        let chat = orchestrator
            .create_chat(
                "u1",
                &connection_info(),
                "ALL",
                ChatSettings {
                    auto_execute_query: true,
                    share_data_with_ai: false,
                },
            )
            .await
            .unwrap();

        let outcome = orchestrator
            .create_message("u1", chat.id, "s1", "show 5 latest users")
            .await
            .unwrap();

        let assistant = outcome.assistant_message.unwrap();
        let query = &assistant.queries.as_ref().unwrap()[0];
        assert!(query.is_executed);
        assert!(query.error.is_none());

        let mirror = orchestrator
            .store()
            .get_mirror(assistant.id)
            .await
            .unwrap()
            .unwrap();
        let crate::model::LlmContent::Assistant { assistant_response } = mirror.content else {
            panic!("expected assistant mirror");
        };
        assert_eq!(assistant_response["queries"][0]["isExecuted"], json!(true));
    }

    #[tokio::test]
    async fn test_critical_query_never_auto_executes() {
        let llm = MockLlmClient::new().with_response(
            "drop",
            json!({
                "assistantMessage": "This will delete data.",
                "queries": [{
                    "query": "DELETE FROM users",
                    "queryType": "DELETE",
                    "explanation": "Remove everything",
                    // Mislabeled by the model; the classifier catches it.
                    "isCritical": false,
                    "canRollback": false
                }]
            })
            .to_string(),
        );
        let driver = MockDriver::new();
        let orchestrator = harness(driver.clone(), llm).await;

        let chat = orchestrator
            .create_chat(
                "u1",
                &connection_info(),
                "ALL",
                ChatSettings {
                    auto_execute_query: true,
                    share_data_with_ai: false,
                },
            )
            .await
            .unwrap();

        let outcome = orchestrator
            .create_message("u1", chat.id, "s1", "drop all users")
            .await
            .unwrap();

        let assistant = outcome.assistant_message.unwrap();
        assert!(!assistant.queries.as_ref().unwrap()[0].is_executed);
        assert!(!driver
            .executed_queries()
            .iter()
            .any(|q| q.contains("DELETE")));
    }

    #[tokio::test]
    async fn test_execute_query_double_submit_conflicts() {
        let orchestrator = harness(MockDriver::new(), MockLlmClient::new()).await;
        let chat = orchestrator
            .create_chat(
                "u1",
                &connection_info(),
                "ALL",
                ChatSettings {
                    auto_execute_query: false,
                    share_data_with_ai: false,
                },
            )
            .await
            .unwrap();

        // Review path: persist the plan without executing.
        let user = orchestrator
            .store()
            .create_user_message(&chat, "show users")
            .await
            .unwrap();
        let raw = json!({
            "assistantMessage": "plan",
            "queries": [{"query": "SELECT * FROM users", "queryType": "SELECT", "explanation": "all"}]
        });
        let plan = serde_json::from_value(raw.clone()).unwrap();
        let assistant = orchestrator
            .store()
            .create_assistant_message(&chat, user.id, &plan, &raw)
            .await
            .unwrap();
        let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

        let request = ExecuteQueryRequest {
            user_id: "u1".to_string(),
            chat_id: chat.id,
            message_id: assistant.id,
            query_id: query_id.clone(),
            stream_id: "s1".to_string(),
            offset: 0,
        };

        let outcome = orchestrator.execute_query(request.clone()).await.unwrap();
        assert!(outcome.query.is_executed);

        let err = orchestrator.execute_query(request).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_edit_query_rewrites_pagination_once() {
        let orchestrator = harness(MockDriver::new(), MockLlmClient::new()).await;
        let chat = orchestrator
            .create_chat("u1", &connection_info(), "ALL", ChatSettings::default())
            .await
            .unwrap();

        let user = orchestrator
            .store()
            .create_user_message(&chat, "orders")
            .await
            .unwrap();
        let raw = json!({
            "assistantMessage": "plan",
            "queries": [{
                "query": "SELECT * FROM orders",
                "queryType": "SELECT",
                "explanation": "all orders",
                "pagination": {
                    "paginatedQuery": "SELECT * FROM orders OFFSET offset_size LIMIT 50",
                    "countQuery": "SELECT COUNT(*) FROM orders"
                }
            }]
        });
        let plan = serde_json::from_value(raw.clone()).unwrap();
        let assistant = orchestrator
            .store()
            .create_assistant_message(&chat, user.id, &plan, &raw)
            .await
            .unwrap();
        let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

        let outcome = orchestrator
            .edit_query(
                "u1",
                chat.id,
                assistant.id,
                &query_id,
                "SELECT id FROM orders",
            )
            .await
            .unwrap();

        assert!(outcome.query.is_edited);
        assert_eq!(outcome.query.query, "SELECT id FROM orders");
        assert_eq!(
            outcome.query.pagination.paginated_query.as_deref(),
            Some("SELECT id FROM orders OFFSET offset_size LIMIT 50")
        );

        // Idempotence: the same edit again changes nothing further.
        let again = orchestrator
            .edit_query(
                "u1",
                chat.id,
                assistant.id,
                &query_id,
                "SELECT id FROM orders",
            )
            .await
            .unwrap();
        assert_eq!(again.query.query, outcome.query.query);
        assert_eq!(again.query.pagination, outcome.query.pagination);

        // The mirror carries the marker exactly once.
        let mirror = orchestrator
            .store()
            .get_mirror(assistant.id)
            .await
            .unwrap()
            .unwrap();
        let crate::model::LlmContent::Assistant { assistant_response } = mirror.content else {
            panic!("expected assistant mirror");
        };
        assert_eq!(
            assistant_response["queries"][0]["query"],
            json!("EDITED by user: SELECT id FROM orders")
        );
    }

    #[tokio::test]
    async fn test_edit_executed_query_conflicts() {
        let orchestrator = harness(MockDriver::new(), MockLlmClient::new()).await;
        let chat = orchestrator
            .create_chat("u1", &connection_info(), "ALL", ChatSettings::default())
            .await
            .unwrap();

        let user = orchestrator
            .store()
            .create_user_message(&chat, "orders")
            .await
            .unwrap();
        let raw = json!({
            "assistantMessage": "plan",
            "queries": [{"query": "SELECT 1", "queryType": "SELECT", "explanation": "one"}]
        });
        let plan = serde_json::from_value(raw.clone()).unwrap();
        let assistant = orchestrator
            .store()
            .create_assistant_message(&chat, user.id, &plan, &raw)
            .await
            .unwrap();
        let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

        orchestrator
            .store()
            .patch_query(assistant.id, &query_id, |q| q.is_executed = true)
            .await
            .unwrap();

        let err = orchestrator
            .edit_query("u1", chat.id, assistant.id, &query_id, "SELECT 2")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_cancel_processing_twice_second_noop() {
        let orchestrator = harness(
            MockDriver::new(),
            MockLlmClient::new().with_delay(Duration::from_secs(30)),
        )
        .await;
        let chat = orchestrator
            .create_chat("u1", &connection_info(), "ALL", ChatSettings::default())
            .await
            .unwrap();

        // Review path: the turn runs in the background and blocks on the
        // slow mock provider.
        let outcome = orchestrator
            .create_message("u1", chat.id, "s1", "show users")
            .await
            .unwrap();
        assert!(outcome.assistant_message.is_none());

        // Wait for the turn to register itself.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let synthetic = orchestrator.cancel_processing("s1").await.unwrap().unwrap();
        assert_eq!(synthetic.content, CANCELLED_MESSAGE);
        assert_eq!(synthetic.user_message_id, Some(outcome.user_message.id));

        assert!(orchestrator.cancel_processing("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_foreign_user_forbidden() {
        let orchestrator = harness(MockDriver::new(), MockLlmClient::new()).await;
        let chat = orchestrator
            .create_chat("u1", &connection_info(), "ALL", ChatSettings::default())
            .await
            .unwrap();

        let err = orchestrator
            .create_message("intruder", chat.id, "s1", "hi")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }
}
