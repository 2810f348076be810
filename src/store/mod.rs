//! Dual persistence facade (C7).
//!
//! Every write goes to the user-visible Message view first, then to the
//! LLM-visible mirror. A mirror failure is logged and swallowed: the next
//! LLM turn sees a slightly stale view, but the user display stays correct
//! and authoritative.

use crate::chat::buttons::derive_action_buttons;
use crate::chat::matching::{add_edited_marker, find_plan_query_mut};
use crate::error::{ChatDbError, Result};
use crate::llm::plan::AssistantPlan;
use crate::model::{Chat, ChatSettings, LlmContent, LlmMessage, LlmRole, Message, MessageType, Query};
use crate::persistence::{chats, llm_messages, messages, StateDb};
use crate::config::ConnectionInfo;
use std::sync::Arc;
use tracing::{debug, warn};

/// Store facade over the chat, message, and LLM-message repositories.
pub struct MessageStore {
    db: Arc<StateDb>,
}

impl MessageStore {
    pub fn new(db: Arc<StateDb>) -> Self {
        Self { db }
    }

    /// The underlying state database.
    pub fn state(&self) -> &Arc<StateDb> {
        &self.db
    }

    /// The store's clock: UTC RFC 3339, same source that stamps rows.
    pub async fn now_utc(&self) -> Result<String> {
        let (now,): (String,) =
            sqlx::query_as("SELECT strftime('%Y-%m-%dT%H:%M:%SZ','now')")
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| ChatDbError::persistence(format!("Failed to read clock: {e}")))?;
        Ok(now)
    }

    // ---- chats -------------------------------------------------------

    pub async fn create_chat(
        &self,
        user_id: &str,
        connection: &ConnectionInfo,
        selected_collections: &str,
        settings: ChatSettings,
    ) -> Result<Chat> {
        chats::create_chat(
            self.db.pool(),
            self.db.cipher().as_ref(),
            user_id,
            connection,
            selected_collections,
            settings,
        )
        .await
    }

    /// Gets a chat, failing with `NOT_FOUND` when absent.
    pub async fn get_chat(&self, chat_id: i64) -> Result<Chat> {
        chats::get_chat(self.db.pool(), self.db.cipher().as_ref(), chat_id)
            .await?
            .ok_or_else(|| ChatDbError::not_found(format!("Chat {chat_id} does not exist")))
    }

    /// Gets a chat and verifies ownership.
    pub async fn get_owned_chat(&self, chat_id: i64, user_id: &str) -> Result<Chat> {
        let chat = self.get_chat(chat_id).await?;
        if !chat.is_owned_by(user_id) {
            return Err(ChatDbError::forbidden("Chat belongs to another user"));
        }
        Ok(chat)
    }

    pub async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>> {
        chats::list_chats(self.db.pool(), self.db.cipher().as_ref(), user_id).await
    }

    pub async fn count_chats(&self, user_id: &str) -> Result<i64> {
        chats::count_chats(self.db.pool(), user_id).await
    }

    pub async fn update_chat_connection(
        &self,
        chat_id: i64,
        connection: &ConnectionInfo,
    ) -> Result<()> {
        chats::update_chat_connection(
            self.db.pool(),
            self.db.cipher().as_ref(),
            chat_id,
            connection,
        )
        .await
    }

    pub async fn update_chat_settings(&self, chat_id: i64, settings: ChatSettings) -> Result<()> {
        chats::update_chat_settings(self.db.pool(), chat_id, settings).await
    }

    pub async fn update_selected_collections(
        &self,
        chat_id: i64,
        selected_collections: &str,
    ) -> Result<()> {
        chats::update_selected_collections(self.db.pool(), chat_id, selected_collections).await
    }

    /// Deletes a chat; messages and mirrors cascade.
    pub async fn delete_chat(&self, chat_id: i64) -> Result<()> {
        chats::delete_chat(self.db.pool(), chat_id).await?;
        Ok(())
    }

    /// Bumps the chat's `updated_at` without blocking the caller.
    pub fn touch_chat_async(&self, chat_id: i64) {
        let pool = self.db.pool().clone();
        tokio::spawn(async move {
            if let Err(e) = chats::touch_chat(&pool, chat_id).await {
                warn!(chat_id, "failed to bump chat timestamp: {e}");
            }
        });
    }

    // ---- messages ----------------------------------------------------

    /// Persists a user message and its mirror.
    pub async fn create_user_message(&self, chat: &Chat, content: &str) -> Result<Message> {
        let message = messages::insert_message(
            self.db.pool(),
            messages::NewMessage {
                chat_id: chat.id,
                user_id: chat.user_id.clone(),
                message_type: Some(MessageType::User),
                content: content.to_string(),
                ..Default::default()
            },
        )
        .await?;

        self.mirror_write(
            chat.id,
            Some(message.id),
            &LlmContent::User {
                user_message: content.to_string(),
            },
        )
        .await;

        self.touch_chat_async(chat.id);
        Ok(message)
    }

    /// Persists an assistant message built from a validated plan, plus its
    /// mirror carrying the provider's raw JSON.
    pub async fn create_assistant_message(
        &self,
        chat: &Chat,
        user_message_id: i64,
        plan: &AssistantPlan,
        raw_plan: &serde_json::Value,
    ) -> Result<Message> {
        let message = messages::insert_message(
            self.db.pool(),
            messages::NewMessage {
                chat_id: chat.id,
                user_id: chat.user_id.clone(),
                message_type: Some(MessageType::Assistant),
                content: plan.assistant_message.clone(),
                user_message_id: Some(user_message_id),
                ..Default::default()
            },
        )
        .await?;

        let queries = Self::plan_queries(message.id, plan);
        let buttons = derive_action_buttons(Self::plan_buttons(plan), queries.as_ref());
        messages::update_queries(self.db.pool(), message.id, &queries, &buttons).await?;

        self.mirror_write(
            chat.id,
            Some(message.id),
            &LlmContent::Assistant {
                assistant_response: raw_plan.clone(),
            },
        )
        .await;

        self.touch_chat_async(chat.id);
        self.get_message(message.id).await
    }

    /// Re-answers an edited user message in place, reusing the assistant
    /// message id in both views.
    pub async fn replace_assistant_message(
        &self,
        assistant_id: i64,
        plan: &AssistantPlan,
        raw_plan: &serde_json::Value,
    ) -> Result<Message> {
        let queries = Self::plan_queries(assistant_id, plan);
        let buttons = derive_action_buttons(Self::plan_buttons(plan), queries.as_ref());
        messages::replace_assistant_content(
            self.db.pool(),
            assistant_id,
            &plan.assistant_message,
            &queries,
            &buttons,
        )
        .await?;

        if let Some(mirror) = llm_messages::get_by_message_id(self.db.pool(), assistant_id).await? {
            let content = LlmContent::Assistant {
                assistant_response: raw_plan.clone(),
            };
            if let Err(e) =
                llm_messages::update_content(self.db.pool(), mirror.id, &content, mirror.is_edited)
                    .await
            {
                warn!(assistant_id, "mirror update failed, user view kept: {e}");
            }
        }

        self.get_message(assistant_id).await
    }

    /// Persists a plain assistant message (no queries), e.g. the synthetic
    /// "Operation cancelled by user" row.
    pub async fn create_plain_assistant_message(
        &self,
        chat: &Chat,
        user_message_id: Option<i64>,
        content: &str,
    ) -> Result<Message> {
        let message = messages::insert_message(
            self.db.pool(),
            messages::NewMessage {
                chat_id: chat.id,
                user_id: chat.user_id.clone(),
                message_type: Some(MessageType::Assistant),
                content: content.to_string(),
                user_message_id,
                ..Default::default()
            },
        )
        .await?;

        self.mirror_write(
            chat.id,
            Some(message.id),
            &LlmContent::Assistant {
                assistant_response: serde_json::json!({ "assistantMessage": content }),
            },
        )
        .await;

        self.touch_chat_async(chat.id);
        Ok(message)
    }

    fn plan_queries(message_id: i64, plan: &AssistantPlan) -> Option<Vec<Query>> {
        if plan.queries.is_empty() {
            return None;
        }
        Some(
            plan.queries
                .iter()
                .cloned()
                .enumerate()
                .map(|(idx, q)| q.into_query(message_id, idx))
                .collect(),
        )
    }

    fn plan_buttons(plan: &AssistantPlan) -> Option<Vec<crate::model::ActionButton>> {
        if plan.action_buttons.is_empty() {
            return None;
        }
        Some(
            plan.action_buttons
                .iter()
                .cloned()
                .map(|b| b.into_button())
                .collect(),
        )
    }

    /// Gets a message, failing with `NOT_FOUND` when absent.
    pub async fn get_message(&self, message_id: i64) -> Result<Message> {
        messages::get_message(self.db.pool(), message_id)
            .await?
            .ok_or_else(|| ChatDbError::not_found(format!("Message {message_id} does not exist")))
    }

    pub async fn list_messages(&self, chat_id: i64) -> Result<Vec<Message>> {
        messages::list_messages(self.db.pool(), chat_id).await
    }

    pub async fn find_assistant_reply(&self, user_message_id: i64) -> Result<Option<Message>> {
        messages::find_assistant_reply(self.db.pool(), user_message_id).await
    }

    /// Updates an edited user message's content in both views.
    pub async fn update_user_message_content(
        &self,
        message_id: i64,
        new_content: &str,
    ) -> Result<Message> {
        messages::update_content(self.db.pool(), message_id, new_content, true).await?;

        if let Some(mirror) = llm_messages::get_by_message_id(self.db.pool(), message_id).await? {
            let content = LlmContent::User {
                user_message: new_content.to_string(),
            };
            if let Err(e) =
                llm_messages::update_content(self.db.pool(), mirror.id, &content, true).await
            {
                warn!(message_id, "mirror update failed, user view kept: {e}");
            }
        }

        self.get_message(message_id).await
    }

    /// Clears every embedded query's execution state on an assistant
    /// message (the linked user message was edited), in both views.
    pub async fn reset_assistant_execution(&self, assistant_id: i64) -> Result<Message> {
        let mut message = self.get_message(assistant_id).await?;
        let pre_queries = message.queries.clone();

        if let Some(queries) = message.queries.as_mut() {
            for query in queries.iter_mut() {
                query.reset_execution_state();
            }
        }

        let buttons =
            derive_action_buttons(message.action_buttons.clone(), message.queries.as_ref());
        messages::update_queries(self.db.pool(), assistant_id, &message.queries, &buttons).await?;

        if let (Some(pre), Some(post)) = (pre_queries.as_ref(), message.queries.as_ref()) {
            self.sync_mirror_queries(assistant_id, pre, post).await;
        }

        self.get_message(assistant_id).await
    }

    /// Applies a mutation to one embedded query and syncs both views.
    ///
    /// The pre-image of the query is captured before the mutation so the
    /// mirror entry can still be located when the mutation changes the
    /// natural key (query edits).
    pub async fn patch_query<F>(
        &self,
        message_id: i64,
        query_id: &str,
        mutate: F,
    ) -> Result<(Message, Query)>
    where
        F: FnOnce(&mut Query),
    {
        let mut message = self.get_message(message_id).await?;
        let pre = message
            .query(query_id)
            .cloned()
            .ok_or_else(|| ChatDbError::not_found(format!("Query {query_id} does not exist")))?;

        {
            let query = message
                .query_mut(query_id)
                .expect("query present, checked above");
            mutate(query);
        }
        let post = message
            .query(query_id)
            .cloned()
            .expect("query present, checked above");

        let buttons =
            derive_action_buttons(message.action_buttons.clone(), message.queries.as_ref());
        messages::update_queries(self.db.pool(), message_id, &message.queries, &buttons).await?;

        self.sync_mirror_queries(message_id, &[pre], &[post.clone()]).await;

        let message = self.get_message(message_id).await?;
        Ok((message, post))
    }

    /// Pushes per-query state from the Message view into the mirror's plan
    /// JSON, pairing pre-image keys with post-image values.
    async fn sync_mirror_queries(&self, message_id: i64, pre: &[Query], post: &[Query]) {
        let mirror = match llm_messages::get_by_message_id(self.db.pool(), message_id).await {
            Ok(Some(mirror)) => mirror,
            Ok(None) => return,
            Err(e) => {
                warn!(message_id, "mirror read failed, user view kept: {e}");
                return;
            }
        };

        let LlmContent::Assistant {
            assistant_response: mut raw,
        } = mirror.content
        else {
            return;
        };

        let mut edited = mirror.is_edited;
        for (pre_query, post_query) in pre.iter().zip(post.iter()) {
            if let Some(entry) = find_plan_query_mut(&mut raw, pre_query) {
                sync_plan_entry(entry, post_query);
                edited = edited || post_query.is_edited;
            } else {
                debug!(
                    message_id,
                    query_id = %post_query.id,
                    "no mirror entry matched the natural key"
                );
            }
        }

        let content = LlmContent::Assistant {
            assistant_response: raw,
        };
        if let Err(e) =
            llm_messages::update_content(self.db.pool(), mirror.id, &content, edited).await
        {
            warn!(message_id, "mirror update failed, user view kept: {e}");
        }
    }

    pub async fn delete_messages(
        &self,
        chat_id: i64,
        dont_delete_system_messages: bool,
    ) -> Result<()> {
        messages::delete_chat_messages(self.db.pool(), chat_id).await?;
        llm_messages::delete_chat_llm_messages(self.db.pool(), chat_id, dont_delete_system_messages)
            .await?;
        Ok(())
    }

    // ---- LLM view ----------------------------------------------------

    async fn mirror_write(&self, chat_id: i64, message_id: Option<i64>, content: &LlmContent) {
        if let Err(e) =
            llm_messages::insert_llm_message(self.db.pool(), chat_id, message_id, content, false)
                .await
        {
            warn!(chat_id, ?message_id, "mirror insert failed, user view kept: {e}");
        }
    }

    /// The history handed to the gateway: schema context first, then the
    /// conversation truncated at (and including) the answered user message.
    pub async fn llm_history(
        &self,
        chat_id: i64,
        up_to_message_id: i64,
    ) -> Result<Vec<LlmMessage>> {
        let all = llm_messages::list_llm_messages(self.db.pool(), chat_id).await?;

        let mut history: Vec<LlmMessage> = all
            .iter()
            .filter(|m| m.role == LlmRole::System)
            .cloned()
            .collect();

        for row in all.into_iter().filter(|m| m.role != LlmRole::System) {
            let is_target = row.message_id == Some(up_to_message_id);
            history.push(row);
            if is_target {
                break;
            }
        }

        Ok(history)
    }

    /// Replaces the chat's single system-role mirror row with fresh schema
    /// text.
    pub async fn replace_system_message(
        &self,
        chat_id: i64,
        schema_text: &str,
    ) -> Result<LlmMessage> {
        llm_messages::delete_system_messages(self.db.pool(), chat_id).await?;
        llm_messages::insert_llm_message(
            self.db.pool(),
            chat_id,
            None,
            &LlmContent::System {
                schema_update: schema_text.to_string(),
            },
            false,
        )
        .await
    }

    pub async fn count_system_messages(&self, chat_id: i64) -> Result<i64> {
        llm_messages::count_system_messages(self.db.pool(), chat_id).await
    }

    pub async fn get_mirror(&self, message_id: i64) -> Result<Option<LlmMessage>> {
        llm_messages::get_by_message_id(self.db.pool(), message_id).await
    }
}

/// Writes post-image execution state into one mirror plan entry.
fn sync_plan_entry(entry: &mut serde_json::Value, post: &Query) {
    use serde_json::json;

    let text = if post.is_edited {
        add_edited_marker(&post.query)
    } else {
        post.query.clone()
    };
    entry["query"] = json!(text);
    entry["isExecuted"] = json!(post.is_executed);
    entry["isRolledBack"] = json!(post.is_rolled_back);
    entry["executionResult"] = post
        .execution_result
        .clone()
        .unwrap_or(serde_json::Value::Null);
    entry["executionTime"] = post
        .execution_time
        .map(|t| json!(t))
        .unwrap_or(serde_json::Value::Null);
    entry["error"] = post
        .error
        .as_ref()
        .and_then(|e| serde_json::to_value(e).ok())
        .unwrap_or(serde_json::Value::Null);

    if let Some(rollback) = &post.rollback_query {
        entry["rollbackQuery"] = json!(rollback);
    }

    if let Some(total) = post.pagination.total_records_count {
        if entry.get("pagination").map(|p| p.is_object()) != Some(true) {
            entry["pagination"] = json!({});
        }
        entry["pagination"]["totalRecordsCount"] = json!(total);
    }

    if let Some(paginated) = &post.pagination.paginated_query {
        if entry.get("pagination").map(|p| p.is_object()) != Some(true) {
            entry["pagination"] = json!({});
        }
        entry["pagination"]["paginatedQuery"] = json!(paginated);
    }
}
