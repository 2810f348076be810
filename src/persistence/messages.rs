//! Message repository (user-visible view).
//!
//! Embedded queries and action buttons are stored as JSON columns; the
//! store stamps timestamps on write.

use crate::error::{ChatDbError, Result};
use crate::model::{ActionButton, Message, MessageType, Query};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

/// Raw database row for a message.
#[derive(Debug, Clone, FromRow)]
struct MessageRow {
    id: i64,
    chat_id: i64,
    user_id: String,
    message_type: String,
    content: String,
    is_edited: i64,
    user_message_id: Option<i64>,
    queries: Option<String>,
    action_buttons: Option<String>,
    created_at: String,
    updated_at: String,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        let queries: Option<Vec<Query>> = self
            .queries
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| ChatDbError::persistence(format!("Stored queries invalid: {e}")))?;
        let action_buttons: Option<Vec<ActionButton>> = self
            .action_buttons
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| ChatDbError::persistence(format!("Stored buttons invalid: {e}")))?;

        Ok(Message {
            id: self.id,
            chat_id: self.chat_id,
            user_id: self.user_id,
            message_type: MessageType::from_str(&self.message_type),
            content: self.content,
            is_edited: self.is_edited != 0,
            user_message_id: self.user_message_id,
            queries,
            action_buttons,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Fields for a new message row.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub chat_id: i64,
    pub user_id: String,
    pub message_type: Option<MessageType>,
    pub content: String,
    pub user_message_id: Option<i64>,
    pub queries: Option<Vec<Query>>,
    pub action_buttons: Option<Vec<ActionButton>>,
}

const SELECT_COLUMNS: &str = "id, chat_id, user_id, message_type, content, is_edited, \
     user_message_id, queries, action_buttons, created_at, updated_at";

fn encode_queries(queries: &Option<Vec<Query>>) -> Result<Option<String>> {
    queries
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| ChatDbError::persistence(format!("Failed to serialize queries: {e}")))
}

fn encode_buttons(buttons: &Option<Vec<ActionButton>>) -> Result<Option<String>> {
    buttons
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| ChatDbError::persistence(format!("Failed to serialize buttons: {e}")))
}

/// Inserts a message, stamping timestamps.
pub async fn insert_message(pool: &SqlitePool, new: NewMessage) -> Result<Message> {
    let message_type = new.message_type.unwrap_or(MessageType::User);
    let queries = encode_queries(&new.queries)?;
    let buttons = encode_buttons(&new.action_buttons)?;

    let result = sqlx::query(
        r#"
        INSERT INTO messages
        (chat_id, user_id, message_type, content, user_message_id, queries, action_buttons)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new.chat_id)
    .bind(&new.user_id)
    .bind(message_type.as_str())
    .bind(&new.content)
    .bind(new.user_message_id)
    .bind(queries)
    .bind(buttons)
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to insert message: {e}")))?;

    get_message(pool, result.last_insert_rowid())
        .await?
        .ok_or_else(|| ChatDbError::internal("Message vanished after insert"))
}

/// Inserts a copied message with an explicit creation time offset.
///
/// `created_at` is computed as `base_created_at + offset_secs`, preserving
/// relative ordering when a chat is duplicated.
pub async fn insert_message_at(
    pool: &SqlitePool,
    new: NewMessage,
    base_created_at: &str,
    offset_secs: i64,
) -> Result<Message> {
    let message_type = new.message_type.unwrap_or(MessageType::User);
    let queries = encode_queries(&new.queries)?;
    let buttons = encode_buttons(&new.action_buttons)?;

    let result = sqlx::query(
        r#"
        INSERT INTO messages
        (chat_id, user_id, message_type, content, user_message_id, queries, action_buttons,
         created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?,
                strftime('%Y-%m-%dT%H:%M:%SZ', ?, '+' || ? || ' seconds'),
                strftime('%Y-%m-%dT%H:%M:%SZ','now'))
        "#,
    )
    .bind(new.chat_id)
    .bind(&new.user_id)
    .bind(message_type.as_str())
    .bind(&new.content)
    .bind(new.user_message_id)
    .bind(queries)
    .bind(buttons)
    .bind(base_created_at)
    .bind(offset_secs)
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to insert copied message: {e}")))?;

    get_message(pool, result.last_insert_rowid())
        .await?
        .ok_or_else(|| ChatDbError::internal("Message vanished after insert"))
}

/// Gets a message by id.
pub async fn get_message(pool: &SqlitePool, id: i64) -> Result<Option<Message>> {
    let row: Option<MessageRow> =
        sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM messages WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| ChatDbError::persistence(format!("Failed to get message: {e}")))?;

    row.map(MessageRow::into_message).transpose()
}

/// Lists a chat's messages in creation order.
pub async fn list_messages(pool: &SqlitePool, chat_id: i64) -> Result<Vec<Message>> {
    let rows: Vec<MessageRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM messages WHERE chat_id = ? ORDER BY created_at, id"
    ))
    .bind(chat_id)
    .fetch_all(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to list messages: {e}")))?;

    rows.into_iter().map(MessageRow::into_message).collect()
}

/// Finds the assistant reply linked to a user message.
pub async fn find_assistant_reply(
    pool: &SqlitePool,
    user_message_id: i64,
) -> Result<Option<Message>> {
    let row: Option<MessageRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM messages \
         WHERE user_message_id = ? AND message_type = 'assistant' \
         ORDER BY created_at, id LIMIT 1"
    ))
    .bind(user_message_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to find assistant reply: {e}")))?;

    row.map(MessageRow::into_message).transpose()
}

/// Updates a message's text content.
pub async fn update_content(
    pool: &SqlitePool,
    id: i64,
    content: &str,
    is_edited: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE messages
        SET content = ?, is_edited = ?,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
        WHERE id = ?
        "#,
    )
    .bind(content)
    .bind(is_edited as i64)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to update message: {e}")))?;

    Ok(())
}

/// Replaces a message's embedded queries and action buttons.
pub async fn update_queries(
    pool: &SqlitePool,
    id: i64,
    queries: &Option<Vec<Query>>,
    action_buttons: &Option<Vec<ActionButton>>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE messages
        SET queries = ?, action_buttons = ?,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
        WHERE id = ?
        "#,
    )
    .bind(encode_queries(queries)?)
    .bind(encode_buttons(action_buttons)?)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to update queries: {e}")))?;

    Ok(())
}

/// Replaces a message's content, queries, and buttons in one write
/// (re-answering an edited user message reuses the assistant row).
pub async fn replace_assistant_content(
    pool: &SqlitePool,
    id: i64,
    content: &str,
    queries: &Option<Vec<Query>>,
    action_buttons: &Option<Vec<ActionButton>>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE messages
        SET content = ?, queries = ?, action_buttons = ?,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
        WHERE id = ?
        "#,
    )
    .bind(content)
    .bind(encode_queries(queries)?)
    .bind(encode_buttons(action_buttons)?)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to replace assistant content: {e}")))?;

    Ok(())
}

/// Deletes all messages of a chat.
pub async fn delete_chat_messages(pool: &SqlitePool, chat_id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM messages WHERE chat_id = ?")
        .bind(chat_id)
        .execute(pool)
        .await
        .map_err(|e| ChatDbError::persistence(format!("Failed to delete messages: {e}")))?;

    Ok(result.rows_affected())
}
