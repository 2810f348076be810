//! LLM-message repository (LLM-visible mirror).

use crate::error::{ChatDbError, Result};
use crate::model::{LlmContent, LlmMessage, LlmRole};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

/// Raw database row for an LLM message.
#[derive(Debug, Clone, FromRow)]
struct LlmMessageRow {
    id: i64,
    chat_id: i64,
    message_id: Option<i64>,
    role: String,
    content: String,
    is_edited: i64,
    created_at: String,
}

impl LlmMessageRow {
    fn into_llm_message(self) -> Result<LlmMessage> {
        let content: LlmContent = serde_json::from_str(&self.content)
            .map_err(|e| ChatDbError::persistence(format!("Stored LLM content invalid: {e}")))?;

        Ok(LlmMessage {
            id: self.id,
            chat_id: self.chat_id,
            message_id: self.message_id,
            role: LlmRole::from_str(&self.role),
            content,
            is_edited: self.is_edited != 0,
            created_at: self.created_at,
        })
    }
}

const SELECT_COLUMNS: &str =
    "id, chat_id, message_id, role, content, is_edited, created_at";

fn encode_content(content: &LlmContent) -> Result<String> {
    serde_json::to_string(content)
        .map_err(|e| ChatDbError::persistence(format!("Failed to serialize LLM content: {e}")))
}

/// Inserts a mirror row; the role comes from the content shape.
pub async fn insert_llm_message(
    pool: &SqlitePool,
    chat_id: i64,
    message_id: Option<i64>,
    content: &LlmContent,
    is_edited: bool,
) -> Result<LlmMessage> {
    let result = sqlx::query(
        r#"
        INSERT INTO llm_messages (chat_id, message_id, role, content, is_edited)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(chat_id)
    .bind(message_id)
    .bind(content.role().as_str())
    .bind(encode_content(content)?)
    .bind(is_edited as i64)
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to insert LLM message: {e}")))?;

    get_llm_message(pool, result.last_insert_rowid())
        .await?
        .ok_or_else(|| ChatDbError::internal("LLM message vanished after insert"))
}

/// Inserts a copied mirror row with an explicit creation time offset.
pub async fn insert_llm_message_at(
    pool: &SqlitePool,
    chat_id: i64,
    message_id: Option<i64>,
    content: &LlmContent,
    is_edited: bool,
    base_created_at: &str,
    offset_secs: i64,
) -> Result<LlmMessage> {
    let result = sqlx::query(
        r#"
        INSERT INTO llm_messages (chat_id, message_id, role, content, is_edited, created_at)
        VALUES (?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', ?, '+' || ? || ' seconds'))
        "#,
    )
    .bind(chat_id)
    .bind(message_id)
    .bind(content.role().as_str())
    .bind(encode_content(content)?)
    .bind(is_edited as i64)
    .bind(base_created_at)
    .bind(offset_secs)
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to insert copied LLM message: {e}")))?;

    get_llm_message(pool, result.last_insert_rowid())
        .await?
        .ok_or_else(|| ChatDbError::internal("LLM message vanished after insert"))
}

/// Gets a mirror row by id.
pub async fn get_llm_message(pool: &SqlitePool, id: i64) -> Result<Option<LlmMessage>> {
    let row: Option<LlmMessageRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM llm_messages WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to get LLM message: {e}")))?;

    row.map(LlmMessageRow::into_llm_message).transpose()
}

/// Gets the mirror row for a user/assistant message.
pub async fn get_by_message_id(
    pool: &SqlitePool,
    message_id: i64,
) -> Result<Option<LlmMessage>> {
    let row: Option<LlmMessageRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM llm_messages WHERE message_id = ? LIMIT 1"
    ))
    .bind(message_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to get LLM message: {e}")))?;

    row.map(LlmMessageRow::into_llm_message).transpose()
}

/// Lists a chat's mirror rows in creation order.
pub async fn list_llm_messages(pool: &SqlitePool, chat_id: i64) -> Result<Vec<LlmMessage>> {
    let rows: Vec<LlmMessageRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM llm_messages WHERE chat_id = ? ORDER BY created_at, id"
    ))
    .bind(chat_id)
    .fetch_all(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to list LLM messages: {e}")))?;

    rows.into_iter().map(LlmMessageRow::into_llm_message).collect()
}

/// Counts a chat's system-role mirror rows.
pub async fn count_system_messages(pool: &SqlitePool, chat_id: i64) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM llm_messages WHERE chat_id = ? AND role = 'system'",
    )
    .bind(chat_id)
    .fetch_one(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to count system messages: {e}")))?;

    Ok(count)
}

/// Replaces a mirror row's content.
pub async fn update_content(
    pool: &SqlitePool,
    id: i64,
    content: &LlmContent,
    is_edited: bool,
) -> Result<()> {
    sqlx::query("UPDATE llm_messages SET content = ?, is_edited = ? WHERE id = ?")
        .bind(encode_content(content)?)
        .bind(is_edited as i64)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| ChatDbError::persistence(format!("Failed to update LLM message: {e}")))?;

    Ok(())
}

/// Deletes all system-role rows for a chat.
pub async fn delete_system_messages(pool: &SqlitePool, chat_id: i64) -> Result<u64> {
    let result =
        sqlx::query("DELETE FROM llm_messages WHERE chat_id = ? AND role = 'system'")
            .bind(chat_id)
            .execute(pool)
            .await
            .map_err(|e| {
                ChatDbError::persistence(format!("Failed to delete system messages: {e}"))
            })?;

    Ok(result.rows_affected())
}

/// Deletes a chat's mirror rows, optionally retaining system rows.
pub async fn delete_chat_llm_messages(
    pool: &SqlitePool,
    chat_id: i64,
    dont_delete_system_messages: bool,
) -> Result<u64> {
    let sql = if dont_delete_system_messages {
        "DELETE FROM llm_messages WHERE chat_id = ? AND role != 'system'"
    } else {
        "DELETE FROM llm_messages WHERE chat_id = ?"
    };

    let result = sqlx::query(sql)
        .bind(chat_id)
        .execute(pool)
        .await
        .map_err(|e| ChatDbError::persistence(format!("Failed to delete LLM messages: {e}")))?;

    Ok(result.rows_affected())
}
