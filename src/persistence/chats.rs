//! Chat repository.
//!
//! Connection descriptors are sealed by the credential cipher before they
//! touch disk and opened on the way out; plaintext never rests.

use crate::config::ConnectionInfo;
use crate::error::{ChatDbError, Result};
use crate::model::{Chat, ChatSettings};
use crate::persistence::CredentialCipher;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

/// Raw database row for a chat.
#[derive(Debug, Clone, FromRow)]
struct ChatRow {
    id: i64,
    user_id: String,
    connection: String,
    selected_collections: String,
    auto_execute_query: i64,
    share_data_with_ai: i64,
    created_at: String,
    updated_at: String,
}

impl ChatRow {
    fn into_chat(self, cipher: &dyn CredentialCipher) -> Result<Chat> {
        let plaintext = cipher.open(&self.connection)?;
        let connection: ConnectionInfo = serde_json::from_str(&plaintext).map_err(|e| {
            ChatDbError::persistence(format!("Stored connection descriptor is invalid: {e}"))
        })?;

        Ok(Chat {
            id: self.id,
            user_id: self.user_id,
            connection,
            selected_collections: self.selected_collections,
            settings: ChatSettings {
                auto_execute_query: self.auto_execute_query != 0,
                share_data_with_ai: self.share_data_with_ai != 0,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn seal_connection(cipher: &dyn CredentialCipher, connection: &ConnectionInfo) -> Result<String> {
    let plaintext = serde_json::to_string(connection).map_err(|e| {
        ChatDbError::persistence(format!("Failed to serialize connection descriptor: {e}"))
    })?;
    cipher.seal(&plaintext)
}

const SELECT_COLUMNS: &str = "id, user_id, connection, selected_collections, \
     auto_execute_query, share_data_with_ai, created_at, updated_at";

/// Creates a new chat.
pub async fn create_chat(
    pool: &SqlitePool,
    cipher: &dyn CredentialCipher,
    user_id: &str,
    connection: &ConnectionInfo,
    selected_collections: &str,
    settings: ChatSettings,
) -> Result<Chat> {
    let sealed = seal_connection(cipher, connection)?;

    let result = sqlx::query(
        r#"
        INSERT INTO chats (user_id, connection, selected_collections, auto_execute_query, share_data_with_ai)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(&sealed)
    .bind(selected_collections)
    .bind(settings.auto_execute_query as i64)
    .bind(settings.share_data_with_ai as i64)
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to create chat: {e}")))?;

    get_chat(pool, cipher, result.last_insert_rowid())
        .await?
        .ok_or_else(|| ChatDbError::internal("Chat vanished after insert"))
}

/// Gets a chat by id.
pub async fn get_chat(
    pool: &SqlitePool,
    cipher: &dyn CredentialCipher,
    id: i64,
) -> Result<Option<Chat>> {
    let row: Option<ChatRow> =
        sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM chats WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| ChatDbError::persistence(format!("Failed to get chat: {e}")))?;

    row.map(|r| r.into_chat(cipher)).transpose()
}

/// Lists a user's chats, most recently updated first.
pub async fn list_chats(
    pool: &SqlitePool,
    cipher: &dyn CredentialCipher,
    user_id: &str,
) -> Result<Vec<Chat>> {
    let rows: Vec<ChatRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM chats WHERE user_id = ? ORDER BY updated_at DESC, id DESC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to list chats: {e}")))?;

    rows.into_iter().map(|r| r.into_chat(cipher)).collect()
}

/// Counts a user's chats.
pub async fn count_chats(pool: &SqlitePool, user_id: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chats WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .map_err(|e| ChatDbError::persistence(format!("Failed to count chats: {e}")))?;

    Ok(count)
}

/// Replaces the chat's connection descriptor.
///
/// `selected_collections` is reset to `""` because prior selections cannot
/// be assumed valid against the new database.
pub async fn update_chat_connection(
    pool: &SqlitePool,
    cipher: &dyn CredentialCipher,
    id: i64,
    connection: &ConnectionInfo,
) -> Result<()> {
    let sealed = seal_connection(cipher, connection)?;

    sqlx::query(
        r#"
        UPDATE chats
        SET connection = ?, selected_collections = '',
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
        WHERE id = ?
        "#,
    )
    .bind(&sealed)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to update connection: {e}")))?;

    Ok(())
}

/// Updates the chat's settings.
pub async fn update_chat_settings(
    pool: &SqlitePool,
    id: i64,
    settings: ChatSettings,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE chats
        SET auto_execute_query = ?, share_data_with_ai = ?,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
        WHERE id = ?
        "#,
    )
    .bind(settings.auto_execute_query as i64)
    .bind(settings.share_data_with_ai as i64)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to update settings: {e}")))?;

    Ok(())
}

/// Updates the chat's selected collections.
pub async fn update_selected_collections(
    pool: &SqlitePool,
    id: i64,
    selected_collections: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE chats
        SET selected_collections = ?,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
        WHERE id = ?
        "#,
    )
    .bind(selected_collections)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to update selection: {e}")))?;

    Ok(())
}

/// Bumps the chat's `updated_at`.
pub async fn touch_chat(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE chats SET updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| ChatDbError::persistence(format!("Failed to touch chat: {e}")))?;
    Ok(())
}

/// Deletes a chat. Messages and LLM messages cascade.
pub async fn delete_chat(pool: &SqlitePool, id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM chats WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| ChatDbError::persistence(format!("Failed to delete chat: {e}")))?;

    Ok(result.rows_affected())
}
