//! Schema versioning and migrations for the state database.
//!
//! Forward-only migrations recorded in a `schema_versions` table.

use crate::error::{ChatDbError, Result};
use sqlx::sqlite::SqlitePool;
use tracing::info;

const CURRENT_VERSION: i32 = 1;

/// Runs all pending migrations on the database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    ensure_schema_versions_table(pool).await?;

    let current = get_current_version(pool).await?;

    if current > CURRENT_VERSION {
        return Err(ChatDbError::persistence(format!(
            "Database schema version ({}) is newer than supported version ({}). \
             Please upgrade chatdb to the latest version.",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        info!(
            "Migrating state database from version {} to {}",
            current, CURRENT_VERSION
        );
        run_pending_migrations(pool, current).await?;
    }

    Ok(())
}

/// Ensures the schema_versions table exists.
async fn ensure_schema_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        ChatDbError::persistence(format!("Failed to create schema_versions table: {e}"))
    })?;

    Ok(())
}

/// Gets the current schema version.
async fn get_current_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM schema_versions")
        .fetch_optional(pool)
        .await
        .map_err(|e| ChatDbError::persistence(format!("Failed to get schema version: {e}")))?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Runs migrations from the current version to the target version.
async fn run_pending_migrations(pool: &SqlitePool, from_version: i32) -> Result<()> {
    for version in (from_version + 1)..=CURRENT_VERSION {
        run_migration(pool, version).await?;
        record_version(pool, version).await?;
        info!("Applied migration v{}", version);
    }
    Ok(())
}

/// Records a completed migration version.
async fn record_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO schema_versions (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(|e| ChatDbError::persistence(format!("Failed to record migration: {e}")))?;
    Ok(())
}

/// Runs a specific migration version.
async fn run_migration(pool: &SqlitePool, version: i32) -> Result<()> {
    match version {
        1 => migration_v1(pool).await,
        _ => Err(ChatDbError::persistence(format!(
            "Unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: chats, messages, and the LLM-visible mirror.
async fn migration_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            connection TEXT NOT NULL,
            selected_collections TEXT NOT NULL DEFAULT '',
            auto_execute_query INTEGER NOT NULL DEFAULT 0,
            share_data_with_ai INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to create chats table: {e}")))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id)")
        .execute(pool)
        .await
        .map_err(|e| ChatDbError::persistence(format!("Failed to create chats index: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id INTEGER NOT NULL,
            user_id TEXT NOT NULL,
            message_type TEXT NOT NULL CHECK (message_type IN ('user', 'assistant', 'system')),
            content TEXT NOT NULL,
            is_edited INTEGER NOT NULL DEFAULT 0,
            user_message_id INTEGER,
            queries TEXT,
            action_buttons TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to create messages table: {e}")))?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_chat
        ON messages(chat_id, created_at)
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to create messages index: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS llm_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id INTEGER NOT NULL,
            message_id INTEGER,
            role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
            content TEXT NOT NULL,
            is_edited INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
            FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| ChatDbError::persistence(format!("Failed to create llm_messages table: {e}")))?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_llm_messages_chat
        ON llm_messages(chat_id, created_at)
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        ChatDbError::persistence(format!("Failed to create llm_messages index: {e}"))
    })?;

    Ok(())
}
