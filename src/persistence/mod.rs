//! Persistence layer for chatdb.
//!
//! SQLite-backed repositories for chats, messages, and the LLM-visible
//! mirror. This realizes the repository seam the orchestrator programs
//! against; timestamps are stamped here, on write, as UTC RFC 3339 text.

pub mod chats;
pub mod llm_messages;
pub mod messages;
mod migrations;
mod secrets;

pub use secrets::{Base64Cipher, CredentialCipher};

use crate::error::{ChatDbError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Boot attempts before the database file is declared unusable. The final
/// attempt runs against a fresh file, with the unusable one sidelined.
const OPEN_ATTEMPTS: u32 = 4;

/// Linear backoff step between boot attempts (lock contention from a
/// sibling process drains within a few of these).
const OPEN_BACKOFF: Duration = Duration::from_millis(150);

/// Main persistence interface for the state database.
pub struct StateDb {
    pool: SqlitePool,
    db_path: PathBuf,
    cipher: Arc<dyn CredentialCipher>,
}

impl StateDb {
    /// Opens or creates the state database at the default platform path.
    pub async fn open_default(cipher: Arc<dyn CredentialCipher>) -> Result<Self> {
        let path = Self::default_path()?;
        Self::open(&path, cipher).await
    }

    /// Opens or creates the state database at the specified path.
    ///
    /// Boot failures are retried with a linear backoff; when they persist,
    /// the file is assumed corrupted, sidelined to `<name>.corrupt`, and
    /// one last boot runs against a fresh database so the service comes up
    /// rather than crash-looping on unreadable state.
    pub async fn open(path: &PathBuf, cipher: Arc<dyn CredentialCipher>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ChatDbError::persistence(format!(
                    "Failed to create state directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let mut sidelined = false;
        for attempt in 1u32.. {
            match Self::boot(path).await {
                Ok(pool) => {
                    info!("State database opened at {}", path.display());
                    return Ok(Self {
                        pool,
                        db_path: path.clone(),
                        cipher: Arc::clone(&cipher),
                    });
                }
                Err(e) if attempt < OPEN_ATTEMPTS => {
                    warn!("State database boot attempt {attempt} failed: {e}");
                    tokio::time::sleep(OPEN_BACKOFF * attempt).await;
                }
                Err(e) if !sidelined && path.exists() => {
                    let graveyard = path.with_extension("db.corrupt");
                    std::fs::rename(path, &graveyard).map_err(|rename_err| {
                        ChatDbError::persistence(format!(
                            "State database is unusable ({e}) and could not be sidelined: {rename_err}"
                        ))
                    })?;
                    warn!(
                        "State database is unusable ({e}); sidelined to {}",
                        graveyard.display()
                    );
                    sidelined = true;
                }
                Err(e) => {
                    return Err(ChatDbError::persistence(format!(
                        "Failed to open state database at {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        unreachable!("open loop exits via return");
    }

    /// Opens an in-memory state database (tests).
    pub async fn open_in_memory(cipher: Arc<dyn CredentialCipher>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ChatDbError::persistence(format!("Invalid database path: {e}")))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| ChatDbError::persistence(format!("Failed to open in-memory db: {e}")))?;
        migrations::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            db_path: PathBuf::from(":memory:"),
            cipher,
        })
    }

    /// Returns the default state database path for the current platform.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ChatDbError::persistence("Could not determine config directory"))?;
        Ok(config_dir.join("chatdb").join("state.db"))
    }

    /// One boot: pool the file and bring the schema current. The pool is
    /// torn down again on a migration failure so a later sideline can
    /// rename the file.
    async fn boot(path: &PathBuf) -> Result<SqlitePool> {
        let conn_str = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&conn_str)
            .map_err(|e| ChatDbError::persistence(format!("Invalid database path: {e}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                ChatDbError::persistence(format!("Failed to connect to state database: {e}"))
            })?;

        if let Err(e) = migrations::run_migrations(&pool).await {
            pool.close().await;
            return Err(e);
        }

        Ok(pool)
    }

    /// Returns the path to the state database.
    pub fn path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the credential cipher.
    pub fn cipher(&self) -> &Arc<dyn CredentialCipher> {
        &self.cipher
    }

    /// Closes the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
