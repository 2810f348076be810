//! Configuration management for chatdb.
//!
//! Loads configuration from a TOML file with environment-variable overrides.
//! Covers the service surface (port, CORS), the state store, the LLM
//! providers, the credential-sealing key, and operational limits.

use crate::db::DatabaseType;
use crate::error::{ChatDbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Literal default admin credentials that must never survive into a running
/// process.
const DEFAULT_ADMIN_USERNAME: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "admin";

/// Trial-mode chat cap applied when `max_chats_per_user` is 0.
pub const TRIAL_CHAT_CAP: i64 = 2;

/// Main configuration structure for chatdb.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Service settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// State-database settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Admin bootstrap account.
    #[serde(default)]
    pub admin: AdminConfig,

    /// LLM provider selection and per-provider settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Operational limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Optional example-database descriptor for development chats.
    #[serde(default)]
    pub example_db: Option<ConnectionInfo>,
}

/// Service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the embedding HTTP service listens on.
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Allowed CORS origin for the embedding HTTP service.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

fn default_server_port() -> u16 {
    8080
}

fn default_cors_origin() -> String {
    "http://localhost:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            cors_origin: default_cors_origin(),
        }
    }
}

/// State-database settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Path to the state database. Defaults to the platform config dir.
    pub path: Option<PathBuf>,

    /// Key used to seal stored connection credentials (32 bytes).
    #[serde(default)]
    pub credential_key: String,
}

/// Log output settings.
///
/// The service logs to stderr unless a file is configured; `RUST_LOG`
/// overrides `level` either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Append-mode log file. Unset means stderr.
    pub file: Option<PathBuf>,

    /// Default filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: default_log_level(),
        }
    }
}

/// Admin bootstrap account. Refused when left at the literal defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// LLM provider selection and per-provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Default provider: "openai" or "gemini".
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Per-provider settings keyed by provider name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "openai".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            providers: HashMap::new(),
        }
    }
}

/// Settings for one LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// API key for authentication.
    #[serde(default)]
    pub api_key: String,
    /// Model name (e.g. "gpt-4o", "gemini-2.0-flash").
    #[serde(default)]
    pub model: String,
    /// Completion-token ceiling per request.
    #[serde(default = "default_max_completion_tokens")]
    pub max_completion_tokens: u32,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_max_completion_tokens() -> u32 {
    4096
}

fn default_temperature() -> f64 {
    0.2
}

/// Operational limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum chats a user may hold. 0 means trial mode (cap of 2).
    #[serde(default)]
    pub max_chats_per_user: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_chats_per_user: 0,
        }
    }
}

impl LimitsConfig {
    /// Returns the effective chat cap, resolving trial mode.
    pub fn effective_chat_cap(&self) -> i64 {
        if self.max_chats_per_user <= 0 {
            TRIAL_CHAT_CAP
        } else {
            self.max_chats_per_user
        }
    }
}

/// Database connection descriptor.
///
/// At rest the whole descriptor is sealed by the credential cipher; the
/// plaintext form below exists only within request scope.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Target engine.
    #[serde(rename = "type")]
    pub db_type: DatabaseType,

    /// Database host.
    pub host: String,

    /// Database port. Defaults per engine when absent.
    pub port: Option<u16>,

    /// Database user.
    pub username: Option<String>,

    /// Database password.
    pub password: Option<String>,

    /// Database name.
    pub database: String,

    /// Whether to negotiate TLS.
    #[serde(default, rename = "useSSL")]
    pub use_ssl: bool,

    /// Driver-specific SSL mode (e.g. "require", "verify-full").
    pub ssl_mode: Option<String>,

    /// URLs for client certificate material, fetched at connect time.
    #[serde(rename = "sslCertURL")]
    pub ssl_cert_url: Option<String>,
    #[serde(rename = "sslKeyURL")]
    pub ssl_key_url: Option<String>,
    #[serde(rename = "sslRootCertURL")]
    pub ssl_root_cert_url: Option<String>,

    /// Marks the development example database.
    #[serde(default, rename = "isExampleDB")]
    pub is_example_db: bool,
}

impl ConnectionInfo {
    /// Returns the effective port, applying the engine default when unset.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.db_type.default_port())
    }

    /// Returns a display-safe string (no password) for logs.
    pub fn display_string(&self) -> String {
        format!(
            "{} @ {}:{}/{}",
            self.db_type.as_str(),
            self.host,
            self.effective_port(),
            self.database
        )
    }
}

/// Validates a URI used for certificate material.
pub fn is_valid_uri(uri: &str) -> bool {
    match Url::parse(uri) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

/// Reads an environment variable, falling back to the default when unset.
pub fn get_env_with_default(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Reads an integer environment variable, falling back on parse failure.
pub fn get_int_env_with_default(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Reads a float environment variable, falling back on parse failure.
pub fn get_float_env_with_default(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatdb")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file, then applies env overrides.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| ChatDbError::config(format!("Failed to read config file: {e}")))?;
            Self::parse_toml(&content, path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            ChatDbError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Applies environment variables over the file-sourced values.
    pub fn apply_env_overrides(&mut self) {
        self.server.port = get_int_env_with_default("CHATDB_PORT", self.server.port as i64) as u16;
        self.server.cors_origin =
            get_env_with_default("CHATDB_CORS_ORIGIN", &self.server.cors_origin);

        if let Ok(path) = std::env::var("CHATDB_STATE_DB") {
            self.storage.path = Some(PathBuf::from(path));
        }
        self.storage.credential_key =
            get_env_with_default("CHATDB_CREDENTIAL_KEY", &self.storage.credential_key);

        if let Ok(path) = std::env::var("CHATDB_LOG_FILE") {
            self.logging.file = Some(PathBuf::from(path));
        }
        self.logging.level = get_env_with_default("CHATDB_LOG_LEVEL", &self.logging.level);

        self.admin.username = get_env_with_default("CHATDB_ADMIN_USERNAME", &self.admin.username);
        self.admin.password = get_env_with_default("CHATDB_ADMIN_PASSWORD", &self.admin.password);

        self.llm.default_provider =
            get_env_with_default("CHATDB_LLM_PROVIDER", &self.llm.default_provider);

        for (name, provider) in self.llm.providers.iter_mut() {
            let prefix = format!("CHATDB_{}_", name.to_uppercase());
            provider.api_key = get_env_with_default(&format!("{prefix}API_KEY"), &provider.api_key);
            provider.model = get_env_with_default(&format!("{prefix}MODEL"), &provider.model);
            provider.temperature =
                get_float_env_with_default(&format!("{prefix}TEMPERATURE"), provider.temperature);
            provider.max_completion_tokens = get_int_env_with_default(
                &format!("{prefix}MAX_COMPLETION_TOKENS"),
                provider.max_completion_tokens as i64,
            ) as u32;
        }

        self.limits.max_chats_per_user =
            get_int_env_with_default("MAX_CHATS_PER_USER", self.limits.max_chats_per_user);
    }

    /// Validates the loaded configuration.
    ///
    /// Refuses the literal default admin credentials and requires a 32-byte
    /// credential key when one is configured.
    pub fn validate(&self) -> Result<()> {
        if self.admin.username == DEFAULT_ADMIN_USERNAME
            && self.admin.password == DEFAULT_ADMIN_PASSWORD
        {
            return Err(ChatDbError::config(
                "Admin credentials are set to the literal defaults; refusing to start",
            ));
        }

        if !self.storage.credential_key.is_empty() && self.storage.credential_key.len() != 32 {
            return Err(ChatDbError::config(format!(
                "Credential key must be exactly 32 bytes, got {}",
                self.storage.credential_key.len()
            )));
        }

        if let Some(example) = &self.example_db {
            if example.host.is_empty() || example.database.is_empty() {
                return Err(ChatDbError::config(
                    "Example database requires host and database",
                ));
            }
        }

        Ok(())
    }

    /// Gets the settings for a named provider.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.llm.providers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
[server]
port = 9090
cors_origin = "https://app.example.com"

[storage]
credential_key = "0123456789abcdef0123456789abcdef"

[admin]
username = "ops"
password = "s3cret"

[llm]
default_provider = "gemini"

[llm.providers.openai]
api_key = "sk-test"
model = "gpt-4o"
temperature = 0.1

[llm.providers.gemini]
api_key = "g-test"
model = "gemini-2.0-flash"

[limits]
max_chats_per_user = 10
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.llm.default_provider, "gemini");
        assert_eq!(config.provider("openai").unwrap().model, "gpt-4o");
        assert_eq!(config.provider("gemini").unwrap().api_key, "g-test");
        assert_eq!(config.limits.max_chats_per_user, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_logging_section() {
        let config = Config::default();
        assert!(config.logging.file.is_none());
        assert_eq!(config.logging.level, "info");

        let toml = r#"
[logging]
file = "/var/log/chatdb/service.log"
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.logging.file.as_deref(),
            Some(std::path::Path::new("/var/log/chatdb/service.log"))
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_default_admin_credentials_refused() {
        let config = Config {
            admin: AdminConfig {
                username: "admin".to_string(),
                password: "admin".to_string(),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credential_key_length_enforced() {
        let config = Config {
            storage: StorageConfig {
                path: None,
                credential_key: "short".to_string(),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trial_chat_cap() {
        let limits = LimitsConfig {
            max_chats_per_user: 0,
        };
        assert_eq!(limits.effective_chat_cap(), TRIAL_CHAT_CAP);

        let limits = LimitsConfig {
            max_chats_per_user: 25,
        };
        assert_eq!(limits.effective_chat_cap(), 25);
    }

    #[test]
    fn test_float_env_parses_value() {
        std::env::set_var("CHATDB_TEST_TEMP", "0.75");
        assert_eq!(get_float_env_with_default("CHATDB_TEST_TEMP", 0.2), 0.75);
        std::env::remove_var("CHATDB_TEST_TEMP");
    }

    #[test]
    fn test_float_env_falls_back_on_garbage() {
        std::env::set_var("CHATDB_TEST_TEMP_BAD", "warm");
        assert_eq!(
            get_float_env_with_default("CHATDB_TEST_TEMP_BAD", 0.2),
            0.2
        );
        std::env::remove_var("CHATDB_TEST_TEMP_BAD");
    }

    #[test]
    fn test_is_valid_uri() {
        assert!(is_valid_uri("https://certs.example.com/client.pem"));
        assert!(is_valid_uri("http://localhost:8080/ca.crt"));
        assert!(!is_valid_uri("ftp://example.com/file"));
        assert!(!is_valid_uri("not a uri at all"));
        assert!(!is_valid_uri("0123456789A"));
    }

    #[test]
    fn test_connection_info_effective_port() {
        let info = ConnectionInfo {
            db_type: DatabaseType::Postgres,
            host: "localhost".to_string(),
            database: "app".to_string(),
            ..Default::default()
        };
        assert_eq!(info.effective_port(), 5432);

        let info = ConnectionInfo {
            port: Some(15432),
            ..info
        };
        assert_eq!(info.effective_port(), 15432);
    }

    #[test]
    fn test_connection_info_display_omits_password() {
        let info = ConnectionInfo {
            db_type: DatabaseType::MySql,
            host: "db.internal".to_string(),
            database: "shop".to_string(),
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let display = info.display_string();
        assert!(display.contains("db.internal"));
        assert!(!display.contains("hunter2"));
    }

    #[test]
    fn test_connection_info_wire_shape() {
        let json = r#"{
            "type": "postgres",
            "host": "localhost",
            "database": "app",
            "useSSL": true,
            "sslMode": "require",
            "isExampleDB": false
        }"#;
        let info: ConnectionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.db_type, DatabaseType::Postgres);
        assert!(info.use_ssl);
        assert_eq!(info.ssl_mode.as_deref(), Some("require"));
    }
}
