//! chatdb service bootstrap.
//!
//! Explicit dependency injection at process startup: construct the hub,
//! manager, schema cache, executor, and gateway, and hand them to the
//! orchestrator. The HTTP transport embeds this state; the core itself is
//! transport-agnostic.

mod chat;
mod config;
mod connection;
mod db;
mod error;
mod executor;
mod llm;
mod logging;
mod model;
mod persistence;
mod schema_cache;
mod store;
mod stream;

use crate::chat::ChatOrchestrator;
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::db::PostgresDriver;
use crate::executor::{CancelRegistry, QueryExecutor};
use crate::llm::{GeminiClient, GeminiConfig, LlmGateway, LlmProvider, OpenAiClient, OpenAiConfig};
use crate::persistence::{Base64Cipher, StateDb};
use crate::schema_cache::SchemaCache;
use crate::store::MessageStore;
use crate::stream::StreamHub;
use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Load .env before anything reads the environment.
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Configuration decides where logs go, so it loads first; failures
    // here can only be reported on stderr.
    let config = match Config::load_from_file(&Config::default_path()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    logging::init(&config.logging);

    if let Err(e) = run(config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate().context("validating configuration")?;

    let db = match &config.storage.path {
        Some(path) => StateDb::open(path, Arc::new(Base64Cipher::default())).await?,
        None => StateDb::open_default(Arc::new(Base64Cipher::default())).await?,
    };

    let hub = Arc::new(StreamHub::new());
    let manager = Arc::new(ConnectionManager::new(Arc::clone(&hub)));
    manager.register_driver(Arc::new(PostgresDriver::new())).await;
    manager
        .register_driver(Arc::new(PostgresDriver::yugabyte()))
        .await;

    let store = Arc::new(MessageStore::new(Arc::new(db)));
    let schema_cache = Arc::new(SchemaCache::new(Arc::clone(&manager), Arc::clone(&store)));
    let executor = Arc::new(QueryExecutor::new(
        Arc::clone(&manager),
        Arc::new(CancelRegistry::new()),
    ));

    let gateway = Arc::new(build_gateway(&config)?);
    info!(
        provider = %gateway.default_provider(),
        "LLM gateway ready"
    );

    let orchestrator = Arc::new(ChatOrchestrator::new(
        hub,
        manager,
        schema_cache,
        executor,
        gateway,
        Arc::clone(&store),
        config.limits.clone(),
    ));

    info!(
        port = config.server.port,
        state_db = %store.state().path().display(),
        "chatdb core ready; waiting for shutdown signal"
    );

    // The transport layer drives `orchestrator`; standalone, park until
    // interrupted.
    let _orchestrator = orchestrator;
    tokio::signal::ctrl_c()
        .await
        .context("installing the shutdown signal handler")?;
    info!("shutting down");

    Ok(())
}

fn build_gateway(config: &Config) -> crate::error::Result<LlmGateway> {
    let default_provider = LlmProvider::parse(&config.llm.default_provider).ok_or_else(|| {
        error::ChatDbError::config(format!(
            "Unknown LLM provider: {}",
            config.llm.default_provider
        ))
    })?;

    let mut gateway = LlmGateway::new(default_provider);

    if let Some(provider) = config.provider("openai") {
        if !provider.api_key.is_empty() {
            let client = OpenAiClient::new(
                OpenAiConfig::new(&provider.api_key, &provider.model)
                    .with_temperature(provider.temperature)
                    .with_max_completion_tokens(provider.max_completion_tokens),
            )?;
            gateway = gateway.with_client(LlmProvider::OpenAi, Arc::new(client));
        }
    }

    if let Some(provider) = config.provider("gemini") {
        if !provider.api_key.is_empty() {
            let client = GeminiClient::new(
                GeminiConfig::new(&provider.api_key, &provider.model)
                    .with_temperature(provider.temperature)
                    .with_max_output_tokens(provider.max_completion_tokens),
            )?;
            gateway = gateway.with_client(LlmProvider::Gemini, Arc::new(client));
        }
    }

    Ok(gateway)
}
