//! Shared harness for the integration tests.

use chatdb::chat::ChatOrchestrator;
use chatdb::config::{ConnectionInfo, LimitsConfig};
use chatdb::connection::ConnectionManager;
use chatdb::db::{DatabaseType, MockDriver};
use chatdb::executor::{CancelRegistry, QueryExecutor};
use chatdb::llm::{LlmGateway, LlmProvider, MockLlmClient};
use chatdb::model::{Chat, ChatSettings, Message};
use chatdb::persistence::{Base64Cipher, StateDb};
use chatdb::schema_cache::SchemaCache;
use chatdb::store::MessageStore;
use chatdb::stream::{Envelope, StreamHub, StreamKey};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Harness {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub store: Arc<MessageStore>,
    pub hub: Arc<StreamHub>,
    pub manager: Arc<ConnectionManager>,
    pub driver: MockDriver,
    pub llm: Arc<MockLlmClient>,
}

pub fn connection_info() -> ConnectionInfo {
    ConnectionInfo {
        db_type: DatabaseType::Postgres,
        host: "localhost".to_string(),
        database: "app".to_string(),
        ..Default::default()
    }
}

/// Builds a full core with the given mocks.
pub async fn harness(driver: MockDriver, llm: MockLlmClient) -> Harness {
    let hub = Arc::new(StreamHub::new());
    let manager = Arc::new(ConnectionManager::new(Arc::clone(&hub)));
    manager.register_driver(Arc::new(driver.clone())).await;

    let db = StateDb::open_in_memory(Arc::new(Base64Cipher::default()))
        .await
        .unwrap();
    let store = Arc::new(MessageStore::new(Arc::new(db)));
    let schema_cache = Arc::new(SchemaCache::new(Arc::clone(&manager), Arc::clone(&store)));
    let executor = Arc::new(QueryExecutor::new(
        Arc::clone(&manager),
        Arc::new(CancelRegistry::new()),
    ));

    let llm = Arc::new(llm);
    let client: Arc<dyn chatdb::llm::LlmClient> = Arc::clone(&llm) as Arc<dyn chatdb::llm::LlmClient>;
    let gateway = Arc::new(LlmGateway::new(LlmProvider::Mock).with_client(LlmProvider::Mock, client));

    let orchestrator = Arc::new(ChatOrchestrator::new(
        Arc::clone(&hub),
        Arc::clone(&manager),
        schema_cache,
        executor,
        gateway,
        Arc::clone(&store),
        LimitsConfig {
            max_chats_per_user: 10,
        },
    ));

    Harness {
        orchestrator,
        store,
        hub,
        manager,
        driver,
        llm,
    }
}

impl Harness {
    /// Creates a chat for `u1` with the given settings.
    pub async fn chat(&self, auto_execute: bool) -> Chat {
        self.orchestrator
            .create_chat(
                "u1",
                &connection_info(),
                "ALL",
                ChatSettings {
                    auto_execute_query: auto_execute,
                    share_data_with_ai: false,
                },
            )
            .await
            .unwrap()
    }

    /// Opens the stream channel the orchestrator will emit into.
    pub async fn open_stream(&self, chat: &Chat, stream_id: &str) -> mpsc::Receiver<Envelope> {
        self.hub
            .open(StreamKey::new(&chat.user_id, chat.id, stream_id))
            .await
    }

    /// Persists a review-path plan directly (no LLM turn involved).
    pub async fn plant_plan(&self, chat: &Chat, raw: serde_json::Value) -> (Message, Message) {
        let user = self
            .store
            .create_user_message(chat, "planted")
            .await
            .unwrap();
        let plan = serde_json::from_value(raw.clone()).unwrap();
        let assistant = self
            .store
            .create_assistant_message(chat, user.id, &plan, &raw)
            .await
            .unwrap();
        (user, assistant)
    }
}

/// Drains every buffered event from a stream receiver.
pub async fn drain_events(rx: &mut mpsc::Receiver<Envelope>) -> Vec<Envelope> {
    // Let any in-flight emitters finish their sends.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope);
    }
    events
}

/// Polls until `predicate` passes or the deadline expires.
pub async fn wait_until<F, Fut>(mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("condition not reached within deadline");
}
