//! Schema context lifecycle: first-turn emission and selection refresh.

use super::common::{harness, wait_until};
use chatdb::chat::UpdateChatRequest;
use chatdb::db::{Column, MockDriver, Schema, Table};
use chatdb::llm::MockLlmClient;
use chatdb::model::{LlmContent, LlmRole};
use pretty_assertions::assert_eq;

fn schema(tables: &[&str]) -> Schema {
    Schema {
        tables: tables
            .iter()
            .map(|name| Table {
                name: name.to_string(),
                columns: vec![Column::new("id", "integer").nullable(false)],
                primary_key: vec!["id".to_string()],
                example_rows: vec![],
            })
            .collect(),
    }
}

async fn system_schema_text(h: &super::common::Harness, chat_id: i64) -> Option<String> {
    let history = h.store.llm_history(chat_id, i64::MAX).await.unwrap();
    history.iter().find_map(|row| match (&row.role, &row.content) {
        (LlmRole::System, LlmContent::System { schema_update }) => Some(schema_update.clone()),
        _ => None,
    })
}

/// The first turn on a chat fetches the schema and stores exactly one
/// system-role mirror row that the LLM request then includes.
#[tokio::test]
async fn test_first_turn_emits_schema_context() {
    let driver = MockDriver::new().with_schema(schema(&["users", "orders"]));
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(true).await;

    assert_eq!(h.store.count_system_messages(chat.id).await.unwrap(), 0);

    h.orchestrator
        .create_message("u1", chat.id, "s1", "show 5 latest users")
        .await
        .unwrap();

    assert_eq!(h.store.count_system_messages(chat.id).await.unwrap(), 1);
    let text = system_schema_text(&h, chat.id).await.unwrap();
    assert!(text.contains("Table: users"));

    // The provider request carried the schema as a system message.
    let requests = h.llm.captured_requests();
    assert!(requests[0]
        .iter()
        .any(|m| m.content.contains("Table: users")));
}

/// Scenario: schema refresh on selection change (S5).
/// Updating selectedCollections triggers a detached refresh that replaces
/// the single system row with a projection of the named tables.
#[tokio::test]
async fn test_selection_change_triggers_background_refresh() {
    let driver = MockDriver::new().with_schema(schema(&["users", "orders", "payments"]));
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    // Prior schema context from an earlier turn.
    h.store
        .replace_system_message(chat.id, "stale schema text")
        .await
        .unwrap();

    let updated = h
        .orchestrator
        .update_chat(
            "u1",
            chat.id,
            UpdateChatRequest {
                selected_collections: Some("users,orders".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.selected_collections, "users,orders");

    wait_until(|| async {
        system_schema_text(&h, chat.id)
            .await
            .map(|text| text.contains("Table: users"))
            .unwrap_or(false)
    })
    .await;

    // Law 5: still exactly one system row.
    assert_eq!(h.store.count_system_messages(chat.id).await.unwrap(), 1);

    let text = system_schema_text(&h, chat.id).await.unwrap();
    assert!(text.contains("Table: users"));
    assert!(text.contains("Table: orders"));
    assert!(!text.contains("Table: payments"));
    assert!(!text.contains("stale schema text"));
}

/// An unchanged selection does not spawn a refresh.
#[tokio::test]
async fn test_same_selection_is_inert() {
    let driver = MockDriver::new().with_schema(schema(&["users"]));
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    h.store
        .replace_system_message(chat.id, "existing text")
        .await
        .unwrap();

    h.orchestrator
        .update_chat(
            "u1",
            chat.id,
            UpdateChatRequest {
                selected_collections: Some("ALL".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(
        system_schema_text(&h, chat.id).await.unwrap(),
        "existing text"
    );
}

/// A credential change force-disconnects and resets the selection.
#[tokio::test]
async fn test_credential_change_resets_selection() {
    let driver = MockDriver::new().with_schema(schema(&["users"]));
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    h.orchestrator.connect_db("u1", chat.id, "s1").await.unwrap();
    h.orchestrator
        .update_chat(
            "u1",
            chat.id,
            UpdateChatRequest {
                selected_collections: Some("users".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut new_connection = super::common::connection_info();
    new_connection.database = "other_db".to_string();

    let updated = h
        .orchestrator
        .update_chat(
            "u1",
            chat.id,
            UpdateChatRequest {
                connection: Some(new_connection),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.selected_collections, "");
    assert_eq!(updated.connection.database, "other_db");
    assert!(!h.manager.is_connected(chat.id).await);
}

/// Chat deletion purges messages and every mirror row, system included.
#[tokio::test]
async fn test_chat_delete_cascades() {
    let driver = MockDriver::new().with_schema(schema(&["users"]));
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(true).await;

    h.orchestrator
        .create_message("u1", chat.id, "s1", "show users")
        .await
        .unwrap();
    assert!(!h.store.list_messages(chat.id).await.unwrap().is_empty());

    h.orchestrator.delete_chat("u1", chat.id).await.unwrap();

    assert!(h.store.list_messages(chat.id).await.unwrap().is_empty());
    assert_eq!(h.store.count_system_messages(chat.id).await.unwrap(), 0);
    assert!(h.store.get_chat(chat.id).await.is_err());
}
