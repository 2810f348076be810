//! End-to-end turns through the orchestrator.

use super::common::{drain_events, harness};
use chatdb::db::MockDriver;
use chatdb::llm::MockLlmClient;
use chatdb::model::{LlmContent, MessageType};
use chatdb::stream::EventKind;
use pretty_assertions::assert_eq;
use serde_json::json;

/// Scenario: auto-execute SELECT (S1).
/// Given a PostgreSQL chat with autoExecuteQuery on
/// When the user asks for the latest users
/// Then one user and one assistant message are persisted,
///  the query is executed with no pagination total,
///  and the stream carries at least two steps before one ai-response.
#[tokio::test]
async fn test_auto_execute_select_turn() {
    let h = harness(MockDriver::new(), MockLlmClient::new()).await;
    let chat = h.chat(true).await;
    let mut rx = h.open_stream(&chat, "s1").await;

    let outcome = h
        .orchestrator
        .create_message("u1", chat.id, "s1", "show 5 latest users")
        .await
        .unwrap();

    let assistant = outcome.assistant_message.unwrap();
    let query = &assistant.queries.as_ref().unwrap()[0];
    assert!(query.is_executed);
    assert!(query.error.is_none());
    assert_eq!(query.pagination.total_records_count, None);

    let messages = h.store.list_messages(chat.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].message_type, MessageType::User);
    assert_eq!(messages[1].message_type, MessageType::Assistant);
    assert_eq!(messages[1].user_message_id, Some(messages[0].id));
    assert_eq!(messages[1].chat_id, messages[0].chat_id);

    let events = drain_events(&mut rx).await;
    let steps = events
        .iter()
        .filter(|e| e.event == EventKind::AiResponseStep)
        .count();
    assert!(steps >= 2, "expected at least two step events, got {steps}");
    assert_eq!(events.last().unwrap().event, EventKind::AiResponse);
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event == EventKind::AiResponse)
            .count(),
        1
    );
}

/// Scenario: review path delivers the assistant over the stream.
#[tokio::test]
async fn test_review_path_answers_in_background() {
    let h = harness(MockDriver::new(), MockLlmClient::new()).await;
    let chat = h.chat(false).await;
    let mut rx = h.open_stream(&chat, "s1").await;

    let outcome = h
        .orchestrator
        .create_message("u1", chat.id, "s1", "show users")
        .await
        .unwrap();
    assert!(outcome.assistant_message.is_none());

    super::common::wait_until(|| async {
        h.store.list_messages(chat.id).await.unwrap().len() == 2
    })
    .await;

    let events = drain_events(&mut rx).await;
    assert_eq!(events.last().unwrap().event, EventKind::AiResponse);

    // The proposed query awaits explicit execution.
    let messages = h.store.list_messages(chat.id).await.unwrap();
    assert!(!messages[1].queries.as_ref().unwrap()[0].is_executed);
}

/// Scenario: LLM validation failure (boundary 13).
/// Given a provider answering prose instead of JSON
/// Then no assistant message is persisted and ai-response-error is
/// emitted exactly once.
#[tokio::test]
async fn test_invalid_llm_response_persists_nothing() {
    let llm = MockLlmClient::new().with_response("users", "I would rather chat about the weather.");
    let h = harness(MockDriver::new(), llm).await;
    let chat = h.chat(false).await;
    let mut rx = h.open_stream(&chat, "s1").await;

    h.orchestrator
        .create_message("u1", chat.id, "s1", "show users")
        .await
        .unwrap();

    // The background turn fails fast; give it time to emit.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let events = drain_events(&mut rx).await;
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event == EventKind::AiResponseError)
            .count(),
        1
    );
    assert!(!events.iter().any(|e| e.event == EventKind::AiResponse));

    // Only the user message survived.
    let messages = h.store.list_messages(chat.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::User);
}

/// Scenario: edit before execute (S6).
/// The Message view shows the new text, the LLM view carries the marker
/// exactly once, and the subsequent execute runs the new text.
#[tokio::test]
async fn test_edit_then_execute_uses_new_text() {
    let h = harness(MockDriver::new(), MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    let (_, assistant) = h
        .plant_plan(
            &chat,
            json!({
                "assistantMessage": "plan",
                "queries": [{
                    "query": "SELECT * FROM users",
                    "queryType": "SELECT",
                    "explanation": "all users"
                }]
            }),
        )
        .await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    let edited = h
        .orchestrator
        .edit_query(
            "u1",
            chat.id,
            assistant.id,
            &query_id,
            "SELECT id, email FROM users",
        )
        .await
        .unwrap();
    assert!(edited.query.is_edited);

    // LLM view: marker appears exactly once.
    let mirror = h.store.get_mirror(assistant.id).await.unwrap().unwrap();
    let LlmContent::Assistant { assistant_response } = mirror.content else {
        panic!("expected assistant mirror");
    };
    let mirrored = assistant_response["queries"][0]["query"].as_str().unwrap();
    assert_eq!(mirrored, "EDITED by user: SELECT id, email FROM users");
    assert_eq!(mirrored.matches("EDITED by user: ").count(), 1);

    // Execute picks up the edited text, and the mirror patch still finds
    // the entry by stripping the marker.
    let outcome = h
        .orchestrator
        .execute_query(chatdb::chat::ExecuteQueryRequest {
            user_id: "u1".to_string(),
            chat_id: chat.id,
            message_id: assistant.id,
            query_id: query_id.clone(),
            stream_id: "s1".to_string(),
            offset: 0,
        })
        .await
        .unwrap();
    assert!(outcome.query.is_executed);
    assert!(h
        .driver
        .executed_queries()
        .contains(&"SELECT id, email FROM users".to_string()));

    let mirror = h.store.get_mirror(assistant.id).await.unwrap().unwrap();
    let LlmContent::Assistant { assistant_response } = mirror.content else {
        panic!("expected assistant mirror");
    };
    assert_eq!(assistant_response["queries"][0]["isExecuted"], json!(true));
}

/// Scenario: editing the user message resets the reply in place.
/// The follow-up turn reuses the assistant message id and the per-query
/// execution state is cleared first.
#[tokio::test]
async fn test_update_message_reuses_assistant_row() {
    let h = harness(MockDriver::new(), MockLlmClient::new()).await;
    let chat = h.chat(true).await;

    let outcome = h
        .orchestrator
        .create_message("u1", chat.id, "s1", "show 5 latest users")
        .await
        .unwrap();
    let first_assistant = outcome.assistant_message.unwrap();
    assert!(first_assistant.queries.as_ref().unwrap()[0].is_executed);

    let updated = h
        .orchestrator
        .update_message(
            "u1",
            chat.id,
            outcome.user_message.id,
            "s1",
            "show 10 latest users instead",
        )
        .await
        .unwrap();

    assert!(updated.user_message.is_edited);
    let second_assistant = updated.assistant_message.unwrap();
    assert_eq!(second_assistant.id, first_assistant.id);

    // Still exactly one user and one assistant message.
    let messages = h.store.list_messages(chat.id).await.unwrap();
    assert_eq!(messages.len(), 2);
}

/// Law 10: duplication preserves order and remaps links into the copy.
#[tokio::test]
async fn test_duplicate_chat_with_messages() {
    let h = harness(MockDriver::new(), MockLlmClient::new()).await;
    let chat = h.chat(true).await;

    h.orchestrator
        .create_message("u1", chat.id, "s1", "show 5 latest users")
        .await
        .unwrap();

    let copy = h
        .orchestrator
        .duplicate_chat("u1", chat.id, true)
        .await
        .unwrap();

    let originals = h.store.list_messages(chat.id).await.unwrap();
    let copies = h.store.list_messages(copy.id).await.unwrap();
    assert_eq!(copies.len(), originals.len());

    for (original, copied) in originals.iter().zip(copies.iter()) {
        assert_eq!(original.message_type, copied.message_type);
        assert_eq!(original.content, copied.content);
    }

    // Every remapped link lands on a message of the new chat.
    let copy_ids: Vec<i64> = copies.iter().map(|m| m.id).collect();
    for copied in &copies {
        if let Some(link) = copied.user_message_id {
            assert!(copy_ids.contains(&link));
        }
    }

    // Copied queries are back to proposed with fresh ids.
    let assistant_copy = copies
        .iter()
        .find(|m| m.message_type == MessageType::Assistant)
        .unwrap();
    let query = &assistant_copy.queries.as_ref().unwrap()[0];
    assert!(!query.is_executed);
    assert!(query.id.starts_with(&format!("{}:", assistant_copy.id)));
}

/// Invariant 4 end to end: fix_error tracks persisted query errors.
#[tokio::test]
async fn test_fix_error_button_follows_error_state() {
    let driver = MockDriver::new().with_failure(
        "FROM missing_table",
        chatdb::error::QueryError::new("42P01", "relation does not exist"),
    );
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    let (_, assistant) = h
        .plant_plan(
            &chat,
            json!({
                "assistantMessage": "plan",
                "queries": [{
                    "query": "SELECT * FROM missing_table",
                    "queryType": "SELECT",
                    "explanation": "broken"
                }]
            }),
        )
        .await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    let outcome = h
        .orchestrator
        .execute_query(chatdb::chat::ExecuteQueryRequest {
            user_id: "u1".to_string(),
            chat_id: chat.id,
            message_id: assistant.id,
            query_id: query_id.clone(),
            stream_id: "s1".to_string(),
            offset: 0,
        })
        .await
        .unwrap();

    // The driver failure is recorded, not thrown.
    assert!(outcome.query.is_executed);
    assert_eq!(outcome.query.error.as_ref().unwrap().code, "42P01");
    assert!(outcome
        .message
        .action_buttons
        .as_ref()
        .unwrap()
        .iter()
        .any(|b| b.action == "fix_error"));
}

/// Connection law 7 through the orchestrator surface.
#[tokio::test]
async fn test_connect_disconnect_connect() {
    let h = harness(MockDriver::new(), MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    h.orchestrator.connect_db("u1", chat.id, "s1").await.unwrap();
    assert!(h.manager.is_connected(chat.id).await);

    h.orchestrator
        .disconnect_db("u1", chat.id, false)
        .await
        .unwrap();
    assert!(!h.manager.is_connected(chat.id).await);

    h.orchestrator.connect_db("u1", chat.id, "s1").await.unwrap();
    assert!(h.manager.is_connected(chat.id).await);

    // Idempotent: a second connect succeeds and shares the entry.
    h.orchestrator.connect_db("u1", chat.id, "s2").await.unwrap();
    assert_eq!(h.driver.connect_count(), 2);
}
