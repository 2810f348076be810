//! Rollback lifecycle, including dependent-query regeneration.

use super::common::{drain_events, harness};
use chatdb::chat::ExecuteQueryRequest;
use chatdb::db::MockDriver;
use chatdb::error::QueryError;
use chatdb::llm::MockLlmClient;
use chatdb::model::actions;
use chatdb::stream::EventKind;
use pretty_assertions::assert_eq;
use serde_json::json;

fn delete_plan() -> serde_json::Value {
    json!({
        "assistantMessage": "This removes the user's shipping addresses.",
        "queries": [{
            "query": "DELETE FROM shipping_addresses WHERE user_id = 4",
            "queryType": "DELETE",
            "explanation": "Remove shipping addresses for user 4",
            "isCritical": true,
            "canRollback": true,
            "rollbackQuery": "",
            "rollbackDependentQuery": "SELECT * FROM shipping_addresses WHERE user_id = 4"
        }]
    })
}

fn request(chat_id: i64, message_id: i64, query_id: &str) -> ExecuteQueryRequest {
    ExecuteQueryRequest {
        user_id: "u1".to_string(),
        chat_id,
        message_id,
        query_id: query_id.to_string(),
        stream_id: "s1".to_string(),
        offset: 0,
    }
}

/// Scenario: rollback via dependent query (S3).
/// The dependent SELECT runs, a second LLM turn produces the concrete
/// rollback, and the query transitions executed → rolled-back with a
/// rollback-executed event.
#[tokio::test]
async fn test_rollback_via_dependent_query() {
    let driver = MockDriver::new().with_rows(
        "SELECT * FROM shipping_addresses",
        vec![json!({"user_id": 4, "street": "Main St 1"})],
    );
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(false).await;
    let mut rx = h.open_stream(&chat, "s1").await;

    let (_, assistant) = h.plant_plan(&chat, delete_plan()).await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    // Execute the critical query explicitly.
    let executed = h
        .orchestrator
        .execute_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap();
    assert!(executed.query.is_executed);
    assert!(!executed.query.is_rolled_back);

    // Now roll it back; the stored rollbackQuery is empty.
    let rolled = h
        .orchestrator
        .rollback_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap();

    assert!(rolled.query.is_rolled_back);
    assert!(rolled.query.is_executed, "invariant: rolled back implies executed");
    assert!(rolled.query.error.is_none());
    // The synthesized rollback was stored before running.
    assert!(rolled
        .query
        .rollback_query
        .as_ref()
        .unwrap()
        .contains("INSERT INTO shipping_addresses"));

    // The dependent SELECT, then the generated INSERT, reached the driver.
    let executed_queries = h.driver.executed_queries();
    assert!(executed_queries
        .iter()
        .any(|q| q.starts_with("SELECT * FROM shipping_addresses")));
    assert!(executed_queries
        .iter()
        .any(|q| q.starts_with("INSERT INTO shipping_addresses")));

    // One LLM turn ran for the regeneration.
    assert_eq!(h.llm.call_count(), 1);

    let events = drain_events(&mut rx).await;
    assert!(events.iter().any(|e| e.event == EventKind::RollbackExecuted));
}

/// Scenario: a failing rollback keeps the query executed, persists the
/// error, emits rollback-query-failed, and carries a transient
/// fix_rollback_error button in the response only.
#[tokio::test]
async fn test_rollback_failure_is_transiently_buttoned() {
    let driver = MockDriver::new()
        .with_rows(
            "SELECT * FROM shipping_addresses",
            vec![json!({"user_id": 4, "street": "Main St 1"})],
        )
        .with_failure(
            "INSERT INTO shipping_addresses",
            QueryError::new("23505", "duplicate key"),
        );
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(false).await;
    let mut rx = h.open_stream(&chat, "s1").await;

    let (_, assistant) = h.plant_plan(&chat, delete_plan()).await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    h.orchestrator
        .execute_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap();

    let outcome = h
        .orchestrator
        .rollback_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap();

    // RollbackFailed: executed, not rolled back, error recorded.
    assert!(outcome.query.is_executed);
    assert!(!outcome.query.is_rolled_back);
    assert_eq!(outcome.query.error.as_ref().unwrap().code, "23505");

    // Transient button only; the persisted message carries fix_error.
    assert!(outcome
        .transient_buttons
        .iter()
        .any(|b| b.action == actions::FIX_ROLLBACK_ERROR));
    let persisted = h.store.get_message(assistant.id).await.unwrap();
    let persisted_buttons = persisted.action_buttons.unwrap();
    assert!(!persisted_buttons
        .iter()
        .any(|b| b.action == actions::FIX_ROLLBACK_ERROR));
    assert!(persisted_buttons.iter().any(|b| b.action == actions::FIX_ERROR));

    let events = drain_events(&mut rx).await;
    assert!(events
        .iter()
        .any(|e| e.event == EventKind::RollbackQueryFailed));
}

/// A successful rollback overwrites the execute's recorded time.
#[tokio::test]
async fn test_rollback_overwrites_execution_time() {
    let driver = MockDriver::new().with_rows("SELECT * FROM shipping_addresses", vec![json!({})]);
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    let (_, assistant) = h.plant_plan(&chat, delete_plan()).await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    h.orchestrator
        .execute_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap();
    let rolled = h
        .orchestrator
        .rollback_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap();

    assert!(rolled.query.execution_time.is_some());
}

/// Law: a query with canRollback=false must never attempt a rollback.
#[tokio::test]
async fn test_rollback_refused_without_can_rollback() {
    let h = harness(MockDriver::new(), MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    let (_, assistant) = h
        .plant_plan(
            &chat,
            json!({
                "assistantMessage": "plan",
                "queries": [{
                    "query": "DELETE FROM t",
                    "queryType": "DELETE",
                    "explanation": "irreversible",
                    "isCritical": true,
                    "canRollback": false
                }]
            }),
        )
        .await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    h.orchestrator
        .execute_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .rollback_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "BAD_INPUT");

    // Nothing rollback-shaped reached the driver.
    assert!(!h
        .driver
        .executed_queries()
        .iter()
        .any(|q| q.contains("INSERT")));
}

/// Preconditions: not-yet-executed and already-rolled-back both conflict.
#[tokio::test]
async fn test_rollback_preconditions() {
    let driver = MockDriver::new().with_rows("SELECT * FROM shipping_addresses", vec![json!({})]);
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    let (_, assistant) = h.plant_plan(&chat, delete_plan()).await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    // Not executed yet.
    let err = h
        .orchestrator
        .rollback_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");

    h.orchestrator
        .execute_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap();
    h.orchestrator
        .rollback_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap();

    // Already rolled back.
    let err = h
        .orchestrator
        .rollback_query(request(chat.id, assistant.id, &query_id))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}
