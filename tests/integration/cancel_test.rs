//! Cancellation across the LLM turn and the executor.

use super::common::{drain_events, harness, wait_until};
use chatdb::chat::ExecuteQueryRequest;
use chatdb::db::MockDriver;
use chatdb::llm::MockLlmClient;
use chatdb::model::MessageType;
use chatdb::stream::EventKind;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

/// Scenario: cancel during LLM (S4).
/// The provider call is aborted, the synthetic assistant message is
/// persisted, and response-cancelled is the last event.
#[tokio::test]
async fn test_cancel_during_llm_turn() {
    let llm = MockLlmClient::new().with_delay(Duration::from_secs(30));
    let h = harness(MockDriver::new(), llm).await;
    let chat = h.chat(false).await;
    let mut rx = h.open_stream(&chat, "s1").await;

    let outcome = h
        .orchestrator
        .create_message("u1", chat.id, "s1", "show users")
        .await
        .unwrap();

    // Let the turn reach the provider, then cancel.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let synthetic = h
        .orchestrator
        .cancel_processing("s1")
        .await
        .unwrap()
        .expect("a turn was in flight");

    assert_eq!(synthetic.content, "Operation cancelled by user");
    assert_eq!(synthetic.message_type, MessageType::Assistant);
    assert_eq!(synthetic.user_message_id, Some(outcome.user_message.id));

    // Both views carry the synthetic reply.
    let messages = h.store.list_messages(chat.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert!(h.store.get_mirror(synthetic.id).await.unwrap().is_some());

    // Give the cancelled turn a moment to unwind, then inspect events.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = drain_events(&mut rx).await;
    assert_eq!(
        events.last().unwrap().event,
        EventKind::ResponseCancelled,
        "response-cancelled must be the last event"
    );
    assert!(!events.iter().any(|e| e.event == EventKind::AiResponse));
    assert!(!events.iter().any(|e| e.event == EventKind::AiResponseError));
}

/// Law 8: a second cancelProcessing on the same stream is a no-op.
#[tokio::test]
async fn test_second_cancel_is_noop() {
    let llm = MockLlmClient::new().with_delay(Duration::from_secs(30));
    let h = harness(MockDriver::new(), llm).await;
    let chat = h.chat(false).await;

    h.orchestrator
        .create_message("u1", chat.id, "s1", "show users")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(h.orchestrator.cancel_processing("s1").await.unwrap().is_some());
    assert!(h.orchestrator.cancel_processing("s1").await.unwrap().is_none());

    // Exactly one synthetic assistant message was written.
    let messages = h.store.list_messages(chat.id).await.unwrap();
    assert_eq!(messages.len(), 2);
}

/// Boundary 12: cancelling an in-flight execution emits query-cancelled
/// to the exact stream and no ai-response.
#[tokio::test]
async fn test_cancel_query_execution() {
    let driver = MockDriver::new().with_delay(Duration::from_secs(30));
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(false).await;
    let mut rx = h.open_stream(&chat, "s1").await;
    let mut other_rx = h.open_stream(&chat, "other").await;

    let (_, assistant) = h
        .plant_plan(
            &chat,
            json!({
                "assistantMessage": "slow",
                "queries": [{
                    "query": "SELECT * FROM slow_table",
                    "queryType": "SELECT",
                    "explanation": "slow scan"
                }]
            }),
        )
        .await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    let orchestrator = h.orchestrator.clone();
    let chat_id = chat.id;
    let message_id = assistant.id;
    let task_query_id = query_id.clone();
    let task = tokio::spawn(async move {
        orchestrator
            .execute_query(ExecuteQueryRequest {
                user_id: "u1".to_string(),
                chat_id,
                message_id,
                query_id: task_query_id,
                stream_id: "s1".to_string(),
                offset: 0,
            })
            .await
    });

    // Wait until the execution is actually in flight.
    wait_until(|| async {
        h.driver
            .executed_queries()
            .iter()
            .any(|q| q.contains("slow_table"))
    })
    .await;

    let cancelled = h
        .orchestrator
        .cancel_query_execution("u1", chat.id, "s1")
        .await
        .unwrap();
    assert!(cancelled);

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(
        outcome.query.error.as_ref().unwrap().code,
        "QUERY_EXECUTION_CANCELLED"
    );

    let events = drain_events(&mut rx).await;
    assert!(events.iter().any(|e| e.event == EventKind::QueryCancelled));
    assert!(!events.iter().any(|e| e.event == EventKind::AiResponse));

    // The other stream saw nothing.
    let other_events = drain_events(&mut other_rx).await;
    assert!(!other_events
        .iter()
        .any(|e| e.event == EventKind::QueryCancelled));
}

/// Cancelling with nothing in flight reports false and emits nothing.
#[tokio::test]
async fn test_cancel_execution_noop() {
    let h = harness(MockDriver::new(), MockLlmClient::new()).await;
    let chat = h.chat(false).await;
    let mut rx = h.open_stream(&chat, "s1").await;

    let cancelled = h
        .orchestrator
        .cancel_query_execution("u1", chat.id, "s1")
        .await
        .unwrap();
    assert!(!cancelled);

    let events = drain_events(&mut rx).await;
    assert!(events.is_empty());
}
