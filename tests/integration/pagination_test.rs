//! Pagination behavior across the executor and orchestrator.

use super::common::{drain_events, harness};
use chatdb::chat::ExecuteQueryRequest;
use chatdb::db::MockDriver;
use chatdb::error::QueryError;
use chatdb::llm::MockLlmClient;
use chatdb::stream::EventKind;
use pretty_assertions::assert_eq;
use serde_json::json;

fn paginated_plan() -> serde_json::Value {
    json!({
        "assistantMessage": "All orders",
        "queries": [{
            "query": "SELECT * FROM orders",
            "queryType": "SELECT",
            "explanation": "every order",
            "pagination": {
                "paginatedQuery": "SELECT * FROM orders OFFSET offset_size LIMIT 50",
                "countQuery": "SELECT COUNT(*) FROM orders"
            }
        }]
    })
}

fn request(chat_id: i64, message_id: i64, query_id: &str, offset: i64) -> ExecuteQueryRequest {
    ExecuteQueryRequest {
        user_id: "u1".to_string(),
        chat_id,
        message_id,
        query_id: query_id.to_string(),
        stream_id: "s1".to_string(),
        offset,
    }
}

/// Scenario: pagination fallback (S2).
/// Given a driver that rejects the substituted paginated form
/// When the query executes
/// Then the raw query is retried once, the result is returned, and no
/// error is persisted.
#[tokio::test]
async fn test_pagination_fallback_persists_clean_result() {
    let driver = MockDriver::new()
        .with_failure("OFFSET", QueryError::new("42601", "syntax error near offset"))
        .with_result("COUNT(*)", json!({"results": [{"count": 120}]}))
        .with_rows("FROM orders", vec![json!({"id": 1}), json!({"id": 2})]);
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    let (_, assistant) = h.plant_plan(&chat, paginated_plan()).await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    let outcome = h
        .orchestrator
        .execute_query(request(chat.id, assistant.id, &query_id, 0))
        .await
        .unwrap();

    assert!(outcome.query.is_executed);
    assert!(outcome.query.error.is_none());
    assert_eq!(outcome.query.pagination.total_records_count, Some(120));
    assert!(outcome.query.execution_result.is_some());

    // Paginated attempt, then the raw fallback.
    let executed = h.driver.executed_queries();
    assert!(executed.iter().any(|q| q.contains("OFFSET 0")));
    assert!(executed.iter().any(|q| q == "SELECT * FROM orders"));
}

/// Boundary 11: a small query ships without pagination material and the
/// executor must not run a count probe.
#[tokio::test]
async fn test_small_query_runs_no_probe() {
    let h = harness(MockDriver::new(), MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    let (_, assistant) = h
        .plant_plan(
            &chat,
            json!({
                "assistantMessage": "Five users",
                "queries": [{
                    "query": "SELECT * FROM users LIMIT 5",
                    "queryType": "SELECT",
                    "explanation": "latest five"
                }]
            }),
        )
        .await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    let outcome = h
        .orchestrator
        .execute_query(request(chat.id, assistant.id, &query_id, 0))
        .await
        .unwrap();

    assert_eq!(outcome.query.pagination.total_records_count, None);
    let executed = h.driver.executed_queries();
    assert_eq!(executed.len(), 1);
    assert!(!executed[0].to_uppercase().contains("COUNT"));
}

/// Scenario: walking pages emits query-paginated-results and leaves the
/// persisted execution state untouched.
#[tokio::test]
async fn test_page_walk_streams_results() {
    let driver = MockDriver::new()
        .with_result("COUNT(*)", json!({"results": [{"count": 120}]}))
        .with_rows("FROM orders", vec![json!({"id": 1})]);
    let h = harness(driver, MockLlmClient::new()).await;
    let chat = h.chat(false).await;
    let mut rx = h.open_stream(&chat, "s1").await;

    let (_, assistant) = h.plant_plan(&chat, paginated_plan()).await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    let first = h
        .orchestrator
        .execute_query(request(chat.id, assistant.id, &query_id, 0))
        .await
        .unwrap();
    let recorded_time = first.query.execution_time;

    let page = h
        .orchestrator
        .execute_query(request(chat.id, assistant.id, &query_id, 50))
        .await
        .unwrap();

    // Page fetches do not rewrite the recorded execution.
    assert_eq!(page.query.execution_time, recorded_time);

    let events = drain_events(&mut rx).await;
    let page_event = events
        .iter()
        .find(|e| e.event == EventKind::QueryPaginatedResults)
        .expect("expected a query-paginated-results event");
    assert_eq!(page_event.data["offset"], json!(50));
    assert_eq!(page_event.data["queryId"], json!(query_id));

    // The substituted offset reached the driver.
    assert!(h
        .driver
        .executed_queries()
        .iter()
        .any(|q| q.contains("OFFSET 50")));
}

/// Paginating a query that was never executed conflicts.
#[tokio::test]
async fn test_page_walk_requires_prior_execute() {
    let h = harness(MockDriver::new(), MockLlmClient::new()).await;
    let chat = h.chat(false).await;

    let (_, assistant) = h.plant_plan(&chat, paginated_plan()).await;
    let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

    let err = h
        .orchestrator
        .execute_query(request(chat.id, assistant.id, &query_id, 50))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}
