//! HTTP backend client against an in-process stand-in of the backend API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use save_orchestrator::backend::http::HttpBackend;
use save_orchestrator::backend::Backend;
use save_orchestrator::config::BackendConfig;
use save_orchestrator::models::agent::AgentState;
use save_orchestrator::models::execution::ExecutionStatus;
use save_orchestrator::AppError;

type Recorded = Arc<Mutex<Vec<(String, Value)>>>;

async fn init_config(Query(params): Query<HashMap<String, String>>) -> (StatusCode, Json<Value>) {
    match params.get("containerId").map(String::as_str) {
        Some("ready") => (StatusCode::OK, Json(json!({ "saveCliUrl": "http://files/save" }))),
        _ => (StatusCode::NO_CONTENT, Json(Value::Null)),
    }
}

async fn next_run_config() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "queue exploded")
}

async fn results_saved(Query(params): Query<HashMap<String, String>>) -> Json<bool> {
    Json(params.get("containerId").map(String::as_str) != Some("lossy"))
}

async fn statuses(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let execution = params.get("executionId").cloned().unwrap_or_default();
    Json(json!([
        { "containerId": format!("{execution}-a"), "state": "IDLE", "time": "2026-01-01T00:00:00Z" },
        { "containerId": format!("{execution}-b"), "state": "BUSY", "time": "2026-01-01T00:00:05Z" }
    ]))
}

fn recorder(path: &'static str) -> axum::routing::MethodRouter<Recorded> {
    post(
        move |State(recorded): State<Recorded>, Json(body): Json<Value>| async move {
            recorded.lock().unwrap().push((path.to_owned(), body));
            StatusCode::OK
        },
    )
}

async fn spawn_backend() -> (HttpBackend, Recorded) {
    let recorded: Recorded = Arc::default();
    let app = Router::new()
        .route("/internal/agents/get-init-config", get(init_config))
        .route("/internal/agents/get-next-run-config", get(next_run_config))
        .route("/internal/test-executions/are-results-saved", get(results_saved))
        .route("/internal/agents/statuses", get(statuses))
        .route("/internal/agents/update-status", recorder("update-status"))
        .route(
            "/internal/test-executions/mark-as-failed",
            recorder("mark-as-failed"),
        )
        .route(
            "/internal/executions/update-status",
            recorder("execution-status"),
        )
        .route("/internal/agents/insert", recorder("insert"))
        .with_state(Arc::clone(&recorded));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let backend = HttpBackend::new(&BackendConfig {
        url: format!("http://{addr}/"),
        request_timeout_seconds: 5,
    })
    .expect("client");
    (backend, recorded)
}

#[tokio::test]
async fn init_config_is_optional() {
    let (backend, _) = spawn_backend().await;

    let ready = backend.get_init_config("ready").await.expect("rpc");
    let pending = backend.get_init_config("pending").await.expect("rpc");

    assert_eq!(
        ready.map(|config| config.0),
        Some(json!({ "saveCliUrl": "http://files/save" }))
    );
    assert!(pending.is_none());
}

#[tokio::test]
async fn server_errors_become_backend_errors() {
    let (backend, _) = spawn_backend().await;

    let err = backend.get_next_run_config("c1").await.expect_err("500");

    assert!(
        matches!(err, AppError::Backend(ref msg) if msg.contains("500") && msg.contains("queue exploded")),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn saved_data_check_parses_boolean() {
    let (backend, _) = spawn_backend().await;

    assert!(backend.check_saved_data("c1").await.expect("rpc"));
    assert!(!backend.check_saved_data("lossy").await.expect("rpc"));
}

#[tokio::test]
async fn agent_statuses_are_decoded() {
    let (backend, _) = spawn_backend().await;

    let statuses = backend
        .get_agent_statuses_for_execution("e1")
        .await
        .expect("rpc");

    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].container_id, "e1-a");
    assert_eq!(statuses[1].state, AgentState::Busy);
}

#[tokio::test]
async fn writes_use_camel_case_bodies() {
    let (backend, recorded) = spawn_backend().await;
    let time = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();

    backend
        .update_agent_status("c1", AgentState::StoppedByOrch, time)
        .await
        .expect("rpc");
    backend
        .mark_test_executions_as_failed(&["c1".to_owned(), "c2".to_owned()])
        .await
        .expect("rpc");
    backend
        .update_execution_status("e1", ExecutionStatus::Finished, None)
        .await
        .expect("rpc");
    backend
        .update_execution_status("e1", ExecutionStatus::Error, Some("boom".into()))
        .await
        .expect("rpc");
    backend
        .add_agents("e1", &["c1".to_owned()])
        .await
        .expect("rpc");

    let recorded = recorded.lock().unwrap().clone();
    assert_eq!(
        recorded,
        vec![
            (
                "update-status".to_owned(),
                json!({ "containerId": "c1", "state": "STOPPED_BY_ORCH", "time": "2026-03-04T05:06:07Z" })
            ),
            ("mark-as-failed".to_owned(), json!(["c1", "c2"])),
            (
                "execution-status".to_owned(),
                json!({ "executionId": "e1", "status": "FINISHED" })
            ),
            (
                "execution-status".to_owned(),
                json!({ "executionId": "e1", "status": "ERROR", "reason": "boom" })
            ),
            (
                "insert".to_owned(),
                json!({ "executionId": "e1", "containerIds": ["c1"] })
            ),
        ]
    );
}

#[tokio::test]
async fn unreachable_backend_is_a_backend_error() {
    let backend = HttpBackend::new(&BackendConfig {
        url: "http://127.0.0.1:1".into(),
        request_timeout_seconds: 1,
    })
    .expect("client");

    let err = backend.check_saved_data("c1").await.expect_err("unreachable");
    assert!(matches!(err, AppError::Backend(_)));
}
