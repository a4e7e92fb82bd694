//! HTTP API tests against an engine backed by scripted backends.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use kiln_core::testing::ScriptedBackend;
use kiln_core::{BackendKind, Engine, EngineConfig, MemoryFunctionStore, MemoryRecordStore};
use kiln_server::routes::{FunctionExecution, FunctionMetrics, HealthResponse, RuntimeComparison, SystemMetrics};
use kiln_server::{AppState, create_router};
use serde_json::{Value, json};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    sandboxed: Arc<ScriptedBackend>,
}

fn app() -> TestApp {
    let sandboxed = Arc::new(ScriptedBackend::new(BackendKind::Sandboxed));
    let records = Arc::new(MemoryRecordStore::new());
    let engine = Engine::builder(EngineConfig::default())
        .backend(Arc::new(ScriptedBackend::new(BackendKind::Container)))
        .backend(sandboxed.clone())
        .record_store(records.clone())
        .build();

    let state = AppState {
        engine,
        functions: Arc::new(MemoryFunctionStore::new()),
        records,
    };
    TestApp {
        router: create_router(Arc::new(state)),
        sandboxed,
    }
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn greet() -> Value {
    json!({
        "name": "greet",
        "language": "python",
        "code": "print('hello')",
        "timeout_seconds": 5,
        "description": "says hello"
    })
}

#[tokio::test]
async fn test_health() {
    let app = app();
    app.sandboxed.set_unavailable(true);

    let (status, body) = send(&app.router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);

    let health: HealthResponse = serde_json::from_value(body).unwrap();
    assert_eq!(health.status, "degraded");
    assert!(health.backends[&BackendKind::Container]);
    assert!(!health.backends[&BackendKind::Sandboxed]);
}

#[tokio::test]
async fn test_function_crud() {
    let app = app();

    let (status, created) = send(&app.router, Method::POST, "/functions", Some(greet())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(created["created_at"].is_u64());

    let (status, _) = send(&app.router, Method::POST, "/functions", Some(greet())).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, list) = send(&app.router, Method::GET, "/functions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let mut changed = greet();
    changed["code"] = json!("print('changed')");
    let (status, updated) = send(&app.router, Method::PUT, "/functions/greet", Some(changed)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["code"], "print('changed')");
    assert_eq!(updated["created_at"], created["created_at"]);

    let (status, _) = send(&app.router, Method::DELETE, "/functions/greet", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app.router, Method::GET, "/functions/greet", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].as_str().unwrap().contains("greet"));
}

#[tokio::test]
async fn test_create_rejects_unknown_language() {
    let app = app();
    let mut def = greet();
    def["language"] = json!("ruby");

    let (status, _) = send(&app.router, Method::POST, "/functions", Some(def)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_execute_stored_function() {
    let app = app();
    send(&app.router, Method::POST, "/functions", Some(greet())).await;

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/functions/greet/execute?backend=sandboxed",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let execution: FunctionExecution = serde_json::from_value(body).unwrap();
    assert_eq!(execution.function_name, "greet");
    assert_eq!(execution.backend, BackendKind::Sandboxed);
    assert_eq!(execution.result.stdout, "hello\n");
    assert_eq!(app.sandboxed.build_calls(), 1);

    let (status, _) = send(
        &app.router,
        Method::POST,
        "/functions/greet/execute?backend=vm",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app.router, Method::POST, "/functions/missing/execute", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_adhoc_execute_reports_errors_in_outcome() {
    let app = app();

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/execute",
        Some(json!({"language": "javascript", "code": "console.log('hi')", "timeout_seconds": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stdout"], "hi\n");
    assert_eq!(body["error"], Value::Null);

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/execute",
        Some(json!({"language": "ruby", "code": "puts 1", "timeout_seconds": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["kind"], "UnsupportedLanguage");
}

#[tokio::test]
async fn test_function_and_system_metrics() {
    let app = app();
    send(&app.router, Method::POST, "/functions", Some(greet())).await;
    for _ in 0..3 {
        send(&app.router, Method::POST, "/functions/greet/execute", None).await;
    }

    let (status, body) = send(&app.router, Method::GET, "/metrics/function/greet?limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    let metrics: FunctionMetrics = serde_json::from_value(body).unwrap();
    assert_eq!(metrics.executions.len(), 2);
    assert_eq!(metrics.statistics.total_executions, 2);
    assert_eq!(metrics.statistics.success_rate, 100.0);

    let (status, _) = send(&app.router, Method::GET, "/metrics/function/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app.router, Method::GET, "/metrics/system?days=1", None).await;
    assert_eq!(status, StatusCode::OK);
    let system: SystemMetrics = serde_json::from_value(body).unwrap();
    assert_eq!(system.system_stats.total_functions, 1);
    assert_eq!(system.system_stats.total_executions, 3);
    assert_eq!(system.function_stats["greet"].warm_vs_cold.warm, 2);
    assert_eq!(system.recent_executions.len(), 3);
}

#[tokio::test]
async fn test_runtime_compare() {
    let app = app();
    send(&app.router, Method::POST, "/functions", Some(greet())).await;

    let (status, body) = send(
        &app.router,
        Method::GET,
        "/runtime/compare?function_name=greet&iterations=2",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let comparison: RuntimeComparison = serde_json::from_value(body).unwrap();
    assert_eq!(comparison.iterations, 2);
    assert_eq!(comparison.stats[&BackendKind::Container].count, 2);
    assert_eq!(comparison.stats[&BackendKind::Sandboxed].count, 2);
    assert_eq!(comparison.raw_results[&BackendKind::Sandboxed].len(), 2);

    let (status, _) = send(
        &app.router,
        Method::GET,
        "/runtime/compare?function_name=greet&iterations=0",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
