//! End-to-end engine behavior against the scripted in-process backend.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::testing::ScriptedBackend;
use kiln_core::{
    BackendKind, CancelHandle, Engine, EngineConfig, ErrorKind, MemoryRecordStore, RecordQuery,
    RecordStore, SubmissionRequest,
};

fn config() -> EngineConfig {
    EngineConfig {
        pool_size: 4,
        max_queue_depth: 16,
        queue_wait_ms: 5_000,
        grace_ms: 500,
        backend_cooldown_secs: 60,
        ..EngineConfig::default()
    }
}

struct Harness {
    engine: Engine,
    container: Arc<ScriptedBackend>,
    sandboxed: Arc<ScriptedBackend>,
    records: Arc<MemoryRecordStore>,
}

fn harness_with(config: EngineConfig, container: ScriptedBackend) -> Harness {
    let container = Arc::new(container);
    let sandboxed = Arc::new(ScriptedBackend::new(BackendKind::Sandboxed));
    let records = Arc::new(MemoryRecordStore::new());
    let engine = Engine::builder(config)
        .backend(container.clone())
        .backend(sandboxed.clone())
        .record_store(records.clone())
        .build();
    Harness {
        engine,
        container,
        sandboxed,
        records,
    }
}

fn harness() -> Harness {
    harness_with(
        config(),
        ScriptedBackend::new(BackendKind::Container).with_build_delay(Duration::from_millis(50)),
    )
}

fn python(code: &str, timeout: u64) -> SubmissionRequest {
    SubmissionRequest::new("python", code, timeout, BackendKind::Container)
}

#[tokio::test]
async fn test_python_hello() {
    let h = harness();
    let outcome = h.engine.execute(&python("print('hello')", 5)).await;

    assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
    assert_eq!(outcome.stdout, "hello\n");
    assert_eq!(outcome.exit_code, Some(0));
    assert!(!outcome.warm_start);
    assert!(outcome.init_time_ms >= 50);
    assert!(outcome.total_time_ms >= outcome.init_time_ms + outcome.exec_time_ms);
}

#[tokio::test]
async fn test_javascript_infinite_loop_times_out() {
    let h = harness();
    let request = SubmissionRequest::new("javascript", "while(true){}", 1, BackendKind::Container);
    let started = std::time::Instant::now();
    let outcome = h.engine.execute(&request).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::ExecutionTimeout));
    assert!(outcome.exec_time_ms >= 1_000);
    let grace = h.engine.config().grace_ms;
    assert!(outcome.exec_time_ms <= 1_000 + grace);
    assert!(outcome.total_time_ms >= 1_000);
    assert!(outcome.total_time_ms <= 1_000 + grace);
    assert!(started.elapsed() < Duration::from_millis(1_000 + grace + 500));
    assert_eq!(h.container.active_runs(), 0);
}

#[tokio::test]
async fn test_javascript_infinite_loop_times_out_sandboxed() {
    let h = harness();
    let request = SubmissionRequest::new("javascript", "while(true){}", 1, BackendKind::Sandboxed);
    let outcome = h.engine.execute(&request).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::ExecutionTimeout));
    let grace = h.engine.config().grace_ms;
    assert!(outcome.exec_time_ms >= 1_000);
    assert!(outcome.total_time_ms >= 1_000);
    assert!(outcome.total_time_ms <= 1_000 + grace);
    assert_eq!(h.sandboxed.active_runs(), 0);
    assert_eq!(h.container.build_calls(), 0);
}

#[tokio::test]
async fn test_unsupported_language_never_builds() {
    let h = harness();
    let request = SubmissionRequest {
        language: "ruby".to_string(),
        code: "puts 'hi'".to_string(),
        timeout_seconds: 5,
        backend: None,
    };
    let outcome = h.engine.execute(&request).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::UnsupportedLanguage));
    assert_eq!(h.container.build_calls(), 0);
    assert_eq!(h.sandboxed.build_calls(), 0);
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let h = harness();

    for request in [
        python("", 5),
        python("print('x')", 0),
        python("print('x')", h.engine.config().max_timeout_secs + 1),
        SubmissionRequest {
            backend: Some("firecracker".to_string()),
            ..python("print('x')", 5)
        },
    ] {
        let outcome = h.engine.execute(&request).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::InvalidSubmission), "{request:?}");
    }
    assert_eq!(h.container.build_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_identical_requests_build_once() {
    let h = harness();
    let request = python("print('same')", 5);

    let outcomes = futures::future::join_all((0..10).map(|_| h.engine.execute(&request))).await;

    assert_eq!(outcomes.len(), 10);
    for outcome in &outcomes {
        assert!(outcome.is_success());
        assert_eq!(outcome.stdout, "same\n");
    }
    assert_eq!(h.container.build_calls(), 1);
    assert_eq!(h.records.len(), 10);
}

#[tokio::test]
async fn test_warm_repeat_is_faster() {
    let h = harness();
    let request = python("print('again')", 5);

    let cold = h.engine.execute(&request).await;
    let warm = h.engine.execute(&request).await;

    assert!(!cold.warm_start);
    assert!(warm.warm_start);
    assert!(warm.init_time_ms < cold.init_time_ms);
    assert_eq!(h.container.build_calls(), 1);
}

#[tokio::test]
async fn test_backends_do_not_share_artifacts() {
    let h = harness();
    let code = "print('where')";

    h.engine.execute(&python(code, 5)).await;
    let outcome = h
        .engine
        .execute(&SubmissionRequest::new("python", code, 5, BackendKind::Sandboxed))
        .await;

    assert!(outcome.is_success());
    assert!(!outcome.warm_start);
    assert_eq!(h.container.build_calls(), 1);
    assert_eq!(h.sandboxed.build_calls(), 1);
}

#[tokio::test]
async fn test_build_failure_is_reported() {
    let h = harness_with(config(), ScriptedBackend::new(BackendKind::Container).failing_builds());
    let outcome = h.engine.execute(&python("print(", 5)).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::BuildFailure));
    assert_eq!(h.container.run_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_failing_builds_share_failure() {
    let h = harness_with(
        config(),
        ScriptedBackend::new(BackendKind::Container)
            .failing_builds()
            .with_build_delay(Duration::from_millis(100)),
    );
    let request = python("print(", 5);

    let outcomes = futures::future::join_all((0..8).map(|_| h.engine.execute(&request))).await;

    for outcome in &outcomes {
        assert_eq!(outcome.error_kind(), Some(ErrorKind::BuildFailure));
        assert!(!outcome.warm_start);
    }
    assert_eq!(h.container.build_calls(), 1);
    assert_eq!(h.container.run_calls(), 0);
    assert_eq!(h.records.len(), 8);
}

#[tokio::test]
async fn test_nonzero_exit_is_a_completed_run() {
    let h = harness();
    let outcome = h.engine.execute(&python("import sys; sys.exit(3)", 5)).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.exit_code, Some(3));
}

#[tokio::test]
async fn test_crash_invalidates_cache_entry() {
    let h = harness();
    let request = python("crash()", 5);

    let first = h.engine.execute(&request).await;
    assert_eq!(first.error_kind(), Some(ErrorKind::RuntimeCrash));

    let second = h.engine.execute(&request).await;
    assert!(!second.warm_start);
    assert_eq!(h.container.build_calls(), 2);
}

#[tokio::test]
async fn test_resource_audit_after_outcomes_and_shutdown() {
    let h = harness();

    let requests = [
        python("print('a')", 5),
        python("crash()", 5),
        SubmissionRequest::new("javascript", "while(true){}", 1, BackendKind::Sandboxed),
        SubmissionRequest::new("javascript", "console.log('b')", 5, BackendKind::Sandboxed),
    ];
    futures::future::join_all(requests.iter().map(|r| h.engine.execute(r))).await;

    assert_eq!(h.container.active_runs(), 0);
    assert_eq!(h.sandboxed.active_runs(), 0);

    // The crashed artifact is invalidated and reaped in the background.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.container.live_handles() + h.sandboxed.live_handles(),
        h.engine.cache().len()
    );

    assert!(h.engine.shutdown().await);
    assert_eq!(h.container.live_handles(), 0);
    assert_eq!(h.sandboxed.live_handles(), 0);
    assert_eq!(
        h.container.destroyed() + h.sandboxed.destroyed(),
        h.container.build_calls() + h.sandboxed.build_calls()
    );

    let outcome = h.engine.execute(&python("print('late')", 5)).await;
    assert_eq!(outcome.error_kind(), Some(ErrorKind::ResourceExhaustion));
}

#[tokio::test]
async fn test_cancel_while_running() {
    let h = harness();
    let cancel = CancelHandle::new();
    let request = python("while True: pass", 30);

    let task = {
        let engine = h.engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.execute_with(&request, None, &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.container.active_runs(), 1);
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("cancelled request should finish promptly")
        .unwrap();
    assert_eq!(outcome.error_kind(), Some(ErrorKind::Cancelled));
    assert_eq!(h.container.active_runs(), 0);
}

#[tokio::test]
async fn test_cancel_while_building_keeps_shared_build() {
    let h = harness_with(
        config(),
        ScriptedBackend::new(BackendKind::Container).with_build_delay(Duration::from_millis(300)),
    );
    let request = python("print('shared')", 5);
    let cancel = CancelHandle::new();

    let cancelled = {
        let engine = h.engine.clone();
        let request = request.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.execute_with(&request, None, &cancel).await })
    };
    let waiter = {
        let engine = h.engine.clone();
        let request = request.clone();
        tokio::spawn(async move { engine.execute(&request).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let cancelled = cancelled.await.unwrap();
    assert_eq!(cancelled.error_kind(), Some(ErrorKind::Cancelled));

    let waited = waiter.await.unwrap();
    assert!(waited.is_success());
    assert_eq!(waited.stdout, "shared\n");
    assert_eq!(h.container.build_calls(), 1);
}

#[tokio::test]
async fn test_backstop_aborts_backend_ignoring_deadline() {
    let h = harness_with(
        config(),
        ScriptedBackend::new(BackendKind::Container).ignoring_deadlines(),
    );
    let outcome = h.engine.execute(&python("while True: pass", 1)).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::ExecutionTimeout));
    assert!(outcome.exec_time_ms >= 1_000);
    assert!(outcome.exec_time_ms <= 1_000 + h.engine.config().grace_ms + 200);
    assert_eq!(h.container.active_runs(), 0);
}

#[tokio::test]
async fn test_pool_saturation_yields_resource_exhaustion() {
    let config = EngineConfig {
        pool_size: 1,
        max_queue_depth: 0,
        ..config()
    };
    let h = harness_with(
        config,
        ScriptedBackend::new(BackendKind::Container).with_run_delay(Duration::from_millis(300)),
    );

    let busy = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.execute(&python("print('busy')", 5)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let rejected = h.engine.execute(&python("print('next')", 5)).await;
    assert_eq!(rejected.error_kind(), Some(ErrorKind::ResourceExhaustion));
    assert!(busy.await.unwrap().is_success());
    assert!(h.container.max_active_runs() <= 1);
}

#[tokio::test]
async fn test_pool_bounds_concurrent_runs() {
    let config = EngineConfig {
        pool_size: 2,
        ..config()
    };
    let h = harness_with(
        config,
        ScriptedBackend::new(BackendKind::Container).with_run_delay(Duration::from_millis(50)),
    );

    let requests: Vec<_> = (0..6).map(|i| python(&format!("print('{i}')"), 5)).collect();
    let outcomes = futures::future::join_all(requests.iter().map(|r| h.engine.execute(r))).await;

    assert!(outcomes.iter().all(|o| o.is_success()));
    assert!(h.container.max_active_runs() <= 2);
}

#[tokio::test]
async fn test_backend_unavailable_enters_cooldown() {
    let h = harness();
    h.sandboxed.set_unavailable(true);
    let request = SubmissionRequest::new("python", "print('x')", 5, BackendKind::Sandboxed);

    let first = h.engine.execute(&request).await;
    assert_eq!(first.error_kind(), Some(ErrorKind::BackendUnavailable));
    let builds = h.sandboxed.build_calls();

    h.sandboxed.set_unavailable(false);
    let second = h.engine.execute(&request).await;
    assert_eq!(second.error_kind(), Some(ErrorKind::BackendUnavailable));
    assert_eq!(h.sandboxed.build_calls(), builds);

    // The other backend is unaffected.
    assert!(h.engine.execute(&python("print('x')", 5)).await.is_success());
}

#[tokio::test]
async fn test_records_are_emitted_per_outcome() {
    let h = harness();
    let def = kiln_core::FunctionDef {
        name: "greet".to_string(),
        language: "python".to_string(),
        code: "print('hi')".to_string(),
        timeout_seconds: 5,
        backend: None,
        description: None,
        tags: None,
        created_at: None,
    };

    h.engine
        .execute_function(&def, Some(BackendKind::Sandboxed), &CancelHandle::new())
        .await;
    h.engine.execute(&python("print('adhoc')", 5)).await;

    let records = h.records.query(&RecordQuery::function("greet")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].backend, BackendKind::Sandboxed);
    assert_eq!(records[0].outcome.stdout, "hi\n");
    assert_eq!(h.records.len(), 2);
}

#[tokio::test]
async fn test_compare_runs_every_backend() {
    let h = harness();
    let results = h.engine.compare(&python("print('cmp')", 5), Some("cmp"), 3).await;

    assert_eq!(results.len(), 2);
    for outcomes in results.values() {
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.is_success()));
        assert!(outcomes[1].warm_start);
    }
}

#[tokio::test]
async fn test_health_probe() {
    let h = harness();
    h.sandboxed.set_unavailable(true);

    let status = h.engine.health().await;
    assert!(status[&BackendKind::Container]);
    assert!(!status[&BackendKind::Sandboxed]);
}

#[tokio::test]
#[ignore = "Requires docker daemon"]
async fn test_docker_python_hello() {
    let temp = tempfile::TempDir::new().unwrap();
    let engine = Engine::builder(EngineConfig::default())
        .docker_backends(temp.path().to_path_buf())
        .build();

    let outcome = engine.execute(&python("print('hello')", 30)).await;
    assert_eq!(outcome.stdout, "hello\n");
    assert!(engine.shutdown().await);
}
