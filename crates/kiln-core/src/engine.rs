//! Execution supervisor.
//!
//! The `Engine` drives each request through its lifecycle:
//!
//! ```text
//! Pending → ResolvingFingerprint → CacheHit | Building → Running → Completed | TimedOut | Failed → CleanedUp
//!    │                                                                                   (or Cancelled)
//!    └── Rejected (validation)
//! ```
//!
//! Every request produces exactly one `ExecutionOutcome`; errors are carried
//! inside the outcome rather than returned. Resources held by a request (pool
//! slot, artifact lease, running container) are released by drop guards, so
//! dropping the `execute` future cleans up the same way cancellation does.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::backend::{
    docker_backends, BackendKind, BuildSpec, CancelHandle, IsolationBackend, RunOutput,
};
use crate::cache::{BuildCache, CacheConfig};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::health::HealthTracker;
use crate::language::LanguageRegistry;
use crate::metrics::MetricsEmitter;
use crate::pool::AdmissionPool;
use crate::store::RecordStore;
use crate::types::{
    millis, unix_millis, ExecutionOutcome, ExecutionRecord, FunctionDef, Submission,
    SubmissionRequest,
};

/// How long `shutdown` waits for artifacts to be destroyed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for an `Engine`.
pub struct EngineBuilder {
    config: EngineConfig,
    registry: LanguageRegistry,
    backends: FxHashMap<BackendKind, Arc<dyn IsolationBackend>>,
    record_store: Option<Arc<dyn RecordStore>>,
}

impl EngineBuilder {
    pub fn new(mut config: EngineConfig) -> Self {
        config.normalize();
        Self {
            config,
            registry: LanguageRegistry::with_defaults(),
            backends: FxHashMap::default(),
            record_store: None,
        }
    }

    pub fn registry(mut self, registry: LanguageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a backend, replacing any backend of the same kind.
    pub fn backend(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    /// Register the Docker container and sandboxed backends.
    pub fn docker_backends(self, scratch_dir: PathBuf) -> Self {
        let (container, sandboxed) = docker_backends(&self.config, scratch_dir);
        self.backend(Arc::new(container)).backend(Arc::new(sandboxed))
    }

    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.record_store = Some(store);
        self
    }

    /// Build the engine. Must be called inside a tokio runtime.
    pub fn build(self) -> Engine {
        let config = self.config;
        let cache = BuildCache::new(CacheConfig::from_engine_config(&config));
        let sweeper = cache.spawn_sweeper(config.sweep_interval());
        let metrics = match self.record_store {
            Some(store) => MetricsEmitter::new(store),
            None => MetricsEmitter::disabled(),
        };

        tracing::info!(
            pool_size = config.pool_size,
            backends = ?self.backends.keys().collect::<Vec<_>>(),
            "engine started"
        );

        Engine {
            inner: Arc::new(EngineInner {
                pool: AdmissionPool::new(
                    config.pool_size,
                    config.max_queue_depth,
                    config.queue_wait(),
                ),
                health: HealthTracker::new(config.backend_cooldown()),
                registry: self.registry,
                backends: self.backends,
                cache,
                metrics,
                sweeper: Mutex::new(Some(sweeper)),
                shut_down: AtomicBool::new(false),
                config,
            }),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    registry: LanguageRegistry,
    backends: FxHashMap<BackendKind, Arc<dyn IsolationBackend>>,
    cache: BuildCache,
    pool: AdmissionPool,
    health: HealthTracker,
    metrics: MetricsEmitter,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl EngineInner {
    fn stop_sweeper(&self) {
        if let Some(task) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

/// The execution engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &BuildCache {
        &self.inner.cache
    }

    pub fn pool(&self) -> &AdmissionPool {
        &self.inner.pool
    }

    /// Kinds of the registered backends, in order.
    pub fn backend_kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.inner.backends.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Execute an ad-hoc submission.
    pub async fn execute(&self, request: &SubmissionRequest) -> ExecutionOutcome {
        self.execute_with(request, None, &CancelHandle::new()).await
    }

    /// Execute a stored function, optionally on a different backend.
    pub async fn execute_function(
        &self,
        def: &FunctionDef,
        backend: Option<BackendKind>,
        cancel: &CancelHandle,
    ) -> ExecutionOutcome {
        self.execute_with(&def.to_request(backend), Some(&def.name), cancel)
            .await
    }

    /// Execute a submission, recording it under `function_name`.
    ///
    /// `cancel` may fire at any point; the outcome then carries `Cancelled`.
    pub async fn execute_with(
        &self,
        request: &SubmissionRequest,
        function_name: Option<&str>,
        cancel: &CancelHandle,
    ) -> ExecutionOutcome {
        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let span = tracing::info_span!(
            "execute",
            request = &request_id[..8],
            function = function_name.unwrap_or("-"),
        );

        async move {
            let accepted = Instant::now();
            tracing::debug!(phase = "Pending", language = %request.language);

            let (mut outcome, backend) =
                match Submission::validate(request, &self.inner.registry, self.inner.config.max_timeout()) {
                    Ok(submission) => {
                        let outcome = self.supervise(&submission, cancel, accepted).await;
                        (outcome, submission.backend)
                    }
                    Err(e) => {
                        tracing::info!(phase = "Rejected", "{}", e);
                        let backend = request
                            .backend
                            .as_deref()
                            .and_then(|b| b.parse().ok())
                            .unwrap_or_default();
                        (ExecutionOutcome::failed(&e), backend)
                    }
                };

            outcome.total_time_ms = millis(accepted.elapsed());

            let record = ExecutionRecord {
                function_name: function_name.map(String::from),
                backend,
                language: request.language.trim().to_ascii_lowercase(),
                timestamp: unix_millis(),
                outcome,
            };
            self.inner.metrics.emit(&record).await;
            record.outcome
        }
        .instrument(span)
        .await
    }

    /// Run an accepted submission, capturing any error in the outcome.
    async fn supervise(
        &self,
        submission: &Submission,
        cancel: &CancelHandle,
        accepted: Instant,
    ) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::default();
        if let Err(e) = self.run_submission(submission, cancel, accepted, &mut outcome).await {
            let phase = match &e {
                Error::Timeout { .. } => "TimedOut",
                Error::Cancelled => "Cancelled",
                _ => "Failed",
            };
            tracing::info!(phase, backend = %submission.backend, "{}", e);
            outcome.error = Some((&e).into());
        }
        tracing::debug!(phase = "CleanedUp");
        outcome
    }

    async fn run_submission(
        &self,
        submission: &Submission,
        cancel: &CancelHandle,
        accepted: Instant,
        outcome: &mut ExecutionOutcome,
    ) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ResourceExhaustion("engine is shutting down".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let kind = submission.backend;
        let backend = self.backend(kind)?;
        self.inner.health.ensure_healthy(backend.as_ref()).await?;

        let _slot = self.inner.pool.acquire(cancel).await?;

        tracing::debug!(phase = "ResolvingFingerprint");
        let template = self.inner.registry.resolve(submission.language)?.clone();
        let fingerprint = Fingerprint::compute(submission.language, &submission.code, kind);
        let spec = BuildSpec {
            fingerprint: fingerprint.clone(),
            language: submission.language,
            template,
            code: submission.code.clone(),
        };

        let phase = if self.inner.cache.contains(&fingerprint) {
            "CacheHit"
        } else {
            "Building"
        };
        tracing::debug!(phase, fingerprint = %fingerprint.short(), backend = %kind);

        let acquired = tokio::select! {
            result = self.inner.cache.get_or_build(Arc::clone(&backend), spec) => result,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        let (lease, hit) = acquired.inspect_err(|e| self.note_backend_error(kind, e))?;
        outcome.warm_start = hit;
        outcome.init_time_ms = millis(accepted.elapsed());

        tracing::debug!(phase = "Running", warm_start = hit);
        let run_started = Instant::now();
        let deadline = run_started + submission.timeout;
        let backstop = deadline + self.inner.config.grace();

        let result = match tokio::time::timeout_at(
            backstop,
            backend.run(lease.handle(), deadline, cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(backend = %kind, "backend ignored its deadline, run aborted");
                Err(Error::Timeout {
                    elapsed_ms: millis(run_started.elapsed()),
                })
            }
        };
        outcome.exec_time_ms = millis(run_started.elapsed());

        match result {
            Ok(output) => {
                tracing::debug!(phase = "Completed", exit_code = ?output.exit_code);
                apply_output(outcome, output, self.inner.config.max_output_bytes);
                Ok(())
            }
            Err(Error::Timeout { .. }) => Err(Error::Timeout {
                elapsed_ms: outcome.exec_time_ms,
            }),
            Err(e) => {
                if matches!(e, Error::RuntimeCrash(_)) {
                    self.inner.cache.invalidate_lease(&lease);
                }
                self.note_backend_error(kind, &e);
                Err(e)
            }
        }
    }

    fn backend(&self, kind: BackendKind) -> Result<Arc<dyn IsolationBackend>> {
        self.inner
            .backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::BackendUnavailable {
                backend: kind,
                message: "backend is not configured".to_string(),
            })
    }

    fn note_backend_error(&self, kind: BackendKind, err: &Error) {
        if err.is_backend_unavailable() {
            self.inner.health.mark_unhealthy(kind, &err.to_string());
        }
    }

    /// Run `iterations` executions of `request` on every registered backend.
    ///
    /// Iterations run sequentially so timings are not skewed by each other.
    pub async fn compare(
        &self,
        request: &SubmissionRequest,
        function_name: Option<&str>,
        iterations: usize,
    ) -> BTreeMap<BackendKind, Vec<ExecutionOutcome>> {
        let mut results = BTreeMap::new();
        for kind in self.backend_kinds() {
            let mut request = request.clone();
            request.backend = Some(kind.to_string());
            let mut outcomes = Vec::with_capacity(iterations);
            for _ in 0..iterations {
                outcomes.push(
                    self.execute_with(&request, function_name, &CancelHandle::new())
                        .await,
                );
            }
            results.insert(kind, outcomes);
        }
        results
    }

    /// Probe every registered backend, updating the health tracker.
    pub async fn health(&self) -> BTreeMap<BackendKind, bool> {
        let mut status = BTreeMap::new();
        for kind in self.backend_kinds() {
            let Ok(backend) = self.backend(kind) else {
                continue;
            };
            let healthy = match backend.health_check().await {
                Ok(()) => {
                    self.inner.health.mark_healthy(kind);
                    true
                }
                Err(e) => {
                    self.inner.health.mark_unhealthy(kind, &e.to_string());
                    false
                }
            };
            status.insert(kind, healthy);
        }
        status
    }

    /// Stop accepting requests and destroy every cached artifact.
    ///
    /// Artifacts leased by requests still running are destroyed when those
    /// requests finish. Returns `false` if destruction did not complete in
    /// time.
    pub async fn shutdown(&self) -> bool {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return true;
        }
        tracing::info!("engine shutting down");
        self.inner.stop_sweeper();
        self.inner.pool.close();
        self.inner.cache.shutdown(SHUTDOWN_TIMEOUT).await
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backends", &self.backend_kinds())
            .field("cache", &self.inner.cache)
            .field("pool_in_use", &self.inner.pool.in_use())
            .finish()
    }
}

fn apply_output(outcome: &mut ExecutionOutcome, output: RunOutput, cap: usize) {
    outcome.stdout = output.stdout;
    outcome.stderr = output.stderr;
    outcome.exit_code = output.exit_code;
    if output.stdout_truncated || output.stderr_truncated {
        if !outcome.stderr.is_empty() && !outcome.stderr.ends_with('\n') {
            outcome.stderr.push('\n');
        }
        outcome
            .stderr
            .push_str(&format!("[kiln] output truncated at {cap} bytes\n"));
    }
}
