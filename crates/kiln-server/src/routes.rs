//! HTTP routes for the Kiln server.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use kiln_core::stats::{days_cutoff, stats_by_function};
use kiln_core::types::unix_millis;
use kiln_core::{
    BackendKind, CancelHandle, Engine, ExecutionOutcome, ExecutionRecord, FunctionDef,
    FunctionStats, FunctionStore, RecordQuery, RecordStore, RuntimeStats, SubmissionRequest,
    SystemStats,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{ServerError, ServerResult};

/// Upper bound on `iterations` for a runtime comparison.
pub const MAX_COMPARE_ITERATIONS: usize = 20;

/// Number of executions returned by the system metrics endpoint.
const RECENT_EXECUTIONS: usize = 20;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Engine,
    pub functions: Arc<dyn FunctionStore>,
    pub records: Arc<dyn RecordStore>,
}

/// Create the router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/functions", post(create_function).get(list_functions))
        .route(
            "/functions/{name}",
            get(get_function).put(update_function).delete(delete_function),
        )
        .route("/functions/{name}/execute", post(execute_function))
        .route("/execute", post(execute_handler))
        .route("/metrics/function/{name}", get(function_metrics))
        .route("/metrics/system", get(system_metrics))
        .route("/runtime/compare", get(compare_runtimes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backends: BTreeMap<BackendKind, bool>,
}

/// Health check handler. Probes every backend.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let backends = state.engine.health().await;
    let status = if backends.values().all(|healthy| *healthy) {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backends,
    })
}

/// Reject definitions whose language has no template.
fn check_language(state: &AppState, def: &FunctionDef) -> ServerResult<()> {
    state.engine.registry().language(&def.language)?;
    Ok(())
}

async fn create_function(
    State(state): State<Arc<AppState>>,
    Json(def): Json<FunctionDef>,
) -> ServerResult<impl IntoResponse> {
    check_language(&state, &def)?;
    let created = state.functions.create(def).await?;
    tracing::info!(function = %created.name, "function created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_functions(State(state): State<Arc<AppState>>) -> ServerResult<Json<Vec<FunctionDef>>> {
    Ok(Json(state.functions.list().await?))
}

async fn get_function(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ServerResult<Json<FunctionDef>> {
    Ok(Json(state.functions.get(&name).await?))
}

async fn update_function(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(mut def): Json<FunctionDef>,
) -> ServerResult<Json<FunctionDef>> {
    def.name = name;
    check_language(&state, &def)?;
    Ok(Json(state.functions.update(def).await?))
}

async fn delete_function(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ServerResult<StatusCode> {
    state.functions.delete(&name).await?;
    tracing::info!(function = %name, "function deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct BackendParam {
    pub backend: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FunctionExecution {
    pub function_name: String,
    pub language: String,
    pub backend: BackendKind,
    pub result: ExecutionOutcome,
}

async fn execute_function(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<BackendParam>,
) -> ServerResult<Json<FunctionExecution>> {
    let def = state.functions.get(&name).await?;
    let backend = params
        .backend
        .as_deref()
        .map(str::parse::<BackendKind>)
        .transpose()?;

    let result = state
        .engine
        .execute_function(&def, backend, &CancelHandle::new())
        .await;

    Ok(Json(FunctionExecution {
        backend: backend.or(def.backend).unwrap_or_default(),
        function_name: def.name,
        language: def.language,
        result,
    }))
}

/// Ad-hoc execution. Failures are reported inside the outcome.
async fn execute_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmissionRequest>,
) -> Json<ExecutionOutcome> {
    Json(state.engine.execute(&request).await)
}

#[derive(Debug, Deserialize)]
pub struct FunctionMetricsParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub days: Option<u64>,
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FunctionMetrics {
    pub function_name: String,
    pub executions: Vec<ExecutionRecord>,
    pub statistics: FunctionStats,
}

async fn function_metrics(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<FunctionMetricsParams>,
) -> ServerResult<Json<FunctionMetrics>> {
    state.functions.get(&name).await?;

    let mut query = RecordQuery::function(&name).limit(params.limit);
    if let Some(days) = params.days {
        query = query.since(days_cutoff(unix_millis(), days));
    }
    let executions = state.records.query(&query).await?;
    let statistics = FunctionStats::from_records(&executions);

    Ok(Json(FunctionMetrics {
        function_name: name,
        executions,
        statistics,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SystemMetricsParams {
    #[serde(default = "default_days")]
    pub days: u64,
}

fn default_days() -> u64 {
    7
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub time_range: String,
    pub system_stats: SystemStats,
    pub function_stats: BTreeMap<String, FunctionStats>,
    pub recent_executions: Vec<ExecutionRecord>,
}

async fn system_metrics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SystemMetricsParams>,
) -> ServerResult<Json<SystemMetrics>> {
    let query = RecordQuery::default().since(days_cutoff(unix_millis(), params.days));
    let mut executions = state.records.query(&query).await?;
    let total_functions = state.functions.list().await?.len();

    let system_stats = SystemStats::from_records(&executions, total_functions, params.days);
    let function_stats = stats_by_function(&executions);
    executions.truncate(RECENT_EXECUTIONS);

    Ok(Json(SystemMetrics {
        time_range: format!("Last {} days", params.days),
        system_stats,
        function_stats,
        recent_executions: executions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CompareParams {
    pub function_name: String,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
}

fn default_iterations() -> usize {
    3
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RuntimeComparison {
    pub function_name: String,
    pub iterations: usize,
    pub stats: BTreeMap<BackendKind, RuntimeStats>,
    pub raw_results: BTreeMap<BackendKind, Vec<ExecutionOutcome>>,
}

/// Run a stored function repeatedly on every backend and compare timings.
async fn compare_runtimes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CompareParams>,
) -> ServerResult<Json<RuntimeComparison>> {
    if params.iterations == 0 || params.iterations > MAX_COMPARE_ITERATIONS {
        return Err(ServerError::BadRequest(format!(
            "iterations must be between 1 and {MAX_COMPARE_ITERATIONS}"
        )));
    }
    let def = state.functions.get(&params.function_name).await?;

    let raw_results = state
        .engine
        .compare(&def.to_request(None), Some(&def.name), params.iterations)
        .await;
    let stats = raw_results
        .iter()
        .map(|(kind, outcomes)| (*kind, RuntimeStats::from_outcomes(outcomes)))
        .collect();

    Ok(Json(RuntimeComparison {
        function_name: def.name,
        iterations: params.iterations,
        stats,
        raw_results,
    }))
}
