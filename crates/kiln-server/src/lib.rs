//! Kiln HTTP server.
//!
//! Exposes the execution engine over a JSON API: a registry of named
//! functions, ad-hoc and named execution, execution metrics and a
//! backend comparison endpoint.
//!
//! # Routes
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/health` | version and backend health |
//! | POST, GET | `/functions` | create / list functions |
//! | GET, PUT, DELETE | `/functions/{name}` | read / replace / delete a function |
//! | POST | `/functions/{name}/execute?backend=` | run a stored function |
//! | POST | `/execute` | run an ad-hoc submission |
//! | GET | `/metrics/function/{name}?limit=&days=` | executions and statistics |
//! | GET | `/metrics/system?days=` | system-wide statistics |
//! | GET | `/runtime/compare?function_name=&iterations=` | compare backends |

pub mod error;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use kiln_core::{
    Engine, EngineConfig, JsonFunctionStore, JsonlRecordStore, KilnDirs, ServerConfig,
};

pub use error::{ServerError, ServerResult};
pub use routes::{AppState, create_router};

/// Assemble the engine and file-backed stores under `engine_config.state_dir`.
pub async fn build_state(engine_config: EngineConfig) -> ServerResult<AppState> {
    let dirs = KilnDirs::from_state_dir(&engine_config.state_dir)?;
    let stale = dirs.clean_scratch()?;
    if stale > 0 {
        tracing::info!("Removed {} stale build contexts", stale);
    }

    let functions = Arc::new(JsonFunctionStore::open(dirs.functions_file()).await?);
    let records = Arc::new(JsonlRecordStore::new(dirs.records_file()));

    let engine = Engine::builder(engine_config)
        .docker_backends(dirs.scratch_dir.clone())
        .record_store(records.clone())
        .build();

    Ok(AppState {
        engine,
        functions,
        records,
    })
}

/// Start the Kiln server and run until Ctrl+C.
///
/// On shutdown every cached artifact is destroyed before returning.
pub async fn serve(state: AppState, config: ServerConfig) -> ServerResult<()> {
    let engine = state.engine.clone();
    let app = create_router(Arc::new(state));

    // Build address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| {
            ServerError::BadRequest(format!("Invalid address: {}:{}", config.host, config.port))
        })?;

    let health = engine.health().await;
    for (backend, healthy) in &health {
        if *healthy {
            tracing::info!("Backend {} ready", backend);
        } else {
            tracing::warn!("Backend {} unavailable", backend);
        }
    }

    tracing::info!("Starting Kiln server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Create shutdown signal channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    // Handle Ctrl+C for graceful shutdown
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await?;

    if !engine.shutdown().await {
        tracing::warn!("Some artifacts were not destroyed before exit");
    }
    tracing::info!("Server shutdown complete");

    Ok(())
}
