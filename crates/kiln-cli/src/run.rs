//! Run command implementation for Kiln CLI.
//!
//! Executes a source file through the engine. Each outcome is printed to
//! stdout as one JSON line; a human summary goes to stderr.

use std::path::Path;

use kiln_core::{CancelHandle, EngineConfig, ExecutionOutcome, SubmissionRequest};

use crate::colors;
use crate::setup;

/// Execute `file` `repeat` times on `backend`.
pub async fn execute(
    config: EngineConfig,
    file: &Path,
    language: Option<&str>,
    timeout: u64,
    backend: &str,
    repeat: usize,
) -> anyhow::Result<()> {
    let code = setup::read_source(file)?;
    let request = SubmissionRequest {
        language: setup::language_for(file, language),
        code,
        timeout_seconds: timeout,
        backend: Some(backend.to_string()),
    };

    let engine = setup::local_engine(config)?;
    let cancel = CancelHandle::new();

    // Ctrl+C cancels the run in flight; the engine still cleans up.
    let signal_cancel = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let mut last: Option<ExecutionOutcome> = None;
    for i in 0..repeat.max(1) {
        let outcome = engine.execute_with(&request, None, &cancel).await;
        println!("{}", serde_json::to_string(&outcome)?);
        print_summary(i + 1, &outcome);

        let stop = !outcome.is_success() || cancel.is_cancelled();
        last = Some(outcome);
        if stop {
            break;
        }
    }

    signal.abort();
    if !engine.shutdown().await {
        tracing::warn!("Some artifacts were not destroyed before exit");
    }

    if let Some(error) = last.and_then(|o| o.error) {
        anyhow::bail!("{}: {}", error.kind, error.message);
    }
    Ok(())
}

fn print_summary(run: usize, outcome: &ExecutionOutcome) {
    let status = match &outcome.error {
        None => format!("{}✓ exit {}{}", colors::GREEN, exit_code(outcome), colors::RESET),
        Some(error) => format!("{}✗ {}{}", colors::RED, error.kind, colors::RESET),
    };
    let start = if outcome.warm_start { "warm" } else { "cold" };

    eprintln!(
        "{}#{}{} {} {}init {}ms, exec {}ms, total {}ms ({}){}",
        colors::BOLD,
        run,
        colors::RESET,
        status,
        colors::DIM,
        outcome.init_time_ms,
        outcome.exec_time_ms,
        outcome.total_time_ms,
        start,
        colors::RESET
    );
}

fn exit_code(outcome: &ExecutionOutcome) -> String {
    outcome
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string())
}
