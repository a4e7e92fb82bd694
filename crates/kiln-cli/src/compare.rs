//! Compare command implementation for Kiln CLI.

use std::path::Path;

use kiln_core::{EngineConfig, RuntimeStats, SubmissionRequest};

use crate::colors;
use crate::setup;

/// Run `file` `iterations` times per backend and print a timing table.
pub async fn execute(
    config: EngineConfig,
    file: &Path,
    language: Option<&str>,
    iterations: usize,
    timeout: u64,
) -> anyhow::Result<()> {
    if iterations == 0 {
        anyhow::bail!("iterations must be at least 1");
    }

    let code = setup::read_source(file)?;
    let request = SubmissionRequest {
        language: setup::language_for(file, language),
        code,
        timeout_seconds: timeout,
        backend: None,
    };

    let engine = setup::local_engine(config)?;
    let results = engine.compare(&request, None, iterations).await;
    engine.shutdown().await;

    println!(
        "\n{}Runtime comparison{} - {} ({} iterations)",
        colors::BOLD,
        colors::RESET,
        file.display(),
        iterations
    );
    println!("{}", "─".repeat(50));
    println!(
        "{:<12} {:>6} {:>10} {:>10} {:>10}",
        "backend", "ok", "init avg", "exec avg", "total avg"
    );

    for (backend, outcomes) in &results {
        let stats = RuntimeStats::from_outcomes(outcomes);
        let color = if stats.count == outcomes.len() {
            colors::GREEN
        } else {
            colors::YELLOW
        };
        println!(
            "{}{:<12}{} {:>6} {:>8.1}ms {:>8.1}ms {:>8.1}ms",
            color,
            backend.as_str(),
            colors::RESET,
            format!("{}/{}", stats.count, outcomes.len()),
            stats.initialization_time.avg,
            stats.execution_time.avg,
            stats.total_time.avg
        );

        for error in outcomes.iter().filter_map(|o| o.error.as_ref()) {
            println!(
                "{}  {} {}: {}{}",
                colors::DIM,
                backend,
                error.kind,
                error.message,
                colors::RESET
            );
        }
    }
    println!("{}", "─".repeat(50));

    Ok(())
}
