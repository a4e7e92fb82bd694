//! Probe command implementation for Kiln CLI.

use kiln_core::EngineConfig;

use crate::colors;
use crate::setup;

/// Check every backend and fail if any is unreachable.
pub async fn execute(config: EngineConfig) -> anyhow::Result<()> {
    let engine = setup::local_engine(config)?;
    let health = engine.health().await;
    engine.shutdown().await;

    let mut unhealthy = Vec::new();
    for (backend, healthy) in &health {
        if *healthy {
            println!("{}  ✓ {}{}", colors::GREEN, backend, colors::RESET);
        } else {
            println!("{}  ✗ {}{}", colors::RED, backend, colors::RESET);
            unhealthy.push(backend.as_str());
        }
    }

    if !unhealthy.is_empty() {
        anyhow::bail!("Unavailable backends: {}", unhealthy.join(", "));
    }
    Ok(())
}
