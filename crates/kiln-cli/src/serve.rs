//! Serve command implementation for Kiln CLI.
//!
//! Starts the HTTP API server over the file-backed stores.

use kiln_core::{EngineConfig, ServerConfig};

use crate::colors;

/// Start the API server and run until Ctrl+C.
pub async fn execute(config: EngineConfig, host: String, port: u16) -> anyhow::Result<()> {
    println!(
        "\n{}Kiln Server{} - Sandboxed Function Execution",
        colors::BOLD,
        colors::RESET
    );
    println!("{}", "─".repeat(50));

    println!(
        "{}  ◆ State:{} {}",
        colors::CYAN,
        colors::RESET,
        config.state_dir.display()
    );
    println!(
        "{}  ◆ Pool:{} {} slots, queue depth {}",
        colors::CYAN,
        colors::RESET,
        config.pool_size,
        config.max_queue_depth
    );

    let server = ServerConfig { host, port };

    println!(
        "{}  ◆ Server:{} http://{}:{}",
        colors::CYAN,
        colors::RESET,
        server.host,
        server.port
    );
    println!("{}", "─".repeat(50));
    println!("{}Press Ctrl+C to stop{}", colors::GREEN, colors::RESET);
    println!();

    let state = kiln_server::build_state(config).await?;
    kiln_server::serve(state, server).await?;

    Ok(())
}
