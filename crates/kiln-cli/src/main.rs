//! Kiln CLI - Sandboxed function execution.

mod colors;
mod compare;
mod probe;
mod run;
mod serve;
mod setup;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Run untrusted code in container and gVisor sandboxes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a JSON config file (overrides KILN_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Host address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "8000")]
        port: u16,
    },

    /// Execute a source file once (or several times) and print the outcome
    Run {
        /// Path to the source file
        file: PathBuf,

        /// Language of the file (inferred from the extension if omitted)
        #[arg(short, long)]
        language: Option<String>,

        /// Execution timeout in seconds
        #[arg(short, long, default_value = "30")]
        timeout: u64,

        /// Isolation backend: container or sandboxed
        #[arg(short, long, default_value = "container")]
        backend: String,

        /// Number of times to run the file
        #[arg(long, default_value = "1")]
        repeat: usize,
    },

    /// Run a source file on every backend and compare timings
    Compare {
        /// Path to the source file
        file: PathBuf,

        /// Language of the file (inferred from the extension if omitted)
        #[arg(short, long)]
        language: Option<String>,

        /// Executions per backend
        #[arg(short, long, default_value = "3")]
        iterations: usize,

        /// Execution timeout in seconds
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Check that every isolation backend is reachable
    Probe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = setup::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => serve::execute(config, host, port).await?,

        Commands::Run {
            file,
            language,
            timeout,
            backend,
            repeat,
        } => {
            run::execute(config, &file, language.as_deref(), timeout, &backend, repeat).await?;
        }

        Commands::Compare {
            file,
            language,
            iterations,
            timeout,
        } => {
            compare::execute(config, &file, language.as_deref(), iterations, timeout).await?;
        }

        Commands::Probe => probe::execute(config).await?,
    }

    Ok(())
}
