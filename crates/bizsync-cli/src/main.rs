use std::path::PathBuf;

use anyhow::{Context, Result};
use bizsync_cli::cli::{resolve_config, run_demo};
use bizsync_cli::tracing_setup::init_tracing;
use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "bizsync")]
#[command(about = "Realtime sync core for conversations and notifications")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, short, global = true)]
    pretty: bool,

    /// Path to JSON config file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted session against the in-memory backend
    Demo,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose) {
        eprintln!("Warning: {:#}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (config, source) = resolve_config(cli.config.as_deref())?;
    if let Some(path) = &source {
        tracing::info!(path = %path.display(), "Loaded config");
    }

    match cli.command {
        Commands::Demo => {
            let report = run_demo(config).await?;
            print_json(&report, cli.pretty)
        }
        Commands::Config => print_json(&config, cli.pretty),
    }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let output = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .context("Failed to serialize output")?;
    println!("{}", output);
    Ok(())
}
