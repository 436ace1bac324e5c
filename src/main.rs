//! Fuzzball Agent - per-node job and volume executor
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use fuzzball_agent::cli::{Cli, Commands, LogFormat};
use fuzzball_agent::config::ConfigManager;
use fuzzball_agent::error::AgentResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AgentResult<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let mut config = config_manager.load().await?;
    cli.apply_overrides(&mut config);

    match cli.command {
        Commands::Run => fuzzball_agent::cli::commands::run(&config).await,
        Commands::Config(args) => {
            fuzzball_agent::cli::commands::config(args, &config, &config_manager)
        }
    }
}

/// Logs go to stderr: 0 = info, 1 = debug, 2+ = trace, unless RUST_LOG is set
fn init_logging(verbose: u8, format: LogFormat) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fuzzball_agent={}", level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}
