//! MetFlow CLI - Request-driven forecast data pipelines
//!
//! Builds a synthetic reader → ensemble mean → smoothing pipeline, issues
//! requests against it and reports the results and the memory manager state.
//!
//! # Usage
//!
//! ```bash
//! # Smoothed ensemble mean of temperature
//! metflow run --variable T --members 0/1/2/3 --smooth 2
//!
//! # Same request twice on the calling thread, as JSON
//! metflow run --member 0 --repeat 2 --single-threaded --json
//!
//! # Show the effective configuration
//! metflow config show
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

mod commands;
mod logging;
mod progress;

/// MetFlow - Request-driven dataflow for weather forecast data
#[derive(Parser, Debug)]
#[command(name = "metflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOptions,
}

/// Global options available to all commands
#[derive(Args, Debug, Clone)]
struct GlobalOptions {
    /// Workspace directory holding `.metflow/config.toml`
    #[arg(long, short = 'w', global = true, env = "METFLOW_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Path to configuration file (replaces global and local config)
    #[arg(long, short = 'c', global = true, env = "METFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Request forecast fields through the pipeline
    Run(commands::run::RunArgs),

    /// View and manage configuration
    #[command(subcommand)]
    Config(commands::config::ConfigCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let workspace = commands::resolve_workspace(&cli.global)?;
    let config = commands::load_config(&cli.global, &workspace);

    // A broken config file is reported by the command itself.
    let logging = config.as_ref().map(|c| c.logging.clone()).unwrap_or_default();
    logging::init(&cli.global, &logging)?;

    match cli.command {
        Commands::Run(args) => commands::run::execute(args, &cli.global, config?),
        Commands::Config(cmd) => commands::config::execute(cmd, &cli.global, &workspace),
    }
}
