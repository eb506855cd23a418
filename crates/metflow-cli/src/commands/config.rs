//! Config command - View and manage configuration
//!
//! - Show the effective configuration
//! - Show configuration file paths
//! - Create a default configuration file (local or global)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use metflow_config::ConfigLoader;
use serde::Serialize;

use super::load_config;
use crate::GlobalOptions;

/// Config management commands
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show(ShowArgs),

    /// Show configuration file paths
    Path(PathArgs),

    /// Write a default configuration file
    Init(InitArgs),
}

/// Arguments for the show command
#[derive(clap::Args, Debug)]
pub struct ShowArgs {
    /// Output as JSON instead of TOML
    #[arg(long)]
    json: bool,
}

/// Arguments for the path command
#[derive(clap::Args, Debug)]
pub struct PathArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// Arguments for the init command
#[derive(clap::Args, Debug)]
pub struct InitArgs {
    /// Create ~/.metflow/config.toml instead of the workspace config
    #[arg(long)]
    global: bool,
}

/// Configuration paths
#[derive(Debug, Clone, Serialize)]
pub struct ConfigPaths {
    /// Global config file path
    pub global: Option<PathBuf>,
    /// Local config file path
    pub local: PathBuf,
    /// Explicit config file given with --config
    pub explicit: Option<PathBuf>,
    /// Whether global config exists
    pub global_exists: bool,
    /// Whether local config exists
    pub local_exists: bool,
}

/// Execute the config command
pub fn execute(cmd: ConfigCommand, global: &GlobalOptions, workspace: &Path) -> Result<()> {
    match cmd {
        ConfigCommand::Show(args) => execute_show(args, global, workspace),
        ConfigCommand::Path(args) => execute_path(args, global, workspace),
        ConfigCommand::Init(args) => execute_init(args, workspace),
    }
}

fn execute_show(args: ShowArgs, global: &GlobalOptions, workspace: &Path) -> Result<()> {
    let config = load_config(global, workspace)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print!(
            "{}",
            toml::to_string_pretty(&config).context("Failed to serialize configuration")?
        );
    }
    Ok(())
}

fn collect_paths(global: &GlobalOptions, workspace: &Path) -> ConfigPaths {
    let loader = ConfigLoader::new();
    let global_path = loader.global_config_path();
    let local = loader.local_config_path(workspace);

    ConfigPaths {
        global_exists: global_path.as_ref().is_some_and(|p| p.exists()),
        global: global_path,
        local_exists: local.exists(),
        local,
        explicit: global.config.clone(),
    }
}

fn execute_path(args: PathArgs, global: &GlobalOptions, workspace: &Path) -> Result<()> {
    let paths = collect_paths(global, workspace);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&paths)?);
        return Ok(());
    }

    let marker = |exists: bool| if exists { "" } else { " (not found)" };
    match paths.global {
        Some(ref path) => println!("global: {}{}", path.display(), marker(paths.global_exists)),
        None => println!("global: (no home directory)"),
    }
    println!("local:  {}{}", paths.local.display(), marker(paths.local_exists));
    if let Some(ref explicit) = paths.explicit {
        println!("file:   {}{}", explicit.display(), marker(explicit.exists()));
    }
    Ok(())
}

fn execute_init(args: InitArgs, workspace: &Path) -> Result<()> {
    let loader = ConfigLoader::new();
    let path = if args.global {
        loader.init_global()
    } else {
        loader.init_local(workspace)
    }
    .context("Failed to create configuration file")?;

    println!("{}", path.display());
    Ok(())
}
