//! CLI command implementations

pub mod config;
pub mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use metflow_config::{ConfigLoader, PipelineConfig};

use crate::GlobalOptions;

/// Resolve the workspace path from options or current directory.
pub fn resolve_workspace(global: &GlobalOptions) -> Result<PathBuf> {
    if let Some(ref ws) = global.workspace {
        if !ws.is_dir() {
            anyhow::bail!("Workspace '{}' is not a directory", ws.display());
        }
        return ws
            .canonicalize()
            .with_context(|| format!("Failed to resolve workspace {}", ws.display()));
    }

    std::env::current_dir().context("Failed to get current directory")
}

/// Load configuration, from `--config` alone if given.
pub fn load_config(global: &GlobalOptions, workspace: &Path) -> Result<PipelineConfig> {
    if let Some(ref config_path) = global.config {
        return ConfigLoader::new()
            .load_file(config_path, None)
            .with_context(|| format!("Failed to load config file {}", config_path.display()));
    }

    ConfigLoader::new()
        .load(workspace, None)
        .context("Failed to load configuration")
}

/// Print an info message (respects quiet flag).
pub fn print_info(message: &str, quiet: bool) {
    if !quiet {
        eprintln!("{}", message);
    }
}
