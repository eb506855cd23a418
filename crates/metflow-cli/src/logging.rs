//! Tracing subscriber setup
//!
//! Level precedence: `--verbose` / `--quiet`, then `RUST_LOG`, then the
//! configured `logging.level`. Output goes to stderr unless `logging.file`
//! is set.

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use metflow_config::{LogFormat, LoggingConfig};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::GlobalOptions;

/// Filter directive for the given flags and configuration.
pub fn filter_directive(global: &GlobalOptions, config: &LoggingConfig) -> Option<String> {
    if global.quiet {
        Some("error".to_string())
    } else if global.verbose {
        Some("debug".to_string())
    } else if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        None
    } else {
        Some(config.level.to_lowercase())
    }
}

pub fn init(global: &GlobalOptions, config: &LoggingConfig) -> Result<()> {
    let filter = match filter_directive(global, config) {
        Some(directive) => EnvFilter::try_new(&directive)
            .with_context(|| format!("Invalid log level '{}'", directive))?,
        None => EnvFilter::from_default_env(),
    };

    let (writer, ansi) = match config.file {
        Some(ref path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_thread_names(true);

    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
