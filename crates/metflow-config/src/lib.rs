//! MetFlow Configuration Management
//!
//! Provides configuration loading with support for:
//! - Global config: `~/.metflow/config.toml`
//! - Local config: `.metflow/config.toml` (in workspace)
//! - CLI overrides via `ConfigOverrides`
//!
//! Configuration is merged in order: global → local → CLI overrides.

mod error;
mod loader;

pub use error::{ConfigError, Layer, Section};
pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Log levels accepted by `logging.level`.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Root configuration of a pipeline.
///
/// Represents the fully merged configuration from all sources.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Memory manager configuration
    pub memory: MemoryConfig,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Synthetic reader configuration
    pub reader: ReaderConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Memory manager configuration.
///
/// # Example TOML
///
/// ```toml
/// [memory]
/// identifier = "system"
/// budget_mb = 4096
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Name of the memory manager in logs and status output
    pub identifier: String,

    /// Cache budget in MiB
    pub budget_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            identifier: "system".to_string(),
            budget_mb: 10 * 1024,
        }
    }
}

impl MemoryConfig {
    pub fn budget_kb(&self) -> u64 {
        self.budget_mb.saturating_mul(1024)
    }
}

/// Scheduler selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// Depth-first execution on the requesting thread
    Single,
    /// Traversal thread plus worker pool (default)
    #[default]
    Multi,
}

impl std::fmt::Display for SchedulerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Multi => write!(f, "multi"),
        }
    }
}

impl std::str::FromStr for SchedulerMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" | "single-threaded" => Ok(Self::Single),
            "multi" | "multi-threaded" => Ok(Self::Multi),
            _ => Err(ConfigError::invalid(
                Section::Scheduler,
                "mode",
                format!("unknown scheduler '{}', expected single or multi", s),
            )),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub mode: SchedulerMode,

    /// Worker threads (0 = available parallelism minus one)
    pub worker_threads: usize,

    /// Maximum number of concurrently running disk reader tasks
    pub max_disk_reader_tasks: usize,

    /// Maximum number of concurrently running GPU tasks
    pub max_gpu_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::default(),
            worker_threads: 0,
            max_disk_reader_tasks: 2,
            max_gpu_tasks: 1,
        }
    }
}

/// Grid size and latency of the synthetic reader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReaderConfig {
    pub nlon: usize,
    pub nlat: usize,
    pub nlev: usize,

    /// Artificial delay per production in milliseconds
    pub latency_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            nlon: 144,
            nlat: 73,
            nlev: 10,
            latency_ms: 0,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: LogFormat,

    /// Log file path (optional)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON structured logging
    Json,
}

/// CLI overrides for configuration values.
///
/// Used to apply command-line arguments over file-based config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override memory budget
    pub budget_mb: Option<u64>,

    /// Override scheduler mode
    pub scheduler_mode: Option<SchedulerMode>,

    /// Override worker thread count
    pub worker_threads: Option<usize>,

    /// Override log level
    pub log_level: Option<String>,

    /// Override log format
    pub log_format: Option<LogFormat>,
}

impl PipelineConfig {
    /// Apply CLI overrides to this configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(budget) = overrides.budget_mb {
            self.memory.budget_mb = budget;
        }

        if let Some(mode) = overrides.scheduler_mode {
            self.scheduler.mode = mode;
        }

        if let Some(workers) = overrides.worker_threads {
            self.scheduler.worker_threads = workers;
        }

        if let Some(ref level) = overrides.log_level {
            self.logging.level = level.clone();
        }

        if let Some(format) = overrides.log_format {
            self.logging.format = format;
        }
    }

    /// Reject settings that would leave the pipeline unable to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |section: Section, field: &'static str, value: u64| {
            if value == 0 {
                Err(ConfigError::invalid(section, field, "must be greater than zero"))
            } else {
                Ok(())
            }
        };

        if self.memory.identifier.is_empty() {
            return Err(ConfigError::invalid(
                Section::Memory,
                "identifier",
                "must not be empty",
            ));
        }
        positive(Section::Memory, "budget_mb", self.memory.budget_mb)?;
        positive(
            Section::Scheduler,
            "max_disk_reader_tasks",
            self.scheduler.max_disk_reader_tasks as u64,
        )?;
        positive(Section::Scheduler, "max_gpu_tasks", self.scheduler.max_gpu_tasks as u64)?;
        positive(Section::Reader, "nlon", self.reader.nlon as u64)?;
        positive(Section::Reader, "nlat", self.reader.nlat as u64)?;
        positive(Section::Reader, "nlev", self.reader.nlev as u64)?;

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid(
                Section::Logging,
                "level",
                format!(
                    "unknown level '{}', expected one of {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            ));
        }
        Ok(())
    }
}
