//! Pipeline error types.

use thiserror::Error;

use crate::memory::MemoryError;

/// Errors raised while building or running a data pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A memory manager can only be assigned once per source
    #[error("memory manager of source '{source_id}' cannot be changed after it has been set")]
    MemoryManagerAlreadySet { source_id: String },

    /// The source has no memory manager yet
    #[error("source '{0}' has no memory manager")]
    MissingMemoryManager(String),

    /// A scheduler can only be assigned once per source
    #[error("scheduler of source '{source_id}' cannot be changed after it has been set")]
    SchedulerAlreadySet { source_id: String },

    /// The source has no scheduler yet
    #[error("source '{0}' has no scheduler")]
    MissingScheduler(String),

    /// The source is being dropped and cannot create tasks
    #[error("source '{0}' is no longer alive")]
    SourceDropped(String),

    /// A request lacks keys the source needs and no pass-through is set
    #[error("request '{request}' is missing required keys; required are: {required}")]
    MissingKeys { request: String, required: String },

    /// A producer could not produce the requested item
    #[error("failed to produce data for '{request}': {reason}")]
    ProduceFailed { request: String, reason: String },

    /// No completion event arrived in time
    #[error("timed out after {timeout_ms} ms waiting for '{request}'")]
    Timeout { request: String, timeout_ms: u64 },

    /// A task handle no longer refers to a live task
    #[error("task {0} does not exist")]
    TaskNotFound(u64),

    /// Memory manager contract violation
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl PipelineError {
    /// Create a new MissingKeys error.
    pub fn missing_keys(request: impl Into<String>, required: &[String]) -> Self {
        Self::MissingKeys {
            request: request.into(),
            required: required.join(";"),
        }
    }

    /// Create a new ProduceFailed error.
    pub fn produce_failed(request: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProduceFailed {
            request: request.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
