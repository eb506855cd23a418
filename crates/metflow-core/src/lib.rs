//! MetFlow Core - Request-driven dataflow engine for forecast data
//!
//! This crate provides the building blocks of a demand-driven pipeline:
//! - Requests: canonical key/value addresses of data items
//! - Memory management: reference-counted LRU cache with a size budget
//! - Task graphs: dependency DAGs built per request, with duplicate merging
//! - Schedulers: synchronous depth-first or multi-threaded execution
//! - Data sources: memory-managed and scheduled pipeline stages
//! - Producers: synthetic reader, ensemble mean and smoothing filters

pub mod data_item;
pub mod error;
pub mod events;
pub mod memory;
pub mod producers;
pub mod request;
pub mod scheduler;
pub mod source;
pub mod task;

// Re-exports for convenience
pub use data_item::{DataItem, DataPayload};
pub use error::{PipelineError, Result};
pub use events::EventHub;
pub use memory::{
    CacheMetrics, LruMemoryManager, MemoryError, MemoryManager, MemoryStatus,
    DEFAULT_MEMORY_LIMIT_KB,
};
pub use request::{keys, Request, RequestValue, Vec3};
pub use task::{Task, TaskClass, TaskGraph, TaskId};

// Scheduler re-exports
pub use scheduler::{MultiThreadScheduler, Scheduler, SchedulerLimits, SingleThreadScheduler};

// Source re-exports
pub use source::{
    wait_for_completion, DataEvent, DataGuard, DataProducer, DataSource, MemoryManagedCore,
    MemoryManagedDataSource, ScheduledDataSource, TaskGraphContext,
};

// Producer re-exports
pub use producers::{
    EnsembleMeanFilter, ForecastMetadata, GridSummary, SmoothFilter, StructuredGrid,
    SyntheticReader,
};
