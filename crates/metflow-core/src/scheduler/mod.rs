//! Task graph execution
//!
//! A scheduler receives the root of a task graph and runs every task once all
//! of its parents have run. Two strategies are available:
//!
//! - [`SingleThreadScheduler`]: depth-first on the calling thread
//! - [`MultiThreadScheduler`]: a traversal thread feeding a ready queue that a
//!   pool of workers drains, with duplicate detection and per-class caps

mod multi;
mod single;

pub use multi::MultiThreadScheduler;
pub use single::SingleThreadScheduler;

use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::EventHub;
use crate::request::Request;
use crate::task::{TaskGraph, TaskId};

/// Maximum number of concurrently running disk reader tasks
pub const DEFAULT_MAX_DISK_READER_TASKS: usize = 2;

/// Maximum number of concurrently running GPU tasks
pub const DEFAULT_MAX_GPU_TASKS: usize = 1;

/// Executes task graphs built by scheduled data sources.
pub trait Scheduler: Send + Sync {
    /// Arena shared by all sources using this scheduler.
    fn task_graph(&self) -> &Arc<TaskGraph>;

    /// Execute the graph above `root`.
    fn schedule_task_graph(&self, root: TaskId);

    /// Task that already handles `request` of the given source, if any.
    fn is_scheduled(&self, source_id: &str, request: &Request) -> Option<TaskId>;

    fn is_busy(&self) -> bool;

    /// Receive busy (`true`) / idle (`false`) transitions.
    fn subscribe_busy(&self) -> Receiver<bool>;
}

/// Concurrency limits of a [`MultiThreadScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerLimits {
    /// Worker threads; 0 selects available parallelism minus one
    pub worker_threads: usize,
    pub max_disk_reader_tasks: usize,
    pub max_gpu_tasks: usize,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            max_disk_reader_tasks: DEFAULT_MAX_DISK_READER_TASKS,
            max_gpu_tasks: DEFAULT_MAX_GPU_TASKS,
        }
    }
}

impl SchedulerLimits {
    /// Number of worker threads to start (at least one).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }
}

/// Busy flag with change notification.
#[derive(Debug, Default)]
pub(crate) struct BusySignal {
    busy: Mutex<bool>,
    listeners: EventHub<bool>,
}

impl BusySignal {
    pub(crate) fn get(&self) -> bool {
        *self.busy.lock()
    }

    /// Store the new state; listeners only hear about changes.
    pub(crate) fn set(&self, busy: bool) {
        self.update(|| busy);
    }

    /// Recompute the state while holding the flag.
    pub(crate) fn update(&self, compute: impl FnOnce() -> bool) {
        let mut current = self.busy.lock();
        let busy = compute();
        if *current != busy {
            *current = busy;
            debug!("Scheduler is {}", if busy { "busy" } else { "idle" });
            self.listeners.emit(busy);
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<bool> {
        self.listeners.subscribe()
    }
}
