//! Data sources
//!
//! Every stage of a pipeline is a [`DataSource`]. Consumers follow the same
//! protocol for all of them:
//!
//! 1. subscribe to the source's completion events
//! 2. `request_data(R)`
//! 3. wait for `DataEvent::Completed(R)` (or `Failed`)
//! 4. `get_data(R)`, use the item, then exactly one `release_data(R)`
//!
//! [`DataGuard`] wraps step 4 for code that holds an item for a scope.
//!
//! The computation itself is supplied by a [`DataProducer`]; the two source
//! implementations decide when it runs:
//!
//! - [`MemoryManagedDataSource`] produces synchronously on `request_data`
//! - [`ScheduledDataSource`] builds a task graph and hands it to a scheduler

mod guard;
mod managed;
mod scheduled;

pub use guard::DataGuard;
pub use managed::{MemoryManagedCore, MemoryManagedDataSource};
pub use scheduled::{ScheduledDataSource, TaskGraphContext};

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::data_item::DataItem;
use crate::error::{PipelineError, Result};
use crate::request::Request;
use crate::task::{TaskClass, TaskId};

/// Completion notification of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEvent {
    /// The item for the request is available through `get_data`
    Completed(Request),
    /// The producer could not compute the item
    Failed { request: Request, reason: String },
}

impl DataEvent {
    pub fn request(&self) -> &Request {
        match self {
            DataEvent::Completed(request) => request,
            DataEvent::Failed { request, .. } => request,
        }
    }
}

/// Common interface of all pipeline stages.
pub trait DataSource: Send + Sync {
    /// Unique identifier; also scopes the memory manager keys of the source.
    fn id(&self) -> &str;

    /// Ask for the item of `request`. Completion is reported on the channel
    /// returned by [`subscribe`](Self::subscribe).
    fn request_data(&self, request: &Request) -> Result<()>;

    /// Access a completed item. Only valid between completion and release.
    fn get_data(&self, request: &Request) -> Result<Arc<DataItem>>;

    /// Drop the reservation taken by `request_data`.
    fn release_data(&self, request: &Request) -> Result<()>;

    fn release_item(&self, item: &DataItem) -> Result<()> {
        self.release_data(item.generating_request())
    }

    /// Reserve an already available item for `n` more consumers.
    fn reserve_data(&self, request: &Request, n: usize) -> Result<()>;

    /// Keys this source and all of its inputs need.
    fn required_keys(&self) -> Vec<String>;

    /// Keys this source itself needs.
    fn locally_required_keys(&self) -> Vec<String>;

    /// Receive completion events of requests issued after this call.
    fn subscribe(&self) -> Receiver<DataEvent>;
}

/// The computation behind a source.
///
/// Producers of a scheduled source run on worker threads and may be invoked
/// concurrently for different requests.
pub trait DataProducer: Send + Sync {
    /// Keys this stage needs in every request it handles.
    fn locally_required_keys(&self) -> Vec<String>;

    /// Compute the item for a request reduced to the required keys.
    fn produce_data(&self, request: &Request) -> Result<DataItem>;

    /// Build the task graph for `request`.
    ///
    /// Implementations create their task with [`TaskGraphContext::new_task`]
    /// and link one parent per input via `get_task_graph` on the input and
    /// [`TaskGraphContext::add_parent`]. A task received from an input must
    /// be linked before the next input is queried.
    fn create_task_graph(&self, ctx: &TaskGraphContext, request: &Request) -> Result<TaskId> {
        Ok(ctx.new_task(request.clone()))
    }

    /// Inputs registered when the source is built, as (prefix, source).
    fn input_sources(&self) -> Vec<(String, Arc<dyn DataSource>)> {
        Vec::new()
    }

    /// Default class of the tasks of this stage.
    fn task_class(&self) -> TaskClass {
        TaskClass::Compute
    }
}

/// Block until the source reports `request` as completed or failed.
///
/// Events for other requests are skipped.
pub fn wait_for_completion(
    events: &Receiver<DataEvent>,
    request: &Request,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(DataEvent::Completed(r)) if r == *request => return Ok(()),
            Ok(DataEvent::Failed { request: r, reason }) if r == *request => {
                return Err(PipelineError::produce_failed(r.request(), reason));
            }
            Ok(_) => continue,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return Err(PipelineError::Timeout {
                    request: request.request().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }
}
