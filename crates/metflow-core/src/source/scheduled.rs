//! Scheduled sources
//!
//! A [`ScheduledDataSource`] turns a request into a task graph: its own task
//! plus, recursively, the tasks of its inputs. Items that are already cached
//! or already scheduled are reused instead of producing new tasks. The graph
//! is executed by the scheduler; each task calls back into
//! [`ScheduledDataSource::process_request`].

use std::sync::{Arc, Weak};

use crossbeam_channel::Receiver;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use super::{DataEvent, DataProducer, DataSource, MemoryManagedCore};
use crate::data_item::DataItem;
use crate::error::{PipelineError, Result};
use crate::events::EventHub;
use crate::memory::MemoryManager;
use crate::request::{keys, Request};
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskClass, TaskGraph, TaskId};

/// Handle passed to [`DataProducer::create_task_graph`].
///
/// Remembers the tasks it creates so that a graph whose construction fails
/// halfway can be torn down again.
pub struct TaskGraphContext {
    source: Arc<ScheduledDataSource>,
    graph: Arc<TaskGraph>,
    created: Mutex<Vec<TaskId>>,
}

impl TaskGraphContext {
    fn new(source: Arc<ScheduledDataSource>, graph: Arc<TaskGraph>) -> Self {
        Self {
            source,
            graph,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Create a task of the source being asked.
    pub fn new_task(&self, request: Request) -> TaskId {
        let id = self.graph.create_task(request, Arc::clone(&self.source));
        self.created.lock().push(id);
        id
    }

    /// Delete everything built through this context, releasing the inputs
    /// its tasks had already reserved.
    fn discard_created(&self) {
        let created = std::mem::take(&mut *self.created.lock());
        // Sinks first: a task releases its inputs while its parent links are
        // still in place.
        for &id in &created {
            if self.graph.get(id).is_some_and(|t| !t.has_children()) {
                self.graph.delete_unscheduled_task_graph(id);
            }
        }
        for &id in &created {
            self.graph.delete_unscheduled_task_graph(id);
        }
    }

    /// Make `parent` an input of `child`.
    pub fn add_parent(&self, child: TaskId, parent: TaskId) -> Result<()> {
        self.graph.add_parent(child, parent)
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn source(&self) -> &Arc<ScheduledDataSource> {
        &self.source
    }
}

/// Memory-managed source whose work is executed by a scheduler.
pub struct ScheduledDataSource {
    core: MemoryManagedCore,
    producer: Box<dyn DataProducer>,
    scheduler: OnceCell<Arc<dyn Scheduler>>,
    scheduled_pass_through: RwLock<Option<Arc<ScheduledDataSource>>>,
    /// Serializes "is it cached / is it scheduled" against storing results
    result_mutex: Mutex<()>,
    events: EventHub<DataEvent>,
    task_class: TaskClass,
    this: Weak<ScheduledDataSource>,
}

impl ScheduledDataSource {
    /// Build a source around a producer and register the producer's inputs.
    pub fn new(name: &str, producer: impl DataProducer + 'static) -> Arc<Self> {
        let core = MemoryManagedCore::new(name, producer.locally_required_keys());
        for (prefix, input) in producer.input_sources() {
            core.register_input_source(input, &prefix);
        }
        let task_class = producer.task_class();

        Arc::new_cyclic(|this| Self {
            core,
            producer: Box::new(producer),
            scheduler: OnceCell::new(),
            scheduled_pass_through: RwLock::new(None),
            result_mutex: Mutex::new(()),
            events: EventHub::new(),
            task_class,
            this: this.clone(),
        })
    }

    pub fn core(&self) -> &MemoryManagedCore {
        &self.core
    }

    pub fn producer(&self) -> &dyn DataProducer {
        self.producer.as_ref()
    }

    pub fn task_class(&self) -> TaskClass {
        self.task_class
    }

    pub fn set_memory_manager(&self, manager: Arc<dyn MemoryManager>) -> Result<()> {
        self.core.set_memory_manager(manager)
    }

    pub fn memory_manager(&self) -> Result<&Arc<dyn MemoryManager>> {
        self.core.memory_manager()
    }

    /// Assign the scheduler. It cannot be changed afterwards.
    pub fn set_scheduler(&self, scheduler: Arc<dyn Scheduler>) -> Result<()> {
        self.scheduler
            .set(scheduler)
            .map_err(|_| PipelineError::SchedulerAlreadySet {
                source_id: self.core.id().to_string(),
            })
    }

    pub fn scheduler(&self) -> Result<&Arc<dyn Scheduler>> {
        self.scheduler
            .get()
            .ok_or_else(|| PipelineError::MissingScheduler(self.core.id().to_string()))
    }

    pub fn register_input_source(&self, source: Arc<dyn DataSource>, prefix: &str) {
        self.core.register_input_source(source, prefix);
    }

    pub fn deregister_prefixed_input_sources(&self) {
        self.core.deregister_prefixed_input_sources();
    }

    pub fn get_prefixed_data_source(&self, prefix: &str) -> Option<Arc<dyn DataSource>> {
        self.core.get_prefixed_data_source(prefix)
    }

    /// Forward requests lacking a locally required key to `next`.
    pub fn enable_pass_through(&self, next: Arc<ScheduledDataSource>) {
        self.core.enable_pass_through(next.clone());
        *self.scheduled_pass_through.write() = Some(next);
    }

    fn scheduled_pass_through(&self) -> Option<Arc<ScheduledDataSource>> {
        self.scheduled_pass_through.read().clone()
    }

    fn this(&self) -> Result<Arc<ScheduledDataSource>> {
        self.this
            .upgrade()
            .ok_or_else(|| PipelineError::SourceDropped(self.core.id().to_string()))
    }

    /// Task that delivers the item for `request`.
    ///
    /// Returns an invalid task if the item is cached (and now blocked for the
    /// caller), an already scheduled task if one computes the same request,
    /// or the root of a new task graph. A returned scheduled task waits for
    /// the caller: link it as parent or add a memory reservation before
    /// requesting the next task.
    pub fn get_task_graph(&self, request: &Request) -> Result<TaskId> {
        let scheduler = self.scheduler()?;
        let graph = scheduler.task_graph();

        if !self.core.handles(request) {
            let Some(next) = self.scheduled_pass_through() else {
                let err =
                    PipelineError::missing_keys(request.request(), self.core.locally_required_keys());
                error!("{}", err);
                return Err(err);
            };

            let this = self.this()?;
            let upstream = next.get_task_graph(request)?;
            let upstream_valid = graph.get(upstream).is_some_and(|t| t.is_valid());
            if !upstream_valid {
                return Ok(upstream);
            }

            let pass = graph.create_task(request.clone().with(keys::PASS, ""), this);
            graph.add_parent(pass, upstream)?;
            return Ok(pass);
        }

        let filtered = self.core.filter_request(request);
        let manager = self.core.memory_manager()?;
        {
            let _result = self.result_mutex.lock();
            if manager.contains_data(self.id(), &filtered) {
                trace!("{}: {} is cached", self.id(), filtered);
                return Ok(graph.create_invalid_task(request.clone(), self.this()?));
            }
            if let Some(existing) = scheduler.is_scheduled(self.id(), request) {
                if let Some(task) = graph.get(existing) {
                    debug!("{}: reusing already scheduled task {} for {}", self.id(), existing, request);
                    task.lock_child_access_until_new_child();
                    return Ok(existing);
                }
            }
        }

        let ctx = TaskGraphContext::new(self.this()?, Arc::clone(graph));
        self.producer.create_task_graph(&ctx, request).inspect_err(|e| {
            debug!("{}: discarding partial task graph for {}: {}", self.id(), request, e);
            ctx.discard_created();
        })
    }

    /// Execute a task of this source.
    ///
    /// Called by the scheduler once all parents have run. Never fails; errors
    /// are reported as [`DataEvent::Failed`].
    pub fn process_request(&self, request: &Request, task: &Task) {
        if request.contains(keys::PASS) {
            let mut forwarded = request.clone();
            forwarded.remove(keys::PASS);
            let Some(next) = self.core.pass_through() else {
                let err = PipelineError::missing_keys(
                    forwarded.request(),
                    self.core.locally_required_keys(),
                );
                self.fail(&forwarded, &err);
                return;
            };
            // The upstream task failed if it stored nothing.
            if let Err(e) = next.get_data(&forwarded) {
                self.fail(&forwarded, &e);
                return;
            }
            let extra = task.num_additional_memory_reservations();
            if extra > 0 {
                if let Err(e) = next.reserve_data(&forwarded, extra) {
                    warn!("{}: could not reserve {} for pass-through: {}", self.id(), forwarded, e);
                }
            }
            self.events.emit(DataEvent::Completed(forwarded));
            return;
        }

        let manager = match self.core.memory_manager() {
            Ok(manager) => manager,
            Err(e) => {
                self.fail(request, &e);
                return;
            }
        };
        let filtered = self.core.filter_request(request);

        // A duplicate task may run after its twin stored the item.
        if manager.contains_data(self.id(), &filtered) {
            debug!("{}: {} already stored, skipping production", self.id(), filtered);
            for _ in 0..task.num_additional_memory_reservations() {
                manager.contains_data(self.id(), &filtered);
            }
            task.cancel_all_input_requests();
            self.events.emit(DataEvent::Completed(request.clone()));
            return;
        }

        match self.producer.produce_data(&filtered) {
            Ok(mut item) => {
                item.set_generating_request(filtered.clone());
                {
                    let _result = self.result_mutex.lock();
                    if !manager.store_data(self.id(), item) {
                        debug!("{}: {} was stored concurrently", self.id(), filtered);
                    }
                    for _ in 0..task.num_additional_memory_reservations() {
                        manager.contains_data(self.id(), &filtered);
                    }
                }
                self.events.emit(DataEvent::Completed(request.clone()));
            }
            Err(e) => self.fail(request, &e),
        }
    }

    fn fail(&self, request: &Request, e: &PipelineError) {
        error!("{}: processing {} failed: {}", self.id(), request, e);
        self.events.emit(DataEvent::Failed {
            request: request.clone(),
            reason: e.to_string(),
        });
    }
}

impl DataSource for ScheduledDataSource {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn request_data(&self, request: &Request) -> Result<()> {
        let scheduler = self.scheduler()?;
        let graph = scheduler.task_graph();

        let id = self.get_task_graph(request)?;
        let task = graph
            .get(id)
            .ok_or_else(|| PipelineError::TaskNotFound(id.as_u64()))?;

        if task.is_valid() {
            if task.is_scheduled() {
                task.add_additional_memory_reservation(1);
            } else {
                scheduler.schedule_task_graph(id);
            }
        } else {
            graph.remove(id);
            self.events.emit(DataEvent::Completed(request.clone()));
        }
        Ok(())
    }

    fn get_data(&self, request: &Request) -> Result<Arc<DataItem>> {
        self.core.get_data(request)
    }

    fn release_data(&self, request: &Request) -> Result<()> {
        self.core.release_data(request)
    }

    fn reserve_data(&self, request: &Request, n: usize) -> Result<()> {
        self.core.reserve_data(request, n)
    }

    fn required_keys(&self) -> Vec<String> {
        self.core.required_keys()
    }

    fn locally_required_keys(&self) -> Vec<String> {
        self.core.locally_required_keys().to_vec()
    }

    fn subscribe(&self) -> Receiver<DataEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for ScheduledDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledDataSource")
            .field("id", &self.core.id())
            .field("task_class", &self.task_class)
            .finish_non_exhaustive()
    }
}
