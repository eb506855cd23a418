//! Task graph arena
//!
//! A task is the unit of work a scheduler executes: one request handled by one
//! scheduled data source. Tasks depend on parent tasks (their inputs) and are
//! consumed by child tasks. All tasks of a pipeline live in a shared
//! [`TaskGraph`] and reference each other through [`TaskId`] handles, so the
//! links can be rewritten concurrently without owning pointers.
//!
//! Lifecycle of a task:
//!
//! ```text
//! created ──► scheduled (child count snapshot) ──► dequeued (no parents)
//!                  │                                      │
//!                  └─► duplicate: children redirected,    ▼
//!                      unscheduled ancestry deleted     run ──► removed
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::request::Request;
use crate::source::{DataSource, ScheduledDataSource};

/// Handle of a task inside a [`TaskGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Resource class of a task; scheduler caps apply per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    #[default]
    Compute,
    /// Reads from disk; concurrent disk access is throttled
    DiskReader,
    /// Needs the (single) GPU context
    Gpu,
}

/// Identity of a unit of work: (source id, task request).
pub(crate) type TaskKey = (String, String);

/// Child links plus the bookkeeping for memory reservations.
#[derive(Debug, Default)]
struct ChildLinks {
    children: Vec<TaskId>,
    /// Number of children when the task was scheduled
    at_schedule: usize,
    /// Explicit reservations for consumers that are not child tasks
    additional: usize,
    /// Requesters that received this task and have not linked to it yet
    pending_links: usize,
}

/// Input request whose memory reservation the task is responsible for.
struct InputRequest {
    parent: Option<TaskId>,
    source: Arc<ScheduledDataSource>,
    request: Request,
}

#[derive(Default)]
struct InputRequests {
    with_parents: Vec<InputRequest>,
    without_parents: Vec<InputRequest>,
}

/// A request to be processed by a scheduled data source.
pub struct Task {
    id: TaskId,
    request: Request,
    source: Arc<ScheduledDataSource>,
    valid: bool,
    scheduled: AtomicBool,
    gpu_task: AtomicBool,
    disk_reader_task: AtomicBool,
    parents: Mutex<Vec<TaskId>>,
    children: Mutex<ChildLinks>,
    links_changed: Condvar,
    inputs: Mutex<InputRequests>,
}

impl Task {
    fn new(id: TaskId, request: Request, source: Arc<ScheduledDataSource>, valid: bool) -> Self {
        let class = source.task_class();
        Self {
            id,
            request,
            source,
            valid,
            scheduled: AtomicBool::new(false),
            gpu_task: AtomicBool::new(class == TaskClass::Gpu),
            disk_reader_task: AtomicBool::new(class == TaskClass::DiskReader),
            parents: Mutex::new(Vec::new()),
            children: Mutex::new(ChildLinks::default()),
            links_changed: Condvar::new(),
            inputs: Mutex::new(InputRequests::default()),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Source whose `process_request` runs this task.
    pub fn source(&self) -> &Arc<ScheduledDataSource> {
        &self.source
    }

    /// An invalid task only signals "already cached"; it is never executed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::SeqCst)
    }

    /// Mark the task as scheduled and remember how many children it has.
    ///
    /// Children linked after this point are consumers that need their own
    /// memory reservation when the result is stored.
    pub fn set_scheduled(&self) {
        let mut links = self.children.lock();
        self.scheduled.store(true, Ordering::SeqCst);
        links.at_schedule = links.children.len();
    }

    pub fn is_gpu_task(&self) -> bool {
        self.gpu_task.load(Ordering::Relaxed)
    }

    pub fn set_gpu_task(&self, gpu: bool) {
        self.gpu_task.store(gpu, Ordering::Relaxed);
    }

    pub fn is_disk_reader_task(&self) -> bool {
        self.disk_reader_task.load(Ordering::Relaxed)
    }

    pub fn set_disk_reader_task(&self, disk: bool) {
        self.disk_reader_task.store(disk, Ordering::Relaxed);
    }

    pub fn class(&self) -> TaskClass {
        if self.is_disk_reader_task() {
            TaskClass::DiskReader
        } else if self.is_gpu_task() {
            TaskClass::Gpu
        } else {
            TaskClass::Compute
        }
    }

    /// Locked view of the parent list.
    pub fn parents(&self) -> MutexGuard<'_, Vec<TaskId>> {
        self.parents.lock()
    }

    /// Locked view of the child list.
    pub fn children(&self) -> MappedMutexGuard<'_, Vec<TaskId>> {
        MutexGuard::map(self.children.lock(), |links| &mut links.children)
    }

    pub fn has_parents(&self) -> bool {
        !self.parents.lock().is_empty()
    }

    pub fn num_parents(&self) -> usize {
        self.parents.lock().len()
    }

    pub fn has_children(&self) -> bool {
        !self.children.lock().children.is_empty()
    }

    pub fn num_children(&self) -> usize {
        self.children.lock().children.len()
    }

    /// Reservations to issue in addition to the one made by storing the result.
    ///
    /// Blocks while a requester that received this task through
    /// [`lock_child_access_until_new_child`](Self::lock_child_access_until_new_child)
    /// has not linked itself yet.
    pub fn num_additional_memory_reservations(&self) -> usize {
        let mut links = self.children.lock();
        while links.pending_links > 0 {
            self.links_changed.wait(&mut links);
        }
        (links.additional + links.children.len()).saturating_sub(links.at_schedule)
    }

    /// Reserve the result for `n` more consumers that are not child tasks.
    ///
    /// Counts as the link of a pending requester, if there is one.
    pub fn add_additional_memory_reservation(&self, n: usize) {
        let mut links = self.children.lock();
        links.additional += n;
        if links.pending_links > 0 {
            links.pending_links -= 1;
            self.links_changed.notify_all();
        }
    }

    /// Extra reservation for a merged duplicate root task.
    pub(crate) fn add_duplicate_reservation(&self) {
        self.children.lock().additional += 1;
    }

    /// Hold back reservation counting until the caller has linked a new child
    /// or added an explicit reservation.
    pub fn lock_child_access_until_new_child(&self) {
        self.children.lock().pending_links += 1;
    }

    fn add_child(&self, child: TaskId, consumes_pending_link: bool) {
        let mut links = self.children.lock();
        links.children.push(child);
        if consumes_pending_link && links.pending_links > 0 {
            links.pending_links -= 1;
            self.links_changed.notify_all();
        }
    }

    fn remove_child(&self, child: TaskId) {
        self.children.lock().children.retain(|c| *c != child);
    }

    fn remove_parent(&self, parent: TaskId) {
        self.parents.lock().retain(|p| *p != parent);
    }

    /// Execute the task on its source.
    pub fn run(&self) {
        self.source.process_request(&self.request, self);
    }

    /// Release every input this task reserved. Each input is released once.
    pub fn cancel_all_input_requests(&self) {
        let inputs = std::mem::take(&mut *self.inputs.lock());
        for input in inputs.with_parents.iter().chain(&inputs.without_parents) {
            release_input(input);
        }
    }

    /// Release the inputs that were already cached when the task was built.
    pub fn cancel_input_requests_without_parents(&self) {
        let inputs = std::mem::take(&mut self.inputs.lock().without_parents);
        for input in &inputs {
            release_input(input);
        }
    }

    /// Release inputs whose parent task already executed and detached itself.
    fn cancel_detached_input_requests(&self) {
        let parents = self.parents.lock().clone();
        let detached: Vec<InputRequest> = {
            let mut inputs = self.inputs.lock();
            let (detached, linked): (Vec<InputRequest>, Vec<InputRequest>) =
                std::mem::take(&mut inputs.with_parents)
                .into_iter()
                .partition(|input| input.parent.is_some_and(|p| !parents.contains(&p)));
            inputs.with_parents = linked;
            detached
        };
        for input in &detached {
            release_input(input);
        }
    }

    pub(crate) fn key(&self) -> TaskKey {
        (self.source.id().to_string(), self.request.request().to_string())
    }
}

fn release_input(input: &InputRequest) {
    if let Err(e) = input.source.release_data(&input.request) {
        warn!(
            "Failed to release input {} of source {}: {}",
            input.request,
            input.source.id(),
            e
        );
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("source", &self.source.id())
            .field("request", &self.request.request())
            .field("valid", &self.valid)
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

/// Arena of all live tasks of a pipeline.
///
/// Tasks are shared as `Arc<Task>`; a task stays alive while a worker executes
/// it even if it has been removed from the arena.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: DashMap<TaskId, Arc<Task>>,
    next_id: AtomicU64,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a task to be executed by `source`.
    pub fn create_task(&self, request: Request, source: Arc<ScheduledDataSource>) -> TaskId {
        self.insert(request, source, true)
    }

    /// Create a marker task for a request that is already cached.
    pub fn create_invalid_task(&self, request: Request, source: Arc<ScheduledDataSource>) -> TaskId {
        self.insert(request, source, false)
    }

    fn insert(&self, request: Request, source: Arc<ScheduledDataSource>, valid: bool) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.tasks
            .insert(id, Arc::new(Task::new(id, request, source, valid)));
        id
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn task(&self, id: TaskId) -> Result<Arc<Task>> {
        self.get(id)
            .ok_or_else(|| PipelineError::TaskNotFound(id.as_u64()))
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Make `parent` an input of `child`.
    ///
    /// A valid parent is linked and its request remembered, so that it can
    /// be released if `child` is cancelled. An invalid parent (cached input)
    /// is removed from the arena right away; only its request is remembered.
    pub fn add_parent(&self, child: TaskId, parent: TaskId) -> Result<()> {
        let child_task = self.task(child)?;
        let parent_task = self.task(parent)?;

        let input = InputRequest {
            parent: parent_task.is_valid().then_some(parent),
            source: Arc::clone(parent_task.source()),
            request: parent_task.request().clone(),
        };

        if parent_task.is_valid() {
            child_task.parents.lock().push(parent);
            parent_task.add_child(child, true);
            child_task.inputs.lock().with_parents.push(input);
        } else {
            child_task.inputs.lock().without_parents.push(input);
            self.tasks.remove(&parent);
        }
        Ok(())
    }

    /// Replace `old` by `new` in the parent list of `child`.
    pub fn exchange_parent(&self, child: TaskId, old: TaskId, new: TaskId) -> Result<()> {
        let child_task = self.task(child)?;
        let new_task = self.task(new)?;
        {
            let mut parents = child_task.parents.lock();
            parents.retain(|p| *p != old);
            parents.push(new);
        }
        {
            let mut inputs = child_task.inputs.lock();
            for input in inputs.with_parents.iter_mut() {
                if input.parent == Some(old) {
                    input.parent = Some(new);
                }
            }
        }
        new_task.add_child(child, false);
        Ok(())
    }

    /// Sever all links of a task in both directions.
    pub fn remove_from_task_graph(&self, id: TaskId) {
        let Some(task) = self.get(id) else {
            return;
        };

        let parents = std::mem::take(&mut *task.parents.lock());
        for parent in parents {
            if let Some(parent_task) = self.get(parent) {
                parent_task.remove_child(id);
            }
        }

        let children = std::mem::take(&mut task.children.lock().children);
        for child in children {
            if let Some(child_task) = self.get(child) {
                child_task.remove_parent(id);
            }
        }
    }

    /// Remove a task from the arena without touching its links.
    pub fn remove(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.remove(&id).map(|(_, task)| task)
    }

    /// Unlink and remove a task.
    pub fn discard(&self, id: TaskId) {
        self.remove_from_task_graph(id);
        self.remove(id);
    }

    /// Delete a task and all of its ancestors that are not scheduled yet.
    ///
    /// Scheduled ancestors belong to another task graph and are kept. Inputs
    /// that were reserved without a task (cached during construction, or
    /// produced by a parent that already finished) are released.
    pub(crate) fn delete_unscheduled_task_graph(&self, id: TaskId) {
        let Some(task) = self.get(id) else {
            return;
        };
        if task.is_scheduled() {
            return;
        }

        // Must run while the remaining parent links are intact.
        task.cancel_detached_input_requests();

        let parents = task.parents().clone();
        for parent in parents {
            self.delete_unscheduled_task_graph(parent);
        }

        self.remove_from_task_graph(id);
        task.cancel_input_requests_without_parents();
        self.remove(id);
    }

    /// Drop every task. Used on scheduler shutdown for abandoned work.
    pub fn clear(&self) {
        self.tasks.clear();
    }

    /// Log the graph above `root` at debug level.
    pub fn print_depth_first(&self, root: TaskId) {
        debug!("Printing task graph =======================");
        self.print_level(root, 0);
        debug!("Print of task graph finished. =======================");
    }

    fn print_level(&self, id: TaskId, level: usize) {
        let Some(task) = self.get(id) else {
            return;
        };
        debug!(
            "Level {}: {} {} / {}",
            level,
            id,
            task.source().id(),
            task.request()
        );
        let parents = task.parents().clone();
        for parent in parents {
            self.print_level(parent, level + 1);
        }
    }

    /// Export the graph above `root` with edges pointing from parent to child.
    pub fn snapshot(&self, root: TaskId) -> DiGraph<String, ()> {
        let mut graph = DiGraph::new();
        let mut nodes: HashMap<TaskId, NodeIndex> = HashMap::new();
        let mut stack = vec![root];

        while let Some(id) = stack.pop() {
            let Some(task) = self.get(id) else {
                continue;
            };
            let child_node = *nodes.entry(id).or_insert_with(|| {
                graph.add_node(format!("{} {}: {}", id, task.source().id(), task.request()))
            });

            let parents = task.parents().clone();
            for parent in parents {
                let Some(parent_task) = self.get(parent) else {
                    continue;
                };
                let parent_node = match nodes.get(&parent) {
                    Some(node) => *node,
                    None => {
                        let node = graph.add_node(format!(
                            "{} {}: {}",
                            parent,
                            parent_task.source().id(),
                            parent_task.request()
                        ));
                        nodes.insert(parent, node);
                        stack.push(parent);
                        node
                    }
                };
                graph.add_edge(parent_node, child_node, ());
            }
        }

        graph
    }
}
