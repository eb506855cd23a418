//! Multi-threaded scheduler
//!
//! One traversal thread moves incoming task graphs into a ready queue,
//! depth-first so that parents precede their children. Tasks that duplicate
//! an enqueued task (same source and request) are merged into it. A pool of
//! worker threads repeatedly takes the first queued task without parents,
//! runs it and unlinks it from the graph.
//!
//! Lock order: graph queue, then task queue, then task locks.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use super::{BusySignal, Scheduler, SchedulerLimits};
use crate::request::Request;
use crate::source::DataSource;
use crate::task::{Task, TaskClass, TaskGraph, TaskId, TaskKey};

/// Ready queue plus admission bookkeeping, guarded as one unit.
#[derive(Default)]
struct TaskQueue {
    tasks: Vec<TaskId>,
    enqueued: HashMap<TaskKey, TaskId>,
    active: HashMap<TaskKey, (TaskId, TaskClass)>,
    active_disk_reader_tasks: usize,
    active_gpu_tasks: usize,
}

impl TaskQueue {
    fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Enqueue the unscheduled part of the graph above `id`, parents first.
    fn traverse_and_enqueue(&mut self, graph: &TaskGraph, id: TaskId) {
        let Some(task) = graph.get(id) else {
            return;
        };
        // Part of a graph that has been scheduled before.
        if task.is_scheduled() {
            return;
        }

        let key = task.key();
        if let Some(&duplicate) = self.enqueued.get(&key) {
            debug!(
                "Scheduler discarding duplicate task {} of {}: {}",
                id,
                task.source().id(),
                task.request()
            );
            let children = task.children().clone();
            if children.is_empty() {
                if let Some(duplicate_task) = graph.get(duplicate) {
                    duplicate_task.add_duplicate_reservation();
                }
            } else {
                for child in children {
                    if let Err(e) = graph.exchange_parent(child, id, duplicate) {
                        warn!("Could not redirect task {} to {}: {}", child, duplicate, e);
                    }
                }
            }
            graph.delete_unscheduled_task_graph(id);
            return;
        }

        let parents = task.parents().clone();
        for parent in parents {
            self.traverse_and_enqueue(graph, parent);
        }

        self.tasks.push(id);
        self.enqueued.insert(key, id);
        task.set_scheduled();
    }

    /// Take the first task without parents that may start now.
    ///
    /// Skipped: tasks whose twin is currently executing, and disk reader or
    /// GPU tasks whose class is at its cap.
    fn dequeue_first_ready(
        &mut self,
        graph: &TaskGraph,
        limits: &SchedulerLimits,
    ) -> Option<Arc<Task>> {
        let mut i = 0;
        while i < self.tasks.len() {
            let id = self.tasks[i];
            let Some(task) = graph.get(id) else {
                warn!("Dropping task {} from the queue; it no longer exists", id);
                self.tasks.remove(i);
                self.enqueued.retain(|_, queued| *queued != id);
                continue;
            };

            if task.has_parents() {
                i += 1;
                continue;
            }

            let key = task.key();
            if self.active.contains_key(&key) {
                i += 1;
                continue;
            }

            let class = task.class();
            match class {
                TaskClass::DiskReader => {
                    if self.active_disk_reader_tasks >= limits.max_disk_reader_tasks {
                        i += 1;
                        continue;
                    }
                    self.active_disk_reader_tasks += 1;
                }
                TaskClass::Gpu => {
                    if self.active_gpu_tasks >= limits.max_gpu_tasks {
                        i += 1;
                        continue;
                    }
                    self.active_gpu_tasks += 1;
                }
                TaskClass::Compute => {}
            }

            self.tasks.remove(i);
            if self.enqueued.get(&key) == Some(&id) {
                self.enqueued.remove(&key);
            }
            self.active.insert(key, (id, class));
            return Some(task);
        }
        None
    }

    fn finish(&mut self, task: &Task) {
        if let Some((_, class)) = self.active.remove(&task.key()) {
            match class {
                TaskClass::DiskReader => {
                    self.active_disk_reader_tasks = self.active_disk_reader_tasks.saturating_sub(1)
                }
                TaskClass::Gpu => self.active_gpu_tasks = self.active_gpu_tasks.saturating_sub(1),
                TaskClass::Compute => {}
            }
        }
    }

    fn lookup(&self, key: &TaskKey) -> Option<TaskId> {
        self.enqueued
            .get(key)
            .copied()
            .or_else(|| self.active.get(key).map(|(id, _)| *id))
    }

    fn describe(&self, graph: &TaskGraph) -> String {
        let mut s = String::from("\n\nTASK QUEUE:\n\n");
        for id in &self.tasks {
            let Some(task) = graph.get(*id) else {
                continue;
            };
            let parents = task.parents().clone();
            let children = task.children().clone();
            let _ = writeln!(
                s,
                "* task {} [children: {}, {:?}][parents: {}, {:?}]\n    > data source {}: request {}",
                id,
                children.len(),
                children,
                parents.len(),
                parents,
                task.source().id(),
                task.request()
            );
        }
        s
    }
}

struct Shared {
    graph: Arc<TaskGraph>,
    graph_queue: Mutex<VecDeque<TaskId>>,
    graph_queue_changed: Condvar,
    queue: Mutex<TaskQueue>,
    queue_changed: Condvar,
    exit: AtomicBool,
    busy: BusySignal,
    limits: SchedulerLimits,
}

impl Shared {
    fn exiting(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    fn update_busy_status(&self) {
        self.busy.update(|| {
            let graphs = self.graph_queue.lock();
            let queue = self.queue.lock();
            queue.active_count() > 0 || !graphs.is_empty() || !queue.tasks.is_empty()
        });
    }
}

/// Executes task graphs on a pool of worker threads.
///
/// Sources keep the scheduler alive through the tasks they create, so call
/// [`shutdown`](Self::shutdown) when the pipeline is no longer needed. Queued
/// tasks that have not started are abandoned.
pub struct MultiThreadScheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MultiThreadScheduler {
    /// Start the traversal thread and the worker pool.
    pub fn new(limits: SchedulerLimits) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            graph: Arc::new(TaskGraph::new()),
            graph_queue: Mutex::new(VecDeque::new()),
            graph_queue_changed: Condvar::new(),
            queue: Mutex::new(TaskQueue::default()),
            queue_changed: Condvar::new(),
            exit: AtomicBool::new(false),
            busy: BusySignal::default(),
            limits,
        });
        let scheduler = Self {
            shared,
            threads: Mutex::new(Vec::new()),
        };

        let workers = limits.resolved_worker_threads();
        debug!(
            "Initializing multithread scheduler: {} workers, {} disk reader / {} GPU tasks at most",
            workers, limits.max_disk_reader_tasks, limits.max_gpu_tasks
        );

        let shared = Arc::clone(&scheduler.shared);
        scheduler.spawn("metflow-traversal".to_string(), move || traversal_loop(shared))?;
        for index in 0..workers {
            let shared = Arc::clone(&scheduler.shared);
            scheduler.spawn(format!("metflow-worker-{}", index), move || {
                worker_loop(shared, index)
            })?;
        }

        Ok(scheduler)
    }

    pub fn with_default_limits() -> io::Result<Self> {
        Self::new(SchedulerLimits::default())
    }

    fn spawn(&self, name: String, f: impl FnOnce() + Send + 'static) -> io::Result<()> {
        let handle = thread::Builder::new().name(name).spawn(f)?;
        self.threads.lock().push(handle);
        Ok(())
    }

    pub fn limits(&self) -> &SchedulerLimits {
        &self.shared.limits
    }

    /// Stop all threads and drop abandoned tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.exit.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Asking scheduler threads to finish...");

        {
            let _graphs = self.shared.graph_queue.lock();
            self.shared.graph_queue_changed.notify_all();
        }
        {
            let _queue = self.shared.queue.lock();
            self.shared.queue_changed.notify_all();
        }

        let current = thread::current().id();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            // The last reference may be dropped by a worker itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("A scheduler thread panicked");
            }
        }

        let abandoned = self.shared.graph.len();
        if abandoned > 0 {
            debug!("Abandoning {} unfinished tasks", abandoned);
        }
        self.shared.graph.clear();
        self.shared.busy.set(false);
    }

    /// Log the ready queue at debug level.
    pub fn debug_print_task_queue(&self) {
        let queue = self.shared.queue.lock();
        debug!("{}", queue.describe(&self.shared.graph));
    }
}

impl Scheduler for MultiThreadScheduler {
    fn task_graph(&self) -> &Arc<TaskGraph> {
        &self.shared.graph
    }

    fn schedule_task_graph(&self, root: TaskId) {
        if let Some(task) = self.shared.graph.get(root) {
            debug!("Scheduling task graph for execution: {}", task.request());
        }
        self.shared.graph_queue.lock().push_back(root);
        self.shared.update_busy_status();
        self.shared.graph_queue_changed.notify_all();
    }

    fn is_scheduled(&self, source_id: &str, request: &Request) -> Option<TaskId> {
        let mut graphs = self.shared.graph_queue.lock();
        let mut queue = self.shared.queue.lock();

        // Graphs scheduled but not traversed yet must be visible here.
        let mut traversed = false;
        while let Some(root) = graphs.pop_front() {
            trace!("Forcing traversal of task graph {} in is_scheduled()", root);
            queue.traverse_and_enqueue(&self.shared.graph, root);
            traversed = true;
        }

        let found = queue.lookup(&(source_id.to_string(), request.request().to_string()));
        drop(queue);
        drop(graphs);

        if traversed {
            self.shared.queue_changed.notify_all();
        }
        found
    }

    fn is_busy(&self) -> bool {
        self.shared.busy.get()
    }

    fn subscribe_busy(&self) -> Receiver<bool> {
        self.shared.busy.subscribe()
    }
}

impl Drop for MultiThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn traversal_loop(shared: Arc<Shared>) {
    let mut graphs = shared.graph_queue.lock();
    loop {
        if shared.exiting() {
            break;
        }
        if let Some(root) = graphs.pop_front() {
            let mut queue = shared.queue.lock();
            queue.traverse_and_enqueue(&shared.graph, root);
            trace!("{}", queue.describe(&shared.graph));
            drop(queue);
            shared.queue_changed.notify_all();
            continue;
        }
        shared.graph_queue_changed.wait(&mut graphs);
    }
    debug!("Scheduler task graph traversal thread finished");
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            match next_task(&shared, &mut queue) {
                Some(task) => task,
                None => break,
            }
        };

        trace!("Worker {} runs task {}", index, task.id());
        task.run();

        {
            let mut queue = shared.queue.lock();
            queue.finish(&task);
            shared.graph.discard(task.id());
        }
        shared.queue_changed.notify_all();
    }
    debug!("Scheduler worker {} finished", index);
}

/// Wait for a runnable task. Returns `None` on shutdown.
fn next_task(shared: &Shared, queue: &mut MutexGuard<'_, TaskQueue>) -> Option<Arc<Task>> {
    loop {
        if shared.exiting() {
            return None;
        }
        if let Some(task) = queue.dequeue_first_ready(&shared.graph, &shared.limits) {
            return Some(task);
        }

        // This could have been the last task to finish.
        MutexGuard::unlocked(queue, || shared.update_busy_status());

        if shared.exiting() {
            return None;
        }
        if let Some(task) = queue.dequeue_first_ready(&shared.graph, &shared.limits) {
            return Some(task);
        }
        shared.queue_changed.wait(queue);
    }
}
