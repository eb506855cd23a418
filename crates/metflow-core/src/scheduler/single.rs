use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::debug;

use super::{BusySignal, Scheduler};
use crate::request::Request;
use crate::task::{TaskGraph, TaskId};

/// Executes task graphs synchronously on the calling thread.
///
/// Parents run depth-first before their children; every task runs exactly
/// once and is deleted right after.
#[derive(Debug, Default)]
pub struct SingleThreadScheduler {
    graph: Arc<TaskGraph>,
    busy: BusySignal,
}

impl SingleThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn execute_depth_first(&self, id: TaskId, level: usize) {
        let Some(task) = self.graph.get(id) else {
            return;
        };
        debug!("Level {}: {}", level, task.request());

        let parents = task.parents().clone();
        for parent in parents {
            self.execute_depth_first(parent, level + 1);
        }

        task.set_scheduled();
        task.run();
        self.graph.discard(id);
    }
}

impl Scheduler for SingleThreadScheduler {
    fn task_graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    fn schedule_task_graph(&self, root: TaskId) {
        self.busy.set(true);
        if let Some(task) = self.graph.get(root) {
            debug!("Executing task graph for {} =======================", task.request());
        }
        self.execute_depth_first(root, 0);
        debug!("Execution of task graph finished. =======================");
        self.busy.set(false);
    }

    fn is_scheduled(&self, _source_id: &str, _request: &Request) -> Option<TaskId> {
        None
    }

    fn is_busy(&self) -> bool {
        self.busy.get()
    }

    fn subscribe_busy(&self) -> Receiver<bool> {
        self.busy.subscribe()
    }
}
