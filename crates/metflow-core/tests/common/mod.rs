//! Common test utilities for pipeline integration tests.
//!
//! Provides instrumented producers that record what they compute, plus
//! helpers to wire sources to a memory manager and a scheduler.

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use metflow_core::{
    wait_for_completion, DataGuard, DataItem, DataPayload, DataProducer, DataSource,
    LruMemoryManager, MemoryManager, PipelineError, Request, Result, ScheduledDataSource,
    Scheduler, TaskClass, TaskGraphContext, TaskId,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Scalar payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Number(pub f64);

impl DataPayload for Number {
    fn memory_size_kb(&self) -> u64 {
        1
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Shared record of productions across producers.
#[derive(Debug, Default, Clone)]
pub struct ProductionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ProductionLog {
    pub fn push(&self, entry: String) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().iter().filter(|e| *e == entry).count()
    }
}

/// Reader producing `Number(X)` for requests keyed by `X`.
///
/// Records every production and the peak number of concurrent productions.
pub struct CountingReader {
    log: ProductionLog,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl CountingReader {
    pub fn new(log: ProductionLog, latency: Duration) -> Self {
        Self {
            log,
            latency,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_in_flight(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.max_in_flight)
    }
}

impl DataProducer for CountingReader {
    fn locally_required_keys(&self) -> Vec<String> {
        vec!["X".to_string()]
    }

    fn produce_data(&self, request: &Request) -> Result<DataItem> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.log.push(format!("reader {}", request));
        Ok(DataItem::new(Number(request.float_value("X") as f64)))
    }

    fn task_class(&self) -> TaskClass {
        TaskClass::DiskReader
    }
}

/// Sum over `X` values listed in `TERMS` (e.g. `TERMS=1/2`, duplicates kept).
///
/// A term that is not a number is requested as `Y=<term>`, which the reader
/// rejects for lack of `X`.
pub struct SumFilter {
    input: Arc<ScheduledDataSource>,
    log: ProductionLog,
}

impl SumFilter {
    pub fn new(input: Arc<ScheduledDataSource>, log: ProductionLog) -> Self {
        Self { input, log }
    }

    fn term_requests(request: &Request) -> Vec<Request> {
        request
            .value("TERMS")
            .split('/')
            .filter(|t| !t.is_empty())
            .map(|t| {
                if t.parse::<f64>().is_ok() {
                    Request::new().with("X", t)
                } else {
                    Request::new().with("Y", t)
                }
            })
            .collect()
    }
}

impl DataProducer for SumFilter {
    fn locally_required_keys(&self) -> Vec<String> {
        vec!["TERMS".to_string()]
    }

    fn produce_data(&self, request: &Request) -> Result<DataItem> {
        let guards = DataGuard::acquire_all(&*self.input, &Self::term_requests(request))?;
        let mut sum = 0.0;
        for guard in &guards {
            let number = guard.payload::<Number>().ok_or_else(|| {
                PipelineError::produce_failed(request.request(), "input is not a number")
            })?;
            sum += number.0;
        }
        self.log.push(format!("sum {}", request));
        Ok(DataItem::new(Number(sum)))
    }

    fn create_task_graph(&self, ctx: &TaskGraphContext, request: &Request) -> Result<TaskId> {
        let task = ctx.new_task(request.clone());
        for term in Self::term_requests(request) {
            let parent = self.input.get_task_graph(&term)?;
            ctx.add_parent(task, parent)?;
        }
        Ok(task)
    }

    fn input_sources(&self) -> Vec<(String, Arc<dyn DataSource>)> {
        vec![(String::new(), self.input.clone() as Arc<dyn DataSource>)]
    }
}

pub fn memory_manager() -> Arc<LruMemoryManager> {
    Arc::new(LruMemoryManager::new("test", 64 * 1024))
}

/// Give every source the same memory manager and scheduler.
pub fn attach(
    sources: &[&Arc<ScheduledDataSource>],
    manager: Arc<dyn MemoryManager>,
    scheduler: Arc<dyn Scheduler>,
) {
    for source in sources {
        source.set_memory_manager(Arc::clone(&manager)).unwrap();
        source.set_scheduler(Arc::clone(&scheduler)).unwrap();
    }
}

/// Issue a request and block until it completes.
pub fn request_and_wait(source: &ScheduledDataSource, request: &Request) -> Result<()> {
    let events = source.subscribe();
    source.request_data(request)?;
    wait_for_completion(&events, request, TIMEOUT)
}

/// Wait until `f` holds or the timeout expires.
pub fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    f()
}
