//! Integration tests for scheduled pipelines.
//!
//! These tests wire several scheduled sources to a shared memory manager and
//! a scheduler, and check end-to-end behavior: task deduplication, execution
//! order, pass-through forwarding, cache reuse and concurrency limits.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package metflow-core --test pipeline_integration
//! ```

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::*;
use metflow_core::{
    keys, DataSource, EnsembleMeanFilter, MemoryManager, MultiThreadScheduler, PipelineError,
    Request, ScheduledDataSource, Scheduler, SchedulerLimits, SingleThreadScheduler,
    SmoothFilter, StructuredGrid, SyntheticReader,
};

fn multi_thread_scheduler(workers: usize, max_disk_readers: usize) -> Arc<MultiThreadScheduler> {
    Arc::new(
        MultiThreadScheduler::new(SchedulerLimits {
            worker_threads: workers,
            max_disk_reader_tasks: max_disk_readers,
            max_gpu_tasks: 1,
        })
        .unwrap(),
    )
}

/// Number reader plus sum filter on top of it.
fn sum_pipeline(
    log: &ProductionLog,
    latency: Duration,
) -> (Arc<ScheduledDataSource>, Arc<ScheduledDataSource>) {
    let reader = ScheduledDataSource::new("reader", CountingReader::new(log.clone(), latency));
    let sum = ScheduledDataSource::new("sum", SumFilter::new(reader.clone(), log.clone()));
    (reader, sum)
}

/// Synthetic reader, ensemble mean and smoothing, chained by pass-through.
struct ForecastPipeline {
    reader: Arc<ScheduledDataSource>,
    ensemble: Arc<ScheduledDataSource>,
    smooth: Arc<ScheduledDataSource>,
}

fn forecast_pipeline(reader: SyntheticReader) -> ForecastPipeline {
    let reader = ScheduledDataSource::new("reader", reader);
    let ensemble = ScheduledDataSource::new("ensemble", EnsembleMeanFilter::new(reader.clone()));
    let smooth = ScheduledDataSource::new("smooth", SmoothFilter::new(ensemble.clone()));
    ensemble.enable_pass_through(reader.clone());
    smooth.enable_pass_through(ensemble.clone());
    ForecastPipeline {
        reader,
        ensemble,
        smooth,
    }
}

// ============================================================================
// Deduplication
// ============================================================================

#[test]
fn test_identical_parents_are_produced_once() {
    let log = ProductionLog::default();
    let (reader, sum) = sum_pipeline(&log, Duration::from_millis(20));
    let manager = memory_manager();
    let scheduler = multi_thread_scheduler(4, 2);
    attach(&[&reader, &sum], manager.clone(), scheduler.clone());

    let request = Request::parse("TERMS=3/3");
    request_and_wait(&sum, &request).unwrap();

    let item = sum.get_data(&request).unwrap();
    assert_eq!(item.payload::<Number>(), Some(&Number(6.0)));
    sum.release_data(&request).unwrap();

    assert_eq!(log.count("reader X=3"), 1);
    assert_eq!(log.count("sum TERMS=3/3"), 1);

    let status = manager.status();
    assert_eq!(status.active_items, 0);
    assert_eq!(status.released_items, 2);

    scheduler.shutdown();
}

#[test]
fn test_concurrent_consumers_share_one_production() {
    let log = ProductionLog::default();
    let (reader, sum) = sum_pipeline(&log, Duration::from_millis(100));
    let manager = memory_manager();
    let scheduler = multi_thread_scheduler(4, 2);
    attach(&[&reader, &sum], manager.clone(), scheduler.clone());

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let reader = reader.clone();
            thread::spawn(move || {
                let request = Request::parse("X=5");
                request_and_wait(&reader, &request).unwrap();
                let value = reader.get_data(&request).unwrap().payload::<Number>().copied();
                reader.release_data(&request).unwrap();
                value
            })
        })
        .collect();

    for consumer in consumers {
        assert_eq!(consumer.join().unwrap(), Some(Number(5.0)));
    }

    assert_eq!(log.count("reader X=5"), 1);
    assert_eq!(manager.reference_count(reader.id(), &Request::parse("X=5")), Some(0));

    scheduler.shutdown();
}

#[test]
fn test_independent_graphs_share_a_common_input() {
    let log = ProductionLog::default();
    let (reader, sum) = sum_pipeline(&log, Duration::from_millis(100));
    let manager = memory_manager();
    let scheduler = multi_thread_scheduler(4, 2);
    attach(&[&reader, &sum], manager.clone(), scheduler.clone());

    let start = Arc::new(Barrier::new(3));
    let consumers: Vec<_> = ["1/2", "2/3", "2/4"]
        .into_iter()
        .map(|terms| {
            let sum = sum.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let request = Request::new().with("TERMS", terms);
                start.wait();
                request_and_wait(&sum, &request).unwrap();
                let value = sum.get_data(&request).unwrap().payload::<Number>().copied();
                sum.release_data(&request).unwrap();
                value
            })
        })
        .collect();

    let values: Vec<_> = consumers.into_iter().map(|c| c.join().unwrap()).collect();
    assert_eq!(values, vec![Some(Number(3.0)), Some(Number(5.0)), Some(Number(6.0))]);

    assert_eq!(log.count("reader X=2"), 1);
    for x in ["1", "2", "3", "4"] {
        let request = Request::new().with("X", x);
        assert_eq!(manager.reference_count(reader.id(), &request), Some(0));
    }
    assert_eq!(manager.status().active_items, 0);
    assert!(eventually(|| scheduler.task_graph().is_empty()));

    scheduler.shutdown();
}

// ============================================================================
// Execution order
// ============================================================================

#[test]
fn test_single_thread_runs_parents_before_child() {
    let log = ProductionLog::default();
    let (reader, sum) = sum_pipeline(&log, Duration::ZERO);
    let scheduler: Arc<dyn Scheduler> = Arc::new(SingleThreadScheduler::new());
    attach(&[&reader, &sum], memory_manager(), scheduler.clone());

    let request = Request::parse("TERMS=1/2");
    request_and_wait(&sum, &request).unwrap();
    sum.release_data(&request).unwrap();

    assert_eq!(
        log.entries(),
        vec!["reader X=1", "reader X=2", "sum TERMS=1/2"]
    );
    assert!(scheduler.task_graph().is_empty());
    assert!(!scheduler.is_busy());
}

#[test]
fn test_multi_thread_runs_parents_before_child() {
    let log = ProductionLog::default();
    let (reader, sum) = sum_pipeline(&log, Duration::from_millis(10));
    let scheduler = multi_thread_scheduler(4, 4);
    attach(&[&reader, &sum], memory_manager(), scheduler.clone());

    let request = Request::parse("TERMS=1/2/4");
    request_and_wait(&sum, &request).unwrap();
    assert_eq!(
        sum.get_data(&request).unwrap().payload::<Number>(),
        Some(&Number(7.0))
    );
    sum.release_data(&request).unwrap();

    let entries = log.entries();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries.last().map(String::as_str), Some("sum TERMS=1/2/4"));

    scheduler.shutdown();
}

// ============================================================================
// Concurrency limits
// ============================================================================

#[test]
fn test_disk_reader_cap_is_respected() {
    let log = ProductionLog::default();
    let counting = CountingReader::new(log.clone(), Duration::from_millis(30));
    let peak = counting.max_in_flight();
    let reader = ScheduledDataSource::new("reader", counting);
    let sum = ScheduledDataSource::new("sum", SumFilter::new(reader.clone(), log.clone()));
    let scheduler = multi_thread_scheduler(4, 1);
    attach(&[&reader, &sum], memory_manager(), scheduler.clone());

    let request = Request::parse("TERMS=1/2/3/4/5");
    request_and_wait(&sum, &request).unwrap();
    sum.release_data(&request).unwrap();

    assert_eq!(log.entries().len(), 6);
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    scheduler.shutdown();
}

#[test]
fn test_busy_status_transitions() {
    let log = ProductionLog::default();
    let (reader, sum) = sum_pipeline(&log, Duration::from_millis(50));
    let scheduler = multi_thread_scheduler(2, 2);
    attach(&[&reader, &sum], memory_manager(), scheduler.clone());

    let busy = scheduler.subscribe_busy();
    let request = Request::parse("TERMS=1");
    request_and_wait(&sum, &request).unwrap();
    sum.release_data(&request).unwrap();

    assert_eq!(busy.recv_timeout(TIMEOUT), Ok(true));
    assert!(eventually(|| !scheduler.is_busy()));
    assert_eq!(busy.recv_timeout(TIMEOUT), Ok(false));

    scheduler.shutdown();
}

// ============================================================================
// Forecast pipeline
// ============================================================================

#[test]
fn test_pass_through_reaches_reader() {
    let pipeline = forecast_pipeline(SyntheticReader::new(8, 4, 2));
    let manager = memory_manager();
    let scheduler: Arc<dyn Scheduler> = Arc::new(SingleThreadScheduler::new());
    attach(
        &[&pipeline.reader, &pipeline.ensemble, &pipeline.smooth],
        manager.clone(),
        scheduler,
    );

    let request = Request::parse("VARIABLE=T;LEVELTYPE=HYBRID;MEMBER=0");
    request_and_wait(&pipeline.smooth, &request).unwrap();

    let item = pipeline.smooth.get_data(&request).unwrap();
    assert_eq!(
        item.generating_request().request(),
        "LEVELTYPE=HYBRID;MEMBER=0;VARIABLE=T"
    );
    assert_eq!(item.storing_owner(), Some(pipeline.reader.id()));
    let grid = item.payload::<StructuredGrid>().unwrap();
    assert_eq!(grid.metadata.member, Some(0));
    pipeline.smooth.release_data(&request).unwrap();

    let status = manager.status();
    assert_eq!(status.active_items, 0);
    assert_eq!(status.released_items, 1);
}

#[test]
fn test_smoothed_ensemble_mean() {
    let reader = SyntheticReader::new(16, 9, 3);
    let productions = reader.production_counter();
    let pipeline = forecast_pipeline(reader);
    let manager = memory_manager();
    let scheduler = multi_thread_scheduler(4, 2);
    attach(
        &[&pipeline.reader, &pipeline.ensemble, &pipeline.smooth],
        manager.clone(),
        scheduler.clone(),
    );

    let request = Request::parse("VARIABLE=T;LEVELTYPE=HYBRID;MEMBERS=0/1/2;SMOOTH_STDDEV=1.5");
    request_and_wait(&pipeline.smooth, &request).unwrap();

    let item = pipeline.smooth.get_data(&request).unwrap();
    let grid = item.payload::<StructuredGrid>().unwrap();
    assert_eq!((grid.nlon(), grid.nlat(), grid.nlev()), (16, 9, 3));
    assert_eq!(grid.metadata.member, None);
    assert_eq!(grid.metadata.variable, "T");
    pipeline.smooth.release_data(&request).unwrap();

    assert_eq!(productions.load(Ordering::SeqCst), 3);
    // three members, the mean and the smoothed mean
    let status = manager.status();
    assert_eq!(status.active_items, 0);
    assert_eq!(status.released_items, 5);

    scheduler.shutdown();
}

#[test]
fn test_repeated_request_is_served_from_cache() {
    let reader = SyntheticReader::new(8, 4, 2);
    let productions = reader.production_counter();
    let pipeline = forecast_pipeline(reader);
    let manager = memory_manager();
    let scheduler = multi_thread_scheduler(2, 2);
    attach(
        &[&pipeline.reader, &pipeline.ensemble, &pipeline.smooth],
        manager.clone(),
        scheduler.clone(),
    );

    let request = Request::parse("VARIABLE=U;LEVELTYPE=PRESSURE;MEMBERS=0/1;SMOOTH_STDDEV=1");
    request_and_wait(&pipeline.smooth, &request).unwrap();
    let first = pipeline.smooth.get_data(&request).unwrap();
    pipeline.smooth.release_data(&request).unwrap();

    request_and_wait(&pipeline.smooth, &request).unwrap();
    let second = pipeline.smooth.get_data(&request).unwrap();
    pipeline.smooth.release_data(&request).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(productions.load(Ordering::SeqCst), 2);
    assert!(manager.metrics().hits >= 1);

    scheduler.shutdown();
}

#[test]
fn test_unknown_variable_reports_failure() {
    let pipeline = forecast_pipeline(SyntheticReader::new(4, 3, 1));
    let scheduler = multi_thread_scheduler(2, 2);
    attach(
        &[&pipeline.reader, &pipeline.ensemble, &pipeline.smooth],
        memory_manager(),
        scheduler.clone(),
    );

    let request = Request::parse("VARIABLE=NOPE;LEVELTYPE=SURFACE;MEMBER=0");
    let err = request_and_wait(&pipeline.smooth, &request).unwrap_err();
    assert!(err.to_string().contains("NOPE"));

    scheduler.shutdown();
}

#[test]
fn test_missing_keys_are_rejected() {
    let pipeline = forecast_pipeline(SyntheticReader::new(4, 3, 1));
    let scheduler: Arc<dyn Scheduler> = Arc::new(SingleThreadScheduler::new());
    attach(
        &[&pipeline.reader, &pipeline.ensemble, &pipeline.smooth],
        memory_manager(),
        scheduler,
    );

    let request = Request::new().with(keys::VARIABLE, "T");
    assert!(pipeline.smooth.request_data(&request).is_err());
}

#[test]
fn test_failed_graph_build_leaves_no_tasks() {
    let pipeline = forecast_pipeline(SyntheticReader::new(4, 3, 1));
    let scheduler: Arc<dyn Scheduler> = Arc::new(SingleThreadScheduler::new());
    attach(
        &[&pipeline.reader, &pipeline.ensemble, &pipeline.smooth],
        memory_manager(),
        scheduler.clone(),
    );

    // The smoothing stage accepts the request; the reader below it does not.
    for stddev in 1..=3 {
        let request = Request::new()
            .with(keys::SMOOTH_STDDEV, stddev)
            .with(keys::VARIABLE, "T");
        assert!(pipeline.smooth.request_data(&request).is_err());
    }

    assert_eq!(scheduler.task_graph().len(), 0);
}

#[test]
fn test_failed_graph_build_releases_cached_inputs() {
    let log = ProductionLog::default();
    let (reader, sum) = sum_pipeline(&log, Duration::ZERO);
    let manager = memory_manager();
    let scheduler: Arc<dyn Scheduler> = Arc::new(SingleThreadScheduler::new());
    attach(&[&reader, &sum], manager.clone(), scheduler.clone());

    let cached = Request::parse("X=1");
    request_and_wait(&reader, &cached).unwrap();
    reader.release_data(&cached).unwrap();
    assert_eq!(manager.reference_count(reader.id(), &cached), Some(0));

    // X=1 is blocked for the sum before the second term fails.
    let err = sum.request_data(&Request::parse("TERMS=1/bad")).unwrap_err();
    assert!(matches!(err, PipelineError::MissingKeys { .. }));

    assert_eq!(manager.reference_count(reader.id(), &cached), Some(0));
    assert!(scheduler.task_graph().is_empty());

    manager.clear_cache();
    let status = manager.status();
    assert_eq!(status.active_items, 0);
    assert_eq!(status.released_items, 0);
    assert_eq!(manager.usage_kb(), 0);
}

// ============================================================================
// Memory accounting
// ============================================================================

#[test]
fn test_clear_cache_after_release_frees_memory() {
    let pipeline = forecast_pipeline(SyntheticReader::new(32, 16, 4));
    let manager = memory_manager();
    let scheduler: Arc<dyn Scheduler> = Arc::new(SingleThreadScheduler::new());
    attach(
        &[&pipeline.reader, &pipeline.ensemble, &pipeline.smooth],
        manager.clone(),
        scheduler,
    );

    let request = Request::parse("VARIABLE=Q;LEVELTYPE=HYBRID;MEMBERS=0/1");
    request_and_wait(&pipeline.smooth, &request).unwrap();
    assert!(manager.usage_kb() > 0);
    assert_eq!(manager.status().active_items, 1);

    pipeline.smooth.release_data(&request).unwrap();
    manager.clear_cache();

    assert_eq!(manager.usage_kb(), 0);
    assert_eq!(manager.status().released_items, 0);
}
