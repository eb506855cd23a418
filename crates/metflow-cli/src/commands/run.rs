//! Run command - Request fields through the reference pipeline
//!
//! The pipeline is `SyntheticReader` → `EnsembleMeanFilter` → `SmoothFilter`
//! with pass-through enabled, so a request without `SMOOTH_STDDEV` or
//! `MEMBERS` is answered by the first stage that handles it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use metflow_config::{ConfigOverrides, PipelineConfig, SchedulerMode};
use metflow_core::{
    keys, wait_for_completion, CacheMetrics, DataGuard, DataSource, EnsembleMeanFilter,
    GridSummary, LruMemoryManager, MemoryManager, MemoryStatus, MultiThreadScheduler, Request,
    ScheduledDataSource, Scheduler, SchedulerLimits, SingleThreadScheduler, SmoothFilter,
    StructuredGrid, SyntheticReader,
};
use serde::Serialize;
use tracing::{debug, info};

use super::print_info;
use crate::progress::RunProgress;
use crate::GlobalOptions;

/// Arguments for the run command
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Forecast variable (T, U, V, Q, GPH)
    #[arg(long, default_value = "T")]
    variable: String,

    /// Vertical level type (SURFACE, PRESSURE, HYBRID)
    #[arg(long, default_value = "HYBRID")]
    level_type: String,

    /// Single ensemble member [default: 0]
    #[arg(long, conflicts_with = "members")]
    member: Option<u32>,

    /// Ensemble members to average, separated by '/' (e.g. 0/1/2)
    #[arg(long)]
    members: Option<String>,

    /// Gaussian smoothing standard deviation in grid points
    #[arg(long)]
    smooth: Option<f32>,

    /// Issue the request this many times
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    repeat: u32,

    /// Run tasks on the calling thread
    #[arg(long)]
    single_threaded: bool,

    /// Worker threads of the multi-threaded scheduler (0 = auto)
    #[arg(long)]
    workers: Option<usize>,

    /// Memory budget in MiB
    #[arg(long)]
    budget_mb: Option<u64>,

    /// Seconds to wait for each request
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    /// Print the memory manager content after the run
    #[arg(long)]
    dump_memory: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn request(&self) -> Result<Request> {
        let mut request = Request::new()
            .with(keys::VARIABLE, self.variable.to_uppercase())
            .with(keys::LEVELTYPE, self.level_type.to_uppercase());

        match self.members {
            Some(ref members) => request.insert(keys::MEMBERS, parse_members(members)?),
            None => request.insert(keys::MEMBER, self.member.unwrap_or(0)),
        }
        if let Some(stddev) = self.smooth {
            request.insert(keys::SMOOTH_STDDEV, stddev);
        }
        Ok(request)
    }

    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            budget_mb: self.budget_mb,
            scheduler_mode: self.single_threaded.then_some(SchedulerMode::Single),
            worker_threads: self.workers,
            ..Default::default()
        }
    }
}

fn parse_members(members: &str) -> Result<BTreeSet<u32>> {
    let set = members
        .split('/')
        .map(|m| {
            m.trim()
                .parse::<u32>()
                .with_context(|| format!("Invalid ensemble member '{}'", m))
        })
        .collect::<Result<BTreeSet<u32>>>()?;
    if set.is_empty() {
        anyhow::bail!("No ensemble members given");
    }
    Ok(set)
}

/// Reader, ensemble mean and smoothing stages sharing one memory manager.
struct Pipeline {
    output: Arc<ScheduledDataSource>,
    manager: Arc<LruMemoryManager>,
    productions: Arc<AtomicUsize>,
    multi: Option<Arc<MultiThreadScheduler>>,
}

impl Pipeline {
    fn build(config: &PipelineConfig) -> Result<Self> {
        let mut reader =
            SyntheticReader::new(config.reader.nlon, config.reader.nlat, config.reader.nlev);
        if config.reader.latency_ms > 0 {
            reader = reader.with_latency(Duration::from_millis(config.reader.latency_ms));
        }
        let productions = reader.production_counter();

        let manager = Arc::new(LruMemoryManager::new(
            config.memory.identifier.clone(),
            config.memory.budget_kb(),
        ));

        let (scheduler, multi) = match config.scheduler.mode {
            SchedulerMode::Single => (
                Arc::new(SingleThreadScheduler::new()) as Arc<dyn Scheduler>,
                None,
            ),
            SchedulerMode::Multi => {
                let limits = SchedulerLimits {
                    worker_threads: config.scheduler.worker_threads,
                    max_disk_reader_tasks: config.scheduler.max_disk_reader_tasks,
                    max_gpu_tasks: config.scheduler.max_gpu_tasks,
                };
                let scheduler = Arc::new(
                    MultiThreadScheduler::new(limits).context("Failed to start scheduler threads")?,
                );
                (scheduler.clone() as Arc<dyn Scheduler>, Some(scheduler))
            }
        };

        let reader = ScheduledDataSource::new("reader", reader);
        let ensemble = ScheduledDataSource::new("ensemble", EnsembleMeanFilter::new(reader.clone()));
        let smooth = ScheduledDataSource::new("smooth", SmoothFilter::new(ensemble.clone()));
        ensemble.enable_pass_through(reader.clone());
        smooth.enable_pass_through(ensemble.clone());

        for source in [&reader, &ensemble, &smooth] {
            source.set_memory_manager(manager.clone())?;
            source.set_scheduler(scheduler.clone())?;
        }
        debug!("Pipeline ready: {} → {} → {}", reader.id(), ensemble.id(), smooth.id());

        Ok(Self {
            output: smooth,
            manager,
            productions,
            multi,
        })
    }

    /// Request, wait and summarize one field.
    fn fetch(&self, request: &Request, timeout: Duration) -> Result<GridSummary> {
        let events = self.output.subscribe();
        self.output.request_data(request)?;
        wait_for_completion(&events, request, timeout)?;

        let guard = DataGuard::acquire(&*self.output, request)?;
        let grid = guard
            .payload::<StructuredGrid>()
            .context("Pipeline returned an item that is not a grid")?;
        Ok(grid.summary())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(ref scheduler) = self.multi {
            scheduler.shutdown();
        }
    }
}

/// One completed request.
#[derive(Debug, Serialize)]
pub struct RunRecord {
    pub iteration: u32,
    pub elapsed_ms: u64,
    pub summary: GridSummary,
}

/// Result of the run command
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub request: String,
    pub scheduler: SchedulerMode,
    pub runs: Vec<RunRecord>,
    /// Fields computed by the reader over all runs
    pub productions: usize,
    pub memory: MemoryStatus,
    pub cache: CacheMetrics,
}

/// Execute the run command
pub fn execute(args: RunArgs, global: &GlobalOptions, mut config: PipelineConfig) -> Result<()> {
    config.apply_overrides(&args.overrides());
    config.validate().context("Invalid configuration")?;

    let request = args.request()?;
    let quiet = global.quiet || args.json;
    let timeout = Duration::from_secs(args.timeout_secs);

    let pipeline = Pipeline::build(&config)?;
    info!(
        "Requesting {} ({} scheduler, {} MiB budget)",
        request, config.scheduler.mode, config.memory.budget_mb
    );

    let progress = RunProgress::new(&request.to_string(), args.repeat, quiet);
    let mut runs = Vec::with_capacity(args.repeat as usize);
    for iteration in 1..=args.repeat {
        progress.start(iteration);
        let start = Instant::now();
        match pipeline.fetch(&request, timeout) {
            Ok(summary) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                progress.complete(iteration, elapsed_ms);
                runs.push(RunRecord {
                    iteration,
                    elapsed_ms,
                    summary,
                });
            }
            Err(e) => {
                progress.fail(iteration);
                return Err(e).with_context(|| format!("Request {} failed", request));
            }
        }
    }
    let productions = pipeline.productions.load(Ordering::SeqCst);
    progress.finish(runs.iter().map(|run| run.elapsed_ms).sum(), productions);

    if args.dump_memory && !args.json {
        print!("{}", pipeline.manager.dump_memory_content());
    }

    let report = RunReport {
        request: request.to_string(),
        scheduler: config.scheduler.mode,
        runs,
        productions,
        memory: pipeline.manager.status(),
        cache: pipeline.manager.metrics(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
        print_info(
            &format!("Cache hit rate: {:.0}%", report.cache.hit_rate() * 100.0),
            quiet,
        );
    }
    Ok(())
}

fn format_value(value: Option<f32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.3}", v))
}

fn print_report(report: &RunReport) {
    println!("Request: {}", report.request);
    if let Some(last) = report.runs.last() {
        let s = &last.summary;
        let member = s
            .metadata
            .member
            .map_or_else(|| "ensemble mean".to_string(), |m| format!("member {}", m));
        println!(
            "Field:   {} ({}), {} x {} x {}",
            s.metadata.variable, member, s.nlon, s.nlat, s.nlev
        );
        println!(
            "Values:  min {}, max {}, mean {}",
            format_value(s.min),
            format_value(s.max),
            format_value(s.mean)
        );
    }
    for run in &report.runs {
        println!("Run {}:   {} ms", run.iteration, run.elapsed_ms);
    }
    println!("Reader productions: {}", report.productions);
    println!("Memory:  {}", report.memory);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_members() {
        let members = parse_members("2/0/2").unwrap();
        assert_eq!(members.into_iter().collect::<Vec<_>>(), vec![0, 2]);
        assert!(parse_members("0/x").is_err());
        assert!(parse_members("").is_err());
    }

    #[test]
    fn test_pipeline_serves_repeated_request_from_cache() {
        let mut config = PipelineConfig::default();
        config.scheduler.mode = SchedulerMode::Single;
        config.reader.nlon = 8;
        config.reader.nlat = 4;
        config.reader.nlev = 2;
        let pipeline = Pipeline::build(&config).unwrap();
        let request = Request::parse("LEVELTYPE=SURFACE;MEMBERS=0/1;SMOOTH_STDDEV=1;VARIABLE=T");

        let first = pipeline.fetch(&request, Duration::from_secs(5)).unwrap();
        let second = pipeline.fetch(&request, Duration::from_secs(5)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.metadata.member, None);
        assert_eq!(pipeline.productions.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.manager.status().active_items, 0);
    }
}
