//! Progress display for `metflow run`
//!
//! A single bar follows the repeated runs of one request. Its position counts
//! completed runs and its message says what the current run is doing. Nothing
//! is drawn with --quiet or --json.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const TICKS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// Progress of the `--repeat` runs of one request
pub struct RunProgress {
    bar: Option<ProgressBar>,
}

impl RunProgress {
    pub fn new(request: &str, runs: u32, quiet: bool) -> Self {
        if quiet {
            return Self { bar: None };
        }
        let bar = ProgressBar::new(u64::from(runs));
        bar.enable_steady_tick(Duration::from_millis(100));
        Self::with_bar(bar, request)
    }

    fn with_bar(bar: ProgressBar, request: &str) -> Self {
        bar.set_style(
            ProgressStyle::default_spinner()
                .tick_chars(TICKS)
                .template("{spinner:.cyan} [{pos}/{len}] {prefix:.bold} {msg} {elapsed:.dim}")
                .expect("Invalid run progress template"),
        );
        bar.set_prefix(request.to_string());
        Self { bar: Some(bar) }
    }

    /// Run `iteration` has been submitted to the scheduler
    pub fn start(&self, iteration: u32) {
        if let Some(bar) = &self.bar {
            let waiting = if bar.position() == 0 {
                "building task graph"
            } else {
                "checking cache"
            };
            bar.set_message(format!("run {}: {}", iteration, waiting));
        }
    }

    /// Run `iteration` delivered its field
    pub fn complete(&self, iteration: u32, elapsed_ms: u64) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
            bar.set_message(format!("run {} took {} ms", iteration, elapsed_ms));
        }
    }

    /// Every run succeeded
    pub fn finish(self, total_ms: u64, productions: usize) {
        self.close(
            "{prefix:.green} {msg}",
            format!(
                "✓ {} run(s) in {} ms, {} reader production(s)",
                self.position(),
                total_ms,
                productions
            ),
        );
    }

    /// Run `iteration` failed and no further runs will follow
    pub fn fail(self, iteration: u32) {
        self.close(
            "{prefix:.red} {msg}",
            format!("✗ run {} failed after {} completed", iteration, self.position()),
        );
    }

    fn position(&self) -> u64 {
        self.bar.as_ref().map_or(0, ProgressBar::position)
    }

    fn close(&self, template: &str, message: String) {
        if let Some(bar) = &self.bar {
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template(template)
                    .expect("Invalid run progress template"),
            );
            bar.finish_with_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indicatif::ProgressDrawTarget;
    use pretty_assertions::assert_eq;

    fn hidden(runs: u64) -> RunProgress {
        let bar = ProgressBar::with_draw_target(Some(runs), ProgressDrawTarget::hidden());
        RunProgress::with_bar(bar, "MEMBER=0;VARIABLE=T")
    }

    #[test]
    fn test_quiet_draws_nothing() {
        let progress = RunProgress::new("VARIABLE=T", 3, true);
        assert!(progress.bar.is_none());

        progress.start(1);
        progress.complete(1, 12);
        assert_eq!(progress.position(), 0);
        progress.fail(2);
    }

    #[test]
    fn test_completed_runs_advance_the_bar() {
        let progress = hidden(3);

        progress.start(1);
        assert_eq!(progress.bar.as_ref().unwrap().message(), "run 1: building task graph");
        progress.complete(1, 40);
        progress.start(2);
        assert_eq!(progress.bar.as_ref().unwrap().message(), "run 2: checking cache");
        progress.complete(2, 1);

        assert_eq!(progress.position(), 2);
        assert_eq!(progress.bar.as_ref().unwrap().message(), "run 2 took 1 ms");
    }

    #[test]
    fn test_finish_reports_runs_and_productions() {
        let progress = hidden(2);
        progress.complete(1, 30);
        progress.complete(2, 2);
        let bar = progress.bar.clone().unwrap();

        progress.finish(32, 3);

        assert!(bar.is_finished());
        assert_eq!(bar.message(), "✓ 2 run(s) in 32 ms, 3 reader production(s)");
        assert_eq!(bar.prefix(), "MEMBER=0;VARIABLE=T");
    }

    #[test]
    fn test_fail_reports_failed_run() {
        let progress = hidden(3);
        progress.complete(1, 5);
        let bar = progress.bar.clone().unwrap();

        progress.fail(2);

        assert!(bar.is_finished());
        assert_eq!(bar.message(), "✗ run 2 failed after 1 completed");
    }
}
