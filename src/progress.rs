//! Live progress rendering.
//!
//! Grounded in the teacher's `report::ConsoleReporter` (colorized per-test
//! status lines, `console::style`) combined with the spec's monotonic
//! global test-id counter, realized as an `AtomicU64` per Design Note
//! "Global mutable live-status map".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use console::style;

use crate::events::TaskResult;

/// Tracks total test count, worker count, a monotonic test-id counter, and
/// prints one line per task_start/task_end.
pub struct ProgressReporter {
    total_tests: usize,
    max_workers: usize,
    test_counter: AtomicU64,
    started_at: Instant,
    quiet: Mutex<bool>,
}

impl ProgressReporter {
    pub fn new(total_tests: usize, max_workers: usize) -> Self {
        Self {
            total_tests,
            max_workers,
            test_counter: AtomicU64::new(0),
            started_at: Instant::now(),
            quiet: Mutex::new(false),
        }
    }

    /// Suppresses line output while still allocating test ids -- used by
    /// tests that only care about id allocation.
    pub fn set_quiet(&self, quiet: bool) {
        *self.quiet.lock().expect("quiet flag mutex poisoned") = quiet;
    }

    fn is_quiet(&self) -> bool {
        *self.quiet.lock().expect("quiet flag mutex poisoned")
    }

    /// Monotonically increasing id, threadsafe across concurrent event
    /// handlers from multiple worker readers.
    pub fn next_test_id(&self) -> u64 {
        self.test_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn total_tests(&self) -> usize {
        self.total_tests
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn report_start(&self, test_name: &str, test_id: u64) {
        if self.is_quiet() {
            return;
        }
        println!(
            "{:>5}/{:<5} {} {}",
            test_id,
            self.total_tests,
            style("RUNNING").cyan(),
            test_name,
        );
    }

    pub fn report_end(&self, test_name: &str, test_id: u64, result: TaskResult, duration: f64) {
        if self.is_quiet() {
            return;
        }
        let label = match result {
            TaskResult::Passed => style("PASSED ").green(),
            TaskResult::Failed => style("FAILED ").red(),
            TaskResult::Skipped => style("SKIPPED").yellow(),
            TaskResult::Errored => style("ERRORED").red().bold(),
        };
        println!(
            "{:>5}/{:<5} {} {} ({:.2}s)",
            test_id, self.total_tests, label, test_name, duration,
        );
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}
