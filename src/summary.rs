//! Dashboard statistics records.
//!
//! HTML templating is out of scope (§1); this module produces the
//! ready-to-embed statistics record a template would consume. Grounded in
//! the teacher's `report::print_summary` (final Total/Passed/Failed/Skipped
//! tally computed from a `RunResult`) generalized from one flat tally to a
//! per-lane and combined-dashboard record.

use serde::Serialize;

use crate::results::TestResults;

/// A statistics record ready to feed an HTML template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRecord {
    pub total_tests: u64,
    pub passed_tests: u64,
    pub failed_tests: u64,
    pub skipped_tests: u64,
    pub success_rate: f64,
    pub report_path: Option<String>,
}

/// Builds per-lane and combined summary records from `TestResults`.
#[derive(Debug, Default)]
pub struct SummaryGenerator;

impl SummaryGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn summarize(&self, results: &TestResults, report_path: Option<String>) -> SummaryRecord {
        SummaryRecord {
            total_tests: results.total,
            passed_tests: results.passed,
            failed_tests: results.failed,
            skipped_tests: results.skipped,
            success_rate: results.success_rate(),
            report_path,
        }
    }

    /// Combines several lane/family results into one dashboard record,
    /// folding totals the same way `TestResults::with_nested` does.
    pub fn combine(&self, results: &[(&str, &TestResults)], report_path: Option<String>) -> SummaryRecord {
        let mut total = TestResults::empty();
        for (_, lane_results) in results {
            total += (*lane_results).clone();
        }
        self.summarize(&total, report_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_computes_success_rate_excluding_skipped() {
        let results = TestResults::from_counts(8, 1, 1, 0);
        let summary = SummaryGenerator::new().summarize(&results, Some("report.html".to_string()));
        assert_eq!(summary.total_tests, 10);
        assert!((summary.success_rate - (8.0 / 9.0 * 100.0)).abs() < 1e-9);
        assert_eq!(summary.report_path.as_deref(), Some("report.html"));
    }

    #[test]
    fn combine_folds_multiple_lanes() {
        let api = TestResults::from_counts(5, 0, 0, 0);
        let d2d = TestResults::from_counts(3, 2, 0, 0);
        let combined = SummaryGenerator::new().combine(&[("api", &api), ("d2d", &d2d)], None);
        assert_eq!(combined.total_tests, 10);
        assert_eq!(combined.passed_tests, 8);
        assert_eq!(combined.failed_tests, 2);
    }
}
