//! Unified test-result accounting.
//!
//! Grounded in the teacher's `orchestrator::RunResult` (summary counters plus
//! a `success`/`exit_code` contract), generalized with the spec's
//! `by_framework` nesting so API and D2D lanes, and the combined family
//! totals above them, share one additive type.

use std::collections::BTreeMap;

/// Aggregated pass/fail/skip/error counts for one lane, one family, or their
/// combination, plus a nested breakdown keyed by whatever the caller names
/// (lane tag, framework name).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestResults {
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errored: u64,
    pub total: u64,
    pub reason: Option<String>,
    pub by_framework: BTreeMap<String, TestResults>,
}

impl TestResults {
    /// An all-zero result with no nested breakdown.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Records an infrastructure-level failure: a lane that could not run at
    /// all. `total` stays zero since no tests executed.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn from_counts(passed: u64, failed: u64, skipped: u64, errored: u64) -> Self {
        Self {
            passed,
            failed,
            skipped,
            errored,
            total: passed + failed + skipped + errored,
            reason: None,
            by_framework: BTreeMap::new(),
        }
    }

    /// Nests `other` under `key`, folding its totals into `self` as well.
    pub fn with_nested(mut self, key: impl Into<String>, other: TestResults) -> Self {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errored += other.errored;
        self.total += other.total;
        self.by_framework.insert(key.into(), other);
        self
    }

    pub fn is_success(&self) -> bool {
        self.reason.is_none() && self.failed == 0 && self.errored == 0
    }

    pub fn ran_any(&self) -> bool {
        self.total > 0
    }

    /// Percentage of `passed` over `total - skipped`, per `SummaryGenerator`'s
    /// contract. Returns 100.0 when there is nothing to divide by.
    pub fn success_rate(&self) -> f64 {
        let denominator = self.total.saturating_sub(self.skipped);
        if denominator == 0 {
            100.0
        } else {
            (self.passed as f64 / denominator as f64) * 100.0
        }
    }
}

impl std::ops::Add for TestResults {
    type Output = TestResults;

    fn add(self, rhs: TestResults) -> TestResults {
        let mut by_framework = self.by_framework;
        for (key, value) in rhs.by_framework {
            by_framework
                .entry(key)
                .and_modify(|existing| *existing = existing.clone() + value.clone())
                .or_insert(value);
        }
        TestResults {
            passed: self.passed + rhs.passed,
            failed: self.failed + rhs.failed,
            skipped: self.skipped + rhs.skipped,
            errored: self.errored + rhs.errored,
            total: self.total + rhs.total,
            reason: self.reason.or(rhs.reason),
            by_framework,
        }
    }
}

impl std::ops::AddAssign for TestResults {
    fn add_assign(&mut self, rhs: TestResults) {
        *self = std::mem::take(self) + rhs;
    }
}
