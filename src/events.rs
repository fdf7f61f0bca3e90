//! Worker event protocol and output classification.
//!
//! Grounded in `original_source/nac_test/pyats_core/reporting/progress_reporter.py`
//! for the `NAC_PROGRESS:`-prefixed JSON line protocol and the
//! task_start/task_end lifecycle, and in the teacher's
//! `provider::OutputLine` streaming model for how a line-oriented stdout
//! stream is classified as it arrives.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::progress::ProgressReporter;

pub const EVENT_PREFIX: &str = "NAC_PROGRESS:";
pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResult {
    Passed,
    Failed,
    Skipped,
    Errored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    TaskStart {
        version: String,
        test_name: String,
        pid: u32,
        worker_id: String,
        timestamp: f64,
        taskid: Option<u64>,
        test_title: Option<String>,
    },
    TaskEnd {
        version: String,
        test_name: String,
        pid: u32,
        worker_id: String,
        result: TaskResult,
        duration: f64,
        timestamp: f64,
    },
    SectionStart {
        version: String,
        name: String,
    },
    SectionEnd {
        version: String,
        name: String,
    },
}

impl WorkerEvent {
    fn version(&self) -> &str {
        match self {
            WorkerEvent::TaskStart { version, .. }
            | WorkerEvent::TaskEnd { version, .. }
            | WorkerEvent::SectionStart { version, .. }
            | WorkerEvent::SectionEnd { version, .. } => version,
        }
    }
}

/// Status of one test as tracked by the live status map.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Executing { test_id: u64, worker_id: String },
    Completed {
        test_id: u64,
        result: TaskResult,
        duration: f64,
    },
}

/// Shared, mutex-protected live status map written by possibly many
/// concurrent worker readers.
#[derive(Debug, Default)]
pub struct LiveStatus {
    inner: Mutex<HashMap<String, TaskStatus>>,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, TaskStatus> {
        self.inner.lock().expect("live status mutex poisoned").clone()
    }

    fn set(&self, test_name: String, status: TaskStatus) {
        self.inner
            .lock()
            .expect("live status mutex poisoned")
            .insert(test_name, status);
    }

    fn get(&self, test_name: &str) -> Option<TaskStatus> {
        self.inner
            .lock()
            .expect("live status mutex poisoned")
            .get(test_name)
            .cloned()
    }

    /// Splits the snapshot by lane using an `ExecutionPlan`-supplied
    /// classifier closure (path-keyed maps don't apply here since the
    /// status map is keyed by test_name, not path -- callers resolve lane
    /// membership by whatever mapping they maintain between test_name and
    /// path).
    pub fn partition_by<F: Fn(&str) -> bool>(&self, predicate: F) -> (HashMap<String, TaskStatus>, HashMap<String, TaskStatus>) {
        let snapshot = self.snapshot();
        let mut matching = HashMap::new();
        let mut rest = HashMap::new();
        for (name, status) in snapshot {
            if predicate(&name) {
                matching.insert(name, status);
            } else {
                rest.insert(name, status);
            }
        }
        (matching, rest)
    }
}

/// Parses a worker's stdout stream line by line, updating the shared live
/// status map and forwarding non-protocol lines to a show/suppress filter.
pub struct OutputProcessor<'a> {
    progress: &'a ProgressReporter,
    status: &'a LiveStatus,
    debug: bool,
    show_pattern: regex::Regex,
    suppress_pattern: regex::Regex,
}

impl<'a> OutputProcessor<'a> {
    pub fn new(progress: &'a ProgressReporter, status: &'a LiveStatus, debug: bool) -> Self {
        Self {
            progress,
            status,
            debug,
            show_pattern: regex::Regex::new(r"^(ERROR|CRITICAL|FAIL)").unwrap(),
            suppress_pattern: regex::Regex::new(r"^(DEBUG|urllib3\.|paramiko\.)").unwrap(),
        }
    }

    /// Processes one line of a worker's merged stdout/stderr stream. Returns
    /// `true` if the line should be echoed to the terminal.
    pub fn process_line(&self, line: &str) -> bool {
        if let Some(payload) = line.strip_prefix(EVENT_PREFIX) {
            return self.process_event_payload(payload);
        }
        self.should_show(line)
    }

    fn process_event_payload(&self, payload: &str) -> bool {
        match serde_json::from_str::<WorkerEvent>(payload.trim()) {
            Ok(event) => {
                if event.version() != SCHEMA_VERSION {
                    warn!(
                        "unexpected worker event schema version {:?}, expected {}",
                        event.version(),
                        SCHEMA_VERSION
                    );
                }
                self.apply_event(event);
                false
            }
            Err(err) => {
                if self.debug {
                    debug!("malformed NAC_PROGRESS line: {} ({})", payload, err);
                }
                self.debug
            }
        }
    }

    fn apply_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::TaskStart {
                test_name,
                worker_id,
                ..
            } => {
                let test_id = self.progress.next_test_id();
                self.progress.report_start(&test_name, test_id);
                self.status.set(
                    test_name,
                    TaskStatus::Executing {
                        test_id,
                        worker_id,
                    },
                );
            }
            WorkerEvent::TaskEnd {
                test_name,
                result,
                duration,
                ..
            } => {
                let test_id = match self.status.get(&test_name) {
                    Some(TaskStatus::Executing { test_id, .. }) => test_id,
                    Some(TaskStatus::Completed { test_id, .. }) => test_id,
                    None => self.progress.next_test_id(),
                };
                self.progress.report_end(&test_name, test_id, result, duration);
                self.status.set(
                    test_name,
                    TaskStatus::Completed {
                        test_id,
                        result,
                        duration,
                    },
                );
            }
            WorkerEvent::SectionStart { .. } | WorkerEvent::SectionEnd { .. } => {}
        }
    }

    fn should_show(&self, line: &str) -> bool {
        if self.debug {
            return true;
        }
        if self.suppress_pattern.is_match(line) {
            return false;
        }
        self.show_pattern.is_match(line) || !line.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_start_then_task_end_shares_test_id() {
        let progress = ProgressReporter::new(1, 1);
        let status = LiveStatus::new();
        let processor = OutputProcessor::new(&progress, &status, false);

        let start = serde_json::json!({
            "kind": "task_start",
            "version": "1.0",
            "test_name": "test_a",
            "pid": 1,
            "worker_id": "w1",
            "timestamp": 0.0,
            "taskid": null,
            "test_title": null,
        });
        processor.process_line(&format!("{}{}", EVENT_PREFIX, start));

        let id_at_start = match status.get("test_a") {
            Some(TaskStatus::Executing { test_id, .. }) => test_id,
            other => panic!("unexpected status: {other:?}"),
        };

        let end = serde_json::json!({
            "kind": "task_end",
            "version": "1.0",
            "test_name": "test_a",
            "pid": 1,
            "worker_id": "w1",
            "result": "passed",
            "duration": 1.5,
            "timestamp": 1.5,
        });
        processor.process_line(&format!("{}{}", EVENT_PREFIX, end));

        match status.get("test_a") {
            Some(TaskStatus::Completed { test_id, result, .. }) => {
                assert_eq!(test_id, id_at_start);
                assert_eq!(result, TaskResult::Passed);
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[test]
    fn task_end_without_prior_start_creates_record() {
        let progress = ProgressReporter::new(1, 1);
        let status = LiveStatus::new();
        let processor = OutputProcessor::new(&progress, &status, false);

        let end = serde_json::json!({
            "kind": "task_end",
            "version": "1.0",
            "test_name": "orphan",
            "pid": 1,
            "worker_id": "w1",
            "result": "errored",
            "duration": 0.1,
            "timestamp": 0.1,
        });
        processor.process_line(&format!("{}{}", EVENT_PREFIX, end));
        assert!(status.get("orphan").is_some());
    }

    #[test]
    fn malformed_json_is_hidden_unless_debug() {
        let progress = ProgressReporter::new(1, 1);
        let status = LiveStatus::new();
        let quiet = OutputProcessor::new(&progress, &status, false);
        assert!(!quiet.process_line(&format!("{}{{not json", EVENT_PREFIX)));

        let verbose = OutputProcessor::new(&progress, &status, true);
        assert!(verbose.process_line(&format!("{}{{not json", EVENT_PREFIX)));
    }

    #[test]
    fn ordinary_lines_are_classified_by_show_suppress() {
        let progress = ProgressReporter::new(1, 1);
        let status = LiveStatus::new();
        let processor = OutputProcessor::new(&progress, &status, false);
        assert!(processor.process_line("ERROR: something broke"));
        assert!(!processor.process_line("DEBUG: paramiko chatter"));
    }
}
