//! API lane execution: a single worker batch covering every API test.
//!
//! Grounded in the teacher's single-sandbox `exec` path (no batching
//! needed when there is exactly one execution unit) -- the API lane has no
//! per-device fan-out, so it is a thin wrapper around one
//! [`crate::subprocess::SubprocessRunner`] invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CoreResult;
use crate::events::{LiveStatus, OutputProcessor};
use crate::job::JobGenerator;
use crate::progress::ProgressReporter;
use crate::resolver::TestLane;
use crate::subprocess::{SubprocessRunner, WorkerRun};

pub const API_ARCHIVE_TAG: &str = "api";

/// Runs every API test as one worker invocation with internal
/// parallelism of `max_workers`.
pub struct APILaneExecutor {
    pub worker_command: Vec<String>,
    pub working_dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl APILaneExecutor {
    pub fn new(worker_command: Vec<String>, working_dir: PathBuf, archive_dir: PathBuf) -> Self {
        Self {
            worker_command,
            working_dir,
            archive_dir,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        test_paths: &[PathBuf],
        max_workers: usize,
        merged_data_path: &Path,
        user_testbed_path: Option<PathBuf>,
        progress: Arc<ProgressReporter>,
        status: Arc<LiveStatus>,
        debug: bool,
    ) -> CoreResult<WorkerRun> {
        let job = JobGenerator::new().generate(
            test_paths,
            max_workers,
            merged_data_path,
            TestLane::Api,
            user_testbed_path,
        );

        let archive_file = SubprocessRunner::archive_file_name(
            API_ARCHIVE_TAG,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0),
        );

        let runner = SubprocessRunner::new(
            self.worker_command.clone(),
            self.working_dir.clone(),
            self.archive_dir.clone(),
        );
        let processor = OutputProcessor::new(&progress, &status, debug);
        runner
            .run(&job, &archive_file, None, |line| processor.process_line(line))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_worker_command_and_returns_outcome() {
        let executor = APILaneExecutor::new(
            vec!["true".to_string()],
            std::env::temp_dir(),
            std::env::temp_dir(),
        );
        let progress = Arc::new(ProgressReporter::new(1, 1));
        let status = Arc::new(LiveStatus::new());
        let run = executor
            .run(
                &[PathBuf::from("api/test_a.py")],
                2,
                Path::new("/tmp/merged.yaml"),
                None,
                progress,
                status,
                false,
            )
            .await
            .unwrap();
        assert_eq!(run.outcome, crate::subprocess::WorkerOutcome::AllPassed);
    }
}
