//! D2D lane execution: one worker subprocess per device, batched.
//!
//! Grounded in the teacher's `executor::scheduler::Scheduler::schedule_with_batch_size`
//! for the "partition the unit list into fixed-size batches, run one batch
//! at a time" shape, and in `orchestrator::Orchestrator` for concurrent
//! per-unit fan-out -- reimplemented with `Arc` + `tokio::spawn` instead of
//! the teacher's `tokio_scoped::scope`, since `tokio_scoped` is not part of
//! this crate's dependency stack.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::archive::{ArchiveAggregator, DeviceArchive};
use crate::device::DeviceRecord;
use crate::error::{CoreError, CoreResult};
use crate::events::{LiveStatus, OutputProcessor};
use crate::job::JobGenerator;
use crate::progress::ProgressReporter;
use crate::resolver::TestLane;
use crate::subprocess::{SubprocessRunner, WorkerOutcome};
use crate::testbed::{Testbed, TestbedBuilder};

/// Partitions `items` into batches of at most `batch_size`, preserving
/// order.
pub fn batches<T: Clone>(items: &[T], batch_size: usize) -> Vec<Vec<T>> {
    if batch_size == 0 {
        return vec![items.to_vec()];
    }
    items.chunks(batch_size).map(|c| c.to_vec()).collect()
}

/// Runs every D2D test path against every resolved device, one subprocess
/// per device per batch.
pub struct DeviceExecutor {
    pub worker_command: Vec<String>,
    pub working_dir: PathBuf,
    pub per_device_archive_dir: PathBuf,
    pub lane_archive_dir: PathBuf,
}

impl DeviceExecutor {
    pub fn new(
        worker_command: Vec<String>,
        working_dir: PathBuf,
        per_device_archive_dir: PathBuf,
        lane_archive_dir: PathBuf,
    ) -> Self {
        Self {
            worker_command,
            working_dir,
            per_device_archive_dir,
            lane_archive_dir,
        }
    }

    /// Runs `test_paths` against every device in `devices`, batched by
    /// `batch_size` with a concurrency cap of `min(worker_capacity,
    /// batch_size)` within each batch. Returns the merged lane archive path
    /// (or `None` if no device produced one) plus the outcome of each
    /// device run for failure reporting.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        test_paths: &[PathBuf],
        devices: &[DeviceRecord],
        user_base: Option<&Testbed>,
        batch_size: usize,
        worker_capacity: usize,
        merged_data_path: &Path,
        broker_socket_path: Option<&Path>,
        progress: Arc<ProgressReporter>,
        status: Arc<LiveStatus>,
        debug: bool,
    ) -> CoreResult<(Option<PathBuf>, Vec<(String, WorkerOutcome)>)> {
        let job_generator = Arc::new(JobGenerator::new());
        let testbed_builder = Arc::new(TestbedBuilder::new());
        let user_base = user_base.cloned().map(Arc::new);

        let device_batches = batches(devices, batch_size.max(1));
        let mut outcomes = Vec::new();
        let mut archives = Vec::new();

        for batch in device_batches {
            let semaphore = Arc::new(Semaphore::new(worker_capacity.min(batch.len().max(1)).max(1)));
            let mut handles = Vec::new();

            for device in batch {
                let semaphore = Arc::clone(&semaphore);
                let job_generator = Arc::clone(&job_generator);
                let testbed_builder = Arc::clone(&testbed_builder);
                let user_base = user_base.clone();
                let worker_command = self.worker_command.clone();
                let working_dir = self.working_dir.clone();
                let archive_dir = self.per_device_archive_dir.clone();
                let merged_data_path = merged_data_path.to_path_buf();
                let broker_socket_path = broker_socket_path.map(Path::to_path_buf);
                let test_paths = test_paths.to_vec();
                let progress = Arc::clone(&progress);
                let status = Arc::clone(&status);

                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore never closed");

                    let testbed = testbed_builder.build_single(&device, user_base.as_deref());
                    let testbed_path = archive_dir.join(format!("{}.testbed.yaml", device.hostname));
                    if let Err(err) = testbed.write_to(&testbed_path) {
                        return (device.hostname.clone(), Err(CoreError::Other(err)));
                    }

                    let job = job_generator.generate(
                        &test_paths,
                        1,
                        &merged_data_path,
                        TestLane::D2d,
                        Some(testbed_path),
                    );

                    let runner = SubprocessRunner::new(worker_command, working_dir, archive_dir.clone());
                    let archive_file = SubprocessRunner::archive_file_name(
                        &format!("d2d-{}", device.hostname),
                        std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_millis())
                            .unwrap_or(0),
                    );

                    let processor = OutputProcessor::new(&progress, &status, debug);
                    let run_result = runner
                        .run(&job, &archive_file, broker_socket_path.as_deref(), |line| {
                            processor.process_line(line)
                        })
                        .await;

                    (device.hostname.clone(), run_result)
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok((hostname, Ok(run))) => {
                        if let Some(path) = run.archive_path.clone() {
                            archives.push(DeviceArchive { hostname: hostname.clone(), path });
                        }
                        outcomes.push((hostname, run.outcome));
                    }
                    Ok((hostname, Err(err))) => {
                        error!("device {hostname} worker failed: {err}");
                        outcomes.push((hostname, WorkerOutcome::ExecutionError(-1)));
                    }
                    Err(join_err) => {
                        error!("device worker task panicked: {join_err}");
                    }
                }
            }
        }

        if archives.is_empty() {
            return Ok((None, outcomes));
        }

        let merged = ArchiveAggregator::new()
            .aggregate(&archives, &self.lane_archive_dir)
            .await?;
        info!("merged {} device archives into {}", archives.len(), merged.display());
        Ok((Some(merged), outcomes))
    }

    /// Cancels every in-flight worker, giving each `grace_period` to exit
    /// before being killed. Called when the orchestrator aborts mid-batch.
    pub async fn cancel_all(handles: Vec<tokio::process::Child>, grace_period: Duration) {
        for child in handles {
            SubprocessRunner::cancel(child, grace_period).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_splits_preserving_order() {
        let items = vec![1, 2, 3, 4, 5];
        let chunks = batches(&items, 2);
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn batches_with_zero_size_returns_single_batch() {
        let items = vec![1, 2, 3];
        let chunks = batches(&items, 0);
        assert_eq!(chunks, vec![vec![1, 2, 3]]);
    }
}
