//! Worker subprocess launch and supervision.
//!
//! Grounded in the teacher's `provider::process::ProcessSandbox::exec_stream`
//! (merged stdout/stderr via `futures::stream::select` over two
//! `LinesStream`s) for the streaming shape, generalized to pipe each line
//! through a caller-supplied handler instead of returning an `OutputStream`,
//! since here the handler (`OutputProcessor`) must update shared state as
//! lines arrive rather than let the caller consume them lazily.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{error, warn};

use crate::error::{CoreError, CoreResult};
use crate::job::JobDescriptor;

/// How a worker invocation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    AllPassed,
    SomeFailed,
    ExecutionError(i32),
}

/// Result of one worker run: its outcome and, on success, the archive it
/// produced.
#[derive(Debug, Clone)]
pub struct WorkerRun {
    pub outcome: WorkerOutcome,
    pub archive_path: Option<PathBuf>,
}

/// Launches one worker subprocess per call and supervises it to completion.
pub struct SubprocessRunner {
    /// Command used to launch the worker, e.g. `["python3", "-m",
    /// "nac_test.pyats_core.worker"]` -- kept generic since the actual
    /// worker entry point is outside this crate's scope.
    pub worker_command: Vec<String>,
    pub working_dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl SubprocessRunner {
    pub fn new(worker_command: Vec<String>, working_dir: PathBuf, archive_dir: PathBuf) -> Self {
        Self {
            worker_command,
            working_dir,
            archive_dir,
        }
    }

    /// Deterministic archive file name from the job's lane and the current
    /// time: `{lane}-{millis}.tar`.
    pub fn archive_file_name(lane_tag: &str, millis_since_epoch: u128) -> String {
        format!("{lane_tag}-{millis_since_epoch}.tar")
    }

    /// Runs one job to completion, piping each merged stdout/stderr line
    /// through `on_line`. `on_line` returns whether the line should be
    /// echoed to the terminal; this runner does the echoing so callers
    /// don't need direct stdout access.
    pub async fn run<F>(
        &self,
        job: &JobDescriptor,
        archive_file_name: &str,
        broker_socket_path: Option<&Path>,
        mut on_line: F,
    ) -> CoreResult<WorkerRun>
    where
        F: FnMut(&str) -> bool,
    {
        let Some((program, rest)) = self.worker_command.split_first() else {
            return Err(CoreError::Configuration("empty worker command".to_string()));
        };

        let mut command = tokio::process::Command::new(program);
        command.args(rest);
        command.current_dir(&self.working_dir);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(Stdio::null());

        for (key, value) in env_overrides(job, &self.archive_dir, archive_file_name, broker_socket_path) {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|source| CoreError::WorkerLaunch {
                lane: job.lane.as_str().to_string(),
                source,
            })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stdout_lines = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines());
        let stderr_lines = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines());
        let mut merged = stream::select(stdout_lines, stderr_lines);

        while let Some(line) = merged.next().await {
            match line {
                Ok(line) => {
                    if on_line(&line) {
                        println!("{line}");
                    }
                }
                Err(err) => warn!("error reading worker output: {err}"),
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|source| CoreError::WorkerLaunch {
                lane: job.lane.as_str().to_string(),
                source,
            })?;

        let archive_path = self.archive_dir.join(archive_file_name);

        match status.code() {
            Some(0) => Ok(WorkerRun {
                outcome: WorkerOutcome::AllPassed,
                archive_path: archive_path.is_file().then_some(archive_path),
            }),
            Some(1) => Ok(WorkerRun {
                outcome: WorkerOutcome::SomeFailed,
                archive_path: archive_path.is_file().then_some(archive_path),
            }),
            Some(code) => {
                error!(code, lane = job.lane.as_str(), "worker execution error");
                Ok(WorkerRun {
                    outcome: WorkerOutcome::ExecutionError(code),
                    archive_path: None,
                })
            }
            None => Err(CoreError::WorkerExecution {
                lane: job.lane.as_str().to_string(),
                code: -1,
            }),
        }
    }

    /// Terminates an in-flight worker, awaiting exit with a bounded timeout
    /// before giving up. Used when the orchestrator cancels a run.
    pub async fn cancel(mut child: Child, grace_period: Duration) {
        if let Some(id) = child.id() {
            send_sigterm(id);
        }
        let _ = tokio::time::timeout(grace_period, child.wait()).await;
        let _ = child.kill().await;
    }
}

/// Sends `SIGTERM` by shelling out to `kill`, matching this crate's stance
/// of not pulling in a syscall-binding crate for one call (cf.
/// `resource::available_fd_limit`).
fn send_sigterm(pid: u32) {
    let _ = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status();
}

fn env_overrides(
    job: &JobDescriptor,
    archive_dir: &Path,
    archive_file_name: &str,
    broker_socket_path: Option<&Path>,
) -> BTreeMap<String, String> {
    let mut env = job.env.clone();
    env.insert("PYTHONWARNINGS".to_string(), "ignore".to_string());
    env.insert("NAC_TEST_ARCHIVE_DIR".to_string(), archive_dir.to_string_lossy().to_string());
    env.insert("NAC_TEST_ARCHIVE_FILE".to_string(), archive_file_name.to_string());
    if let Some(testbed_path) = &job.testbed_path {
        env.insert(
            "PYATS_TESTBED_FILE".to_string(),
            testbed_path.to_string_lossy().to_string(),
        );
    }
    if let Some(socket) = broker_socket_path {
        env.insert(
            "NAC_TEST_BROKER_SOCKET".to_string(),
            socket.to_string_lossy().to_string(),
        );
    }
    env
}
