//! Top-level orchestration: owns both lanes, then both families.
//!
//! Grounded in the teacher's `orchestrator::Orchestrator` for the overall
//! "discover, launch concurrently, collect into one `RunResult`" shape --
//! reimplemented without `tokio_scoped` (not part of this crate's
//! dependency stack) using `tokio::join!` for the two-lane fan-out, which
//! is exactly as parallel as the teacher's scoped spawns for a fixed pair
//! of futures.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::api_executor::APILaneExecutor;
use crate::broker::{start_broker, DefaultTransportFactory};
use crate::config::{MergedDataModel, RunConfig};
use crate::device::DeviceInventory;
use crate::device_executor::DeviceExecutor;
use crate::discovery::TestDiscovery;
use crate::error::{CoreError, CoreResult};
use crate::events::{LiveStatus, TaskStatus};
use crate::progress::ProgressReporter;
use crate::resolver::TestLane;
use crate::resource::{ResourceCalculator, CONNECTION_CAPACITY_ENV_VAR, WORKER_CAPACITY_ENV_VAR};
use crate::results::TestResults;
use crate::retry::RetryPolicy;
use crate::subprocess::WorkerOutcome;
use crate::summary::SummaryGenerator;
use crate::tagfilter::TagFilter;
use crate::testbed::{Testbed, TestbedBuilder};
use crate::xunit::XUnitMerger;

/// Recognized controller tags and the environment-variable prefixes the
/// preflight check validates.
const CONTROLLER_TAGS: &[&str] = &["ACI", "SDWAN", "CC", "MERAKI", "FMC", "ISE"];

/// Confirms controller credentials are present before any test runs.
/// Returns the detected controller tag, or `Ok(None)` when no controller
/// lane applies.
pub fn preflight_controller_credentials() -> CoreResult<Option<String>> {
    let explicit = std::env::var("CONTROLLER_TYPE").ok();

    let candidates: Vec<&str> = match explicit.as_deref() {
        Some(tag) if CONTROLLER_TAGS.contains(&tag) => vec![tag],
        Some(tag) => {
            return Err(CoreError::Configuration(format!(
                "CONTROLLER_TYPE={tag} is not a recognized controller tag (expected one of {CONTROLLER_TAGS:?})"
            )));
        }
        None => CONTROLLER_TAGS.to_vec(),
    };

    let mut detected = None;
    for tag in &candidates {
        let url = std::env::var(format!("{tag}_URL")).ok();
        let username = std::env::var(format!("{tag}_USERNAME")).ok();
        let password = std::env::var(format!("{tag}_PASSWORD")).ok();
        if url.is_some() || username.is_some() || password.is_some() {
            let missing: Vec<String> = [
                ("URL", &url),
                ("USERNAME", &username),
                ("PASSWORD", &password),
            ]
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(name, _)| format!("{tag}_{name}"))
            .collect();
            if !missing.is_empty() {
                return Err(CoreError::Configuration(format!(
                    "controller {tag} is missing required variable(s): {}",
                    missing.join(", ")
                )));
            }
            detected = Some(tag.to_string());
            break;
        }
    }

    Ok(detected)
}

/// Derives the discovered file path a worker event's `test_name` belongs
/// to, following the pytest nodeid convention (`path/to/file.py::Class::test`)
/// the rest of this crate already assumes for discovered files. This is
/// the bridge `LiveStatus::partition_by` needs between its test_name keys
/// and `ExecutionPlan`'s path-keyed lane map.
pub fn path_of_test_name(test_name: &str) -> PathBuf {
    PathBuf::from(test_name.split("::").next().unwrap_or(test_name))
}

/// Tallies a lane's `LiveStatus` snapshot into pass/fail/skip/error counts.
/// If nothing completed at all and the worker reported an execution
/// error, the lane is recorded as an infrastructure failure instead of a
/// silent zero.
fn results_from_status(
    status: &std::collections::HashMap<String, TaskStatus>,
    had_execution_error: bool,
) -> TestResults {
    use crate::events::TaskResult;

    let mut passed = 0u64;
    let mut failed = 0u64;
    let mut skipped = 0u64;
    let mut errored = 0u64;

    for task in status.values() {
        if let TaskStatus::Completed { result, .. } = task {
            match result {
                TaskResult::Passed => passed += 1,
                TaskResult::Failed => failed += 1,
                TaskResult::Skipped => skipped += 1,
                TaskResult::Errored => errored += 1,
            }
        }
    }

    let counts = TestResults::from_counts(passed, failed, skipped, errored);
    if counts.total == 0 && had_execution_error {
        TestResults::error("worker exited with an unrecoverable error before any test completed")
    } else {
        counts
    }
}

/// A peer to `PyATSOrchestrator` representing the non-core (Robot
/// Framework) lane. Its internals are out of scope; `NullNonCoreLane` is
/// the only implementation this crate ships.
#[async_trait]
pub trait NonCoreLane: Send + Sync {
    async fn run(&self, debug: bool) -> CoreResult<Option<TestResults>>;
}

/// A `NonCoreLane` that never has any tests to run.
#[derive(Debug, Default)]
pub struct NullNonCoreLane;

#[async_trait]
impl NonCoreLane for NullNonCoreLane {
    async fn run(&self, _debug: bool) -> CoreResult<Option<TestResults>> {
        Ok(None)
    }
}

/// Result of one `PyATSOrchestrator` run.
#[derive(Debug, Clone, Default)]
pub struct PyATSRunResult {
    pub api: Option<TestResults>,
    pub d2d: Option<TestResults>,
}

/// Owns the API and D2D lanes: discovery, parallel launch, aggregation.
pub struct PyATSOrchestrator {
    pub config: RunConfig,
    pub worker_command: Vec<String>,
    pub working_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl PyATSOrchestrator {
    pub fn new(config: RunConfig, worker_command: Vec<String>, working_dir: PathBuf) -> Self {
        let output_dir = config.output_dir.clone();
        Self {
            config,
            worker_command,
            working_dir,
            output_dir,
        }
    }

    #[instrument(skip(self, merged_data))]
    pub async fn run(&self, merged_data: &MergedDataModel) -> CoreResult<PyATSRunResult> {
        let detected_controller = preflight_controller_credentials()?;
        if let Some(tag) = &detected_controller {
            info!("validated controller credentials for {tag}");
        }

        let tag_filter = TagFilter::new(
            &self.config.discovery.include_tags,
            &self.config.discovery.exclude_tags,
        );
        let discovery = TestDiscovery::new();
        let plan = discovery
            .discover(
                &self.config.discovery.tests_root,
                &self.config.discovery.exclude_dirs,
                &tag_filter,
            )
            .map_err(|source| CoreError::Discovery {
                path: self.config.discovery.tests_root.clone(),
                source,
            })?;

        if self.config.dry_run {
            info!(
                api = plan.api_tests.len(),
                d2d = plan.d2d_tests.len(),
                filtered = plan.tag_filtered_count(),
                "dry run: plan computed, nothing executed"
            );
            return Ok(PyATSRunResult {
                api: Some(TestResults::error("dry run: not executed")),
                d2d: Some(TestResults::error("dry run: not executed")),
            });
        }

        let (devices, skipped_devices) = DeviceInventory::new().resolve(merged_data);
        for (device_id, reason) in &skipped_devices {
            warn!("skipping device {device_id}: {reason}");
        }

        let resource_calculator = ResourceCalculator::from_system();
        let worker_capacity = resource_calculator.calculate_worker_capacity(
            self.config.resources.memory_per_worker_gb,
            self.config.resources.cpu_multiplier,
            self.config.resources.max_workers_cap,
            WORKER_CAPACITY_ENV_VAR,
        );

        let user_base = Testbed::load_user_base(self.config.user_testbed_path.as_deref())
            .map_err(CoreError::Other)?;
        let consolidated_testbed = TestbedBuilder::new().build_consolidated(&devices, user_base.as_ref());

        let merged_data_path = self.output_dir.join("merged_data_model_test_variables.yaml");
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(CoreError::Io)?;
        let merged_yaml = serde_yaml::to_string(merged_data)
            .map_err(|err| CoreError::Other(anyhow::anyhow!(err)))?;
        tokio::fs::write(&merged_data_path, merged_yaml)
            .await
            .map_err(CoreError::Io)?;

        let progress = Arc::new(ProgressReporter::new(
            plan.api_tests.len() + plan.d2d_tests.len(),
            worker_capacity,
        ));
        let status = Arc::new(LiveStatus::new());

        let api_archive_dir = self.output_dir.join("pyats_results").join("api");
        let d2d_archive_dir = self.output_dir.join("pyats_results").join("d2d");
        let d2d_per_device_dir = d2d_archive_dir.join("_per_device");

        let api_paths: Vec<PathBuf> = plan.api_tests.iter().map(|r| r.path.clone()).collect();
        let d2d_paths: Vec<PathBuf> = plan.d2d_tests.iter().map(|r| r.path.clone()).collect();

        let broker_handle = if !d2d_paths.is_empty() && !devices.is_empty() {
            let socket_dir = self
                .config
                .broker
                .socket_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            let socket_path = socket_dir.join("nac-test-broker.sock");
            let max_transports = self.config.broker.max_concurrent_transports.or_else(|| {
                Some(resource_calculator.calculate_connection_capacity(
                    self.config.resources.memory_per_connection_mb,
                    self.config.resources.fds_per_connection,
                    self.config.resources.max_connections_cap,
                    CONNECTION_CAPACITY_ENV_VAR,
                ))
            });
            let factory = Box::new(DefaultTransportFactory {
                command_timeout: std::time::Duration::from_secs(self.config.test_timeout_secs.min(60)),
            });
            match start_broker(
                socket_path,
                devices.clone(),
                &consolidated_testbed,
                max_transports,
                RetryPolicy::default(),
                factory,
            )
            .await
            {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!("failed to start connection broker: {err}; device tests will run without caching");
                    None
                }
            }
        } else {
            None
        };
        let broker_socket_path = broker_handle.as_ref().map(|h| h.socket_path().to_path_buf());

        let api_future = async {
            if api_paths.is_empty() {
                return Ok(None);
            }
            let executor = APILaneExecutor::new(
                self.worker_command.clone(),
                self.working_dir.clone(),
                api_archive_dir.clone(),
            );
            executor
                .run(
                    &api_paths,
                    worker_capacity,
                    &merged_data_path,
                    self.config.user_testbed_path.clone(),
                    Arc::clone(&progress),
                    Arc::clone(&status),
                    self.config.debug,
                )
                .await
                .map(Some)
        };

        let d2d_future = async {
            if d2d_paths.is_empty() || devices.is_empty() {
                return Ok((None, Vec::new()));
            }
            let batch_size = self
                .config
                .resources
                .max_parallel_devices
                .map(|cap| worker_capacity.min(cap))
                .unwrap_or(worker_capacity);
            let executor = DeviceExecutor::new(
                self.worker_command.clone(),
                self.working_dir.clone(),
                d2d_per_device_dir.clone(),
                d2d_archive_dir.clone(),
            );
            executor
                .run(
                    &d2d_paths,
                    &devices,
                    user_base.as_ref(),
                    batch_size,
                    worker_capacity,
                    &merged_data_path,
                    broker_socket_path.as_deref(),
                    Arc::clone(&progress),
                    Arc::clone(&status),
                    self.config.debug,
                )
                .await
        };

        let (api_result, d2d_result) = tokio::join!(api_future, d2d_future);
        let api_run = api_result?;
        let (d2d_archive, d2d_outcomes) = d2d_result?;

        if let Some(handle) = broker_handle {
            handle.shutdown().await;
        }

        let (api_status, d2d_status) = status.partition_by(|test_name| {
            plan.get_test_type(&path_of_test_name(test_name)) == Some(TestLane::Api)
        });
        info!(
            api_tracked = api_status.len(),
            d2d_tracked = d2d_status.len(),
            "live status partitioned by lane"
        );

        let api_results = api_run.as_ref().map(|run| {
            results_from_status(&api_status, matches!(run.outcome, WorkerOutcome::ExecutionError(_)))
        });
        let d2d_results = if !d2d_paths.is_empty() {
            let had_execution_error = d2d_outcomes
                .iter()
                .any(|(_, outcome)| matches!(outcome, WorkerOutcome::ExecutionError(_)));
            Some(results_from_status(&d2d_status, had_execution_error))
        } else {
            None
        };

        let mut xunit_sources: Vec<(String, PathBuf)> = Vec::new();
        if api_run.is_some() {
            xunit_sources.push(("pyats_api".to_string(), api_archive_dir.join("xunit.xml")));
        }
        for (hostname, _) in &d2d_outcomes {
            xunit_sources.push((
                format!("pyats_d2d:{hostname}"),
                d2d_per_device_dir.join(hostname).join("xunit.xml"),
            ));
        }
        let sources: Vec<(String, &std::path::Path)> = xunit_sources
            .iter()
            .map(|(tag, path)| (tag.clone(), path.as_path()))
            .collect();
        if let Err(err) = XUnitMerger::new().merge_to_file(&sources, &self.output_dir.join("xunit.xml")) {
            warn!("failed to write aggregated xunit: {err}");
        }

        if !self.config.debug {
            if let Some(run) = &api_run {
                if let Some(path) = &run.archive_path {
                    let _ = tokio::fs::remove_file(path).await;
                }
            }
            if let Some(path) = &d2d_archive {
                let _ = tokio::fs::remove_dir_all(path).await;
            }
        }

        Ok(PyATSRunResult {
            api: api_results,
            d2d: d2d_results,
        })
    }
}

/// Which families to run.
#[derive(Debug, Clone, Copy)]
pub struct LaneSelection {
    pub run_core: bool,
    pub run_non_core: bool,
}

impl Default for LaneSelection {
    fn default() -> Self {
        Self {
            run_core: true,
            run_non_core: true,
        }
    }
}

/// Final statistics plus exit-code determination across both families.
#[derive(Debug, Clone)]
pub struct CombinedRunResult {
    pub by_framework: BTreeMap<String, TestResults>,
    pub combined: TestResults,
    pub summary: crate::summary::SummaryRecord,
}

impl CombinedRunResult {
    /// 1 if any lane failed or nothing ran at all; 0 otherwise, per §6.
    pub fn exit_code(&self) -> i32 {
        if !self.combined.is_success() || !self.combined.ran_any() {
            1
        } else {
            0
        }
    }
}

/// Selects lanes, runs the core and non-core families, and merges their
/// statistics into the final dashboard record.
pub struct CombinedOrchestrator {
    pub core: PyATSOrchestrator,
    pub non_core: Arc<dyn NonCoreLane>,
    pub selection: LaneSelection,
}

impl CombinedOrchestrator {
    pub fn new(core: PyATSOrchestrator, non_core: Arc<dyn NonCoreLane>, selection: LaneSelection) -> Self {
        Self {
            core,
            non_core,
            selection,
        }
    }

    #[instrument(skip(self, merged_data))]
    pub async fn run(&self, merged_data: &MergedDataModel) -> CoreResult<CombinedRunResult> {
        let mut by_framework = BTreeMap::new();

        if self.selection.run_core {
            let run = self.core.run(merged_data).await?;
            if let Some(api) = run.api {
                by_framework.insert("pyats_api".to_string(), api);
            }
            if let Some(d2d) = run.d2d {
                by_framework.insert("pyats_d2d".to_string(), d2d);
            }
        }

        if self.selection.run_non_core {
            if let Some(results) = self.non_core.run(self.core.config.debug).await? {
                by_framework.insert("robot".to_string(), results);
            }
        }

        let mut combined = TestResults::empty();
        for results in by_framework.values() {
            combined += results.clone();
        }

        let summary = SummaryGenerator::new().combine(
            &by_framework.iter().map(|(k, v)| (k.as_str(), v)).collect::<Vec<_>>(),
            Some(self.core.output_dir.join("combined_summary.html").to_string_lossy().to_string()),
        );

        Ok(CombinedRunResult {
            by_framework,
            combined,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_of_test_name_strips_nodeid_suffix() {
        let path = path_of_test_name("api/test_thing.py::TestThing::test_sanity");
        assert_eq!(path, PathBuf::from("api/test_thing.py"));
    }

    #[test]
    fn path_of_test_name_handles_bare_path() {
        let path = path_of_test_name("api/test_thing.py");
        assert_eq!(path, PathBuf::from("api/test_thing.py"));
    }

    #[test]
    fn results_from_status_counts_completed_tasks() {
        use crate::events::TaskResult;
        let mut map = std::collections::HashMap::new();
        map.insert(
            "t1".to_string(),
            TaskStatus::Completed { test_id: 1, result: TaskResult::Passed, duration: 0.1 },
        );
        map.insert(
            "t2".to_string(),
            TaskStatus::Completed { test_id: 2, result: TaskResult::Failed, duration: 0.2 },
        );
        let results = results_from_status(&map, false);
        assert_eq!(results.passed, 1);
        assert_eq!(results.failed, 1);
    }

    #[test]
    fn results_from_status_reports_error_when_nothing_completed_and_worker_errored() {
        let map = std::collections::HashMap::new();
        let results = results_from_status(&map, true);
        assert!(!results.is_success());
        assert_eq!(results.total, 0);
    }

    #[test]
    fn exit_code_is_one_when_nothing_ran() {
        let result = CombinedRunResult {
            by_framework: BTreeMap::new(),
            combined: TestResults::empty(),
            summary: SummaryGenerator::new().summarize(&TestResults::empty(), None),
        };
        assert_eq!(result.exit_code(), 1);
    }

    #[test]
    fn exit_code_is_zero_when_all_passed() {
        let combined = TestResults::from_counts(5, 0, 0, 0);
        let result = CombinedRunResult {
            by_framework: BTreeMap::new(),
            summary: SummaryGenerator::new().summarize(&combined, None),
            combined,
        };
        assert_eq!(result.exit_code(), 0);
    }

    #[test]
    fn exit_code_is_one_when_any_test_failed() {
        let combined = TestResults::from_counts(5, 1, 0, 0);
        let result = CombinedRunResult {
            by_framework: BTreeMap::new(),
            summary: SummaryGenerator::new().summarize(&combined, None),
            combined,
        };
        assert_eq!(result.exit_code(), 1);
    }
}
