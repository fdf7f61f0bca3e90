//! # nac-test-core
//!
//! Test orchestration core for a network-infrastructure test runner: merges
//! operator-supplied data and test templates, discovers tests by static
//! analysis, and concurrently executes two families of tests -- controller
//! ("api") tests and device-to-device ("d2d") tests -- against network
//! controllers or devices directly, collecting structured results into an
//! aggregated report.
//!
//! ## Architecture
//!
//! ### Discovery and classification
//!
//! - [`resolver::TestTypeResolver`] classifies a test file as api/d2d by a
//!   static parse-tree walk, without importing or executing it.
//! - [`discovery::TestDiscovery`] walks a test tree, applies file filters,
//!   and builds an [`discovery::ExecutionPlan`].
//! - [`tagfilter::TagFilter`] narrows a discovered set by include/exclude
//!   tag patterns.
//!
//! ### Two-lane orchestration
//!
//! - [`api_executor::APILaneExecutor`] runs all api tests as one worker
//!   batch.
//! - [`device_executor::DeviceExecutor`] fans d2d tests out per device with
//!   bounded parallelism, backed by the [`broker`] connection broker.
//! - [`orchestrator::PyATSOrchestrator`] owns both lanes; sequences
//!   discovery, parallel execution, and aggregation.
//! - [`orchestrator::CombinedOrchestrator`] selects lanes, runs the
//!   non-core family (out of scope; see [`orchestrator::NonCoreLane`]), and
//!   merges both families' statistics.
//!
//! ### Connection broker
//!
//! - [`broker`] is the long-lived local service that multiplexes device
//!   sessions and caches command outputs across every device-test worker.
//! - [`broker_client::BrokerClient`] is the in-process adapter workers use
//!   to talk to it.
//!
//! ### Reporting
//!
//! - [`archive::ArchiveAggregator`] merges per-device archives into one
//!   lane archive.
//! - [`xunit::XUnitMerger`] combines per-lane JUnit XML into one aggregate
//!   document.
//! - [`summary::SummaryGenerator`] produces ready-to-embed dashboard
//!   statistics.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::PathBuf;
//!
//! use nac_test_core::config::{self, MergedDataModel};
//! use nac_test_core::orchestrator::PyATSOrchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = config::load_config(&PathBuf::from("nac-test-core.toml"))?;
//!     let merged_data = MergedDataModel::load(&PathBuf::from("merged_data.yaml"))?;
//!
//!     let orchestrator = PyATSOrchestrator::new(
//!         config,
//!         vec!["python".to_string(), "-m".to_string(), "pytest".to_string()],
//!         std::env::current_dir()?,
//!     );
//!     let result = orchestrator.run(&merged_data).await?;
//!     println!("{result:?}");
//!     Ok(())
//! }
//! ```

pub mod api_executor;
pub mod archive;
pub mod broker;
pub mod broker_client;
pub mod config;
pub mod device;
pub mod device_executor;
pub mod discovery;
pub mod error;
pub mod events;
pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod resolver;
pub mod resource;
pub mod results;
pub mod retry;
pub mod subprocess;
pub mod summary;
pub mod tagfilter;
pub mod testbed;
pub mod transport;
pub mod xunit;

// Re-export commonly used types for convenience.
// These are the types most users will need when wiring a full run.

pub use config::{MergedDataModel, RunConfig, load_config};
pub use discovery::{ExecutionPlan, TestDiscovery};
pub use error::{CoreError, CoreResult};
pub use orchestrator::{CombinedOrchestrator, CombinedRunResult, PyATSOrchestrator, PyATSRunResult};
pub use results::TestResults;
