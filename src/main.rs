//! nac-test-core CLI -- test orchestration core for network-infrastructure
//! test suites. Argument parsing here is deliberately thin: the real
//! front end (help text, flag ergonomics) is out of scope for this crate;
//! this binary exists to exercise the library end to end.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use nac_test_core::config::{self, MergedDataModel};
use nac_test_core::discovery::TestDiscovery;
use nac_test_core::orchestrator::{
    CombinedOrchestrator, LaneSelection, NullNonCoreLane, PyATSOrchestrator,
};
use nac_test_core::tagfilter::TagFilter;

#[derive(Parser)]
#[command(name = "nac-test-core")]
#[command(about = "Test orchestration core for network-infrastructure test suites", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "nac-test-core.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover and execute the api and d2d lanes
    Run {
        /// Merged data model YAML (device inventory, test variables)
        #[arg(long)]
        merged_data: PathBuf,

        /// Command used to launch one worker, e.g. "python -m pytest"
        #[arg(long, default_value = "python -m pytest")]
        worker_command: String,

        /// Only discover tests and print the plan, don't run them
        #[arg(long)]
        dry_run: bool,

        /// Retain worker archives and verbose worker output
        #[arg(long)]
        debug: bool,
    },

    /// Discover tests without running them
    Discover {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let exit_code = match cli.command {
        Commands::Run {
            merged_data,
            worker_command,
            dry_run,
            debug,
        } => run(&cli.config, &merged_data, &worker_command, dry_run, debug).await?,
        Commands::Discover { format } => {
            discover(&cli.config, &format)?;
            0
        }
        Commands::Validate => {
            validate_config(&cli.config)?;
            0
        }
        Commands::Init => {
            init_config()?;
            0
        }
    };

    std::process::exit(exit_code);
}

async fn run(
    config_path: &Path,
    merged_data_path: &Path,
    worker_command: &str,
    dry_run: bool,
    debug: bool,
) -> Result<i32> {
    let mut run_config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    run_config.dry_run = dry_run || run_config.dry_run;
    run_config.debug = debug || run_config.debug;

    info!("loaded configuration from {}", config_path.display());

    let merged_data = MergedDataModel::load(merged_data_path).with_context(|| {
        format!(
            "failed to load merged data model from {}",
            merged_data_path.display()
        )
    })?;

    let worker_command: Vec<String> = shell_words::split(worker_command)
        .with_context(|| format!("invalid worker command: {worker_command}"))?;
    let working_dir = std::env::current_dir()?;

    let core = PyATSOrchestrator::new(run_config, worker_command, working_dir);
    let combined = CombinedOrchestrator::new(
        core,
        std::sync::Arc::new(NullNonCoreLane),
        LaneSelection::default(),
    );

    let result = combined.run(&merged_data).await?;

    for (framework, results) in &result.by_framework {
        info!(
            "{framework}: {} passed, {} failed, {} skipped, {} errored",
            results.passed, results.failed, results.skipped, results.errored
        );
    }
    info!(
        "combined: {} passed, {} failed, {} skipped, {} errored (success_rate={:.1}%)",
        result.combined.passed,
        result.combined.failed,
        result.combined.skipped,
        result.combined.errored,
        result.summary.success_rate
    );

    Ok(result.exit_code())
}

fn discover(config_path: &Path, format: &str) -> Result<()> {
    let run_config = config::load_config(config_path)?;
    let tag_filter = TagFilter::new(
        &run_config.discovery.include_tags,
        &run_config.discovery.exclude_tags,
    );
    let plan = TestDiscovery::new().discover(
        &run_config.discovery.tests_root,
        &run_config.discovery.exclude_dirs,
        &tag_filter,
    )?;

    match format {
        "json" => {
            let summary = serde_json::json!({
                "api": plan.api_tests.iter().map(|r| r.path.to_string_lossy()).collect::<Vec<_>>(),
                "d2d": plan.d2d_tests.iter().map(|r| r.path.to_string_lossy()).collect::<Vec<_>>(),
                "skipped": plan.skipped_files.len(),
                "tag_filtered": plan.tag_filtered_count(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        _ => {
            println!("api lane ({} tests):", plan.api_tests.len());
            for record in &plan.api_tests {
                println!("  {}", record.path.display());
            }
            println!("d2d lane ({} tests):", plan.d2d_tests.len());
            for record in &plan.d2d_tests {
                println!("  {}", record.path.display());
            }
            println!(
                "skipped {} files, {} removed by tag filter",
                plan.skipped_files.len(),
                plan.tag_filtered_count()
            );
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(run_config) => {
            println!("configuration is valid!");
            println!();
            println!("settings:");
            println!("  tests root: {}", run_config.discovery.tests_root.display());
            println!("  test timeout: {}s", run_config.test_timeout_secs);
            println!(
                "  memory per worker: {} GB, cpu multiplier: {}",
                run_config.resources.memory_per_worker_gb, run_config.resources.cpu_multiplier
            );
            println!("  output dir: {}", run_config.output_dir.display());
            Ok(())
        }
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    }
}

fn init_config() -> Result<()> {
    let path = PathBuf::from("nac-test-core.toml");
    if path.exists() {
        eprintln!("nac-test-core.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    let config = r#"# nac-test-core configuration file

[resources]
memory_per_worker_gb = 1.0
cpu_multiplier = 2.0
memory_per_connection_mb = 32.0
fds_per_connection = 4

[broker]
# socket_dir = "/tmp"

[discovery]
tests_root = "tests"
exclude_dirs = []
include_tags = []
exclude_tags = []

test_timeout_secs = 21600
debug = false
dry_run = false
output_dir = "output"
# user_testbed_path = "testbed.yaml"
"#;

    std::fs::write(&path, config)?;
    println!("created nac-test-core.toml");
    println!();
    println!("edit the configuration as needed, then run:");
    println!("  nac-test-core run --merged-data merged_data.yaml");

    Ok(())
}
