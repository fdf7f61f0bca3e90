//! Run configuration and merged-data-model loading.
//!
//! Static, operator-controlled settings are loaded from TOML, following the
//! same `serde`-derived, `#[serde(default = "fn")]` shape the teacher crate
//! used for its provider/report configuration. The merged data model and
//! testbed documents the core consumes at runtime are YAML, so those are
//! loaded separately via `serde_yaml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level run configuration, loaded once per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    pub user_testbed_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            resources: ResourceConfig::default(),
            broker: BrokerConfig::default(),
            discovery: DiscoveryConfig::default(),
            test_timeout_secs: default_test_timeout_secs(),
            debug: false,
            dry_run: false,
            output_dir: default_output_dir(),
            user_testbed_path: None,
        }
    }
}

fn default_test_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// Parameters feeding [`crate::resource::ResourceCalculator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_memory_per_worker_gb")]
    pub memory_per_worker_gb: f64,
    #[serde(default = "default_cpu_multiplier")]
    pub cpu_multiplier: f64,
    #[serde(default)]
    pub max_workers_cap: Option<usize>,
    #[serde(default = "default_memory_per_connection_mb")]
    pub memory_per_connection_mb: f64,
    #[serde(default = "default_fds_per_connection")]
    pub fds_per_connection: usize,
    #[serde(default)]
    pub max_connections_cap: Option<usize>,
    #[serde(default)]
    pub max_parallel_devices: Option<usize>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_per_worker_gb: default_memory_per_worker_gb(),
            cpu_multiplier: default_cpu_multiplier(),
            max_workers_cap: None,
            memory_per_connection_mb: default_memory_per_connection_mb(),
            fds_per_connection: default_fds_per_connection(),
            max_connections_cap: None,
            max_parallel_devices: None,
        }
    }
}

fn default_memory_per_worker_gb() -> f64 {
    1.0
}
fn default_cpu_multiplier() -> f64 {
    2.0
}
fn default_memory_per_connection_mb() -> f64 {
    32.0
}
fn default_fds_per_connection() -> usize {
    4
}

/// Connection broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_concurrent_transports: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_dir: None,
            max_concurrent_transports: None,
        }
    }
}

/// Discovery and filtering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_tests_root")]
    pub tests_root: PathBuf,
    #[serde(default)]
    pub exclude_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub include_tags: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            tests_root: default_tests_root(),
            exclude_dirs: Vec::new(),
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
        }
    }
}

fn default_tests_root() -> PathBuf {
    PathBuf::from("tests")
}

/// Loads run configuration from a TOML file. Missing file is not an error;
/// callers that want a config file to be mandatory should check existence
/// first.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    load_config_str(&content)
}

pub fn load_config_str(content: &str) -> Result<RunConfig> {
    let config: RunConfig =
        toml::from_str(content).context("failed to parse run configuration")?;
    Ok(config)
}

/// The merged data model: an opaque YAML mapping produced upstream (e.g. by
/// a data-model merge step that is out of scope for this core) plus the
/// subset of structure the core actually reads -- device entries, keyed
/// however the original document nests them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergedDataModel {
    #[serde(flatten)]
    pub raw: HashMap<String, serde_yaml::Value>,
}

impl MergedDataModel {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read merged data model: {}", path.display()))?;
        let model: MergedDataModel = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse merged data model: {}", path.display()))?;
        Ok(model)
    }

    pub fn get(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.raw.get(key)
    }
}

/// Expands environment variable references in a string value.
///
/// Syntax:
/// - `${VAR}` - required, fails if VAR is not set
/// - `${VAR:-default}` - optional, uses "default" if VAR not set
/// - `$$` - escaped dollar sign (becomes single `$`)
pub fn expand_env_value(value: &str) -> Result<String, String> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            match chars.peek() {
                Some('$') => {
                    chars.next();
                    result.push('$');
                }
                Some('{') => {
                    chars.next();
                    let mut var_content = String::new();
                    let mut found_close = false;

                    for c in chars.by_ref() {
                        if c == '}' {
                            found_close = true;
                            break;
                        }
                        var_content.push(c);
                    }

                    if !found_close {
                        return Err(format!("Unclosed variable reference: ${{{var_content}"));
                    }

                    let (var_name, default_value) = if let Some(idx) = var_content.find(":-") {
                        let (name, rest) = var_content.split_at(idx);
                        (name, Some(&rest[2..]))
                    } else {
                        (var_content.as_str(), None)
                    };

                    if var_name.is_empty() {
                        return Err("Empty variable name in ${}".to_string());
                    }

                    match std::env::var(var_name) {
                        Ok(val) => result.push_str(&val),
                        Err(_) => {
                            if let Some(default) = default_value {
                                result.push_str(default);
                            } else {
                                return Err(format!(
                                    "Required environment variable not set: {var_name}"
                                ));
                            }
                        }
                    }
                }
                _ => result.push('$'),
            }
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_timeout() {
        let config = RunConfig::default();
        assert_eq!(config.test_timeout_secs, 6 * 60 * 60);
    }

    #[test]
    fn load_config_str_parses_minimal_toml() {
        let config = load_config_str(
            r#"
            test_timeout_secs = 120
            debug = true

            [resources]
            memory_per_worker_gb = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(config.test_timeout_secs, 120);
        assert!(config.debug);
        assert_eq!(config.resources.memory_per_worker_gb, 2.0);
    }

    #[test]
    fn expand_env_value_default_used_when_unset() {
        let result = expand_env_value("${_NAC_TEST_CORE_TEST_MISSING:-fallback}").unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn expand_env_value_required_missing_errors() {
        let result = expand_env_value("${_NAC_TEST_CORE_TEST_NONEXISTENT}");
        assert!(result.is_err());
    }

    #[test]
    fn merged_data_model_loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.yaml");
        std::fs::write(&path, "devices:\n  r1:\n    host: 1.2.3.4\n").unwrap();
        let model = MergedDataModel::load(&path).unwrap();
        assert!(model.get("devices").is_some());
    }
}
