//! Per-worker job descriptors.
//!
//! Grounded in the teacher's `config::SandboxConfig`/`SandboxResources`
//! (the self-contained, serializable bundle handed to a provider to start
//! one execution unit) generalized to the spec's `JobDescriptor`: absolute
//! test paths, worker count, merged-data-file path, lane tag, and the
//! environment overrides `SubprocessRunner` applies.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::resolver::TestLane;

/// A self-contained description of one worker invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub test_paths: Vec<PathBuf>,
    pub worker_count: usize,
    pub merged_data_path: PathBuf,
    pub lane: TestLane,
    pub env: BTreeMap<String, String>,
    pub testbed_path: Option<PathBuf>,
}

/// Builds `JobDescriptor`s from a path list and worker count.
#[derive(Debug, Default)]
pub struct JobGenerator;

impl JobGenerator {
    pub fn new() -> Self {
        Self
    }

    /// `merged_data_path` is canonicalized to an absolute path; the caller
    /// is responsible for ensuring it exists.
    pub fn generate(
        &self,
        test_paths: &[PathBuf],
        worker_count: usize,
        merged_data_path: &Path,
        lane: TestLane,
        testbed_path: Option<PathBuf>,
    ) -> JobDescriptor {
        let mut paths: Vec<PathBuf> = test_paths
            .iter()
            .map(|p| absolutize(p))
            .collect();
        paths.sort();

        let mut env = BTreeMap::new();
        env.insert(
            "MERGED_DATA_MODEL_TEST_VARIABLES_FILEPATH".to_string(),
            absolutize(merged_data_path).to_string_lossy().to_string(),
        );
        env.insert("NAC_TEST_TYPE".to_string(), lane.as_str().to_string());

        JobDescriptor {
            test_paths: paths,
            worker_count,
            merged_data_path: absolutize(merged_data_path),
            lane,
            env,
            testbed_path,
        }
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_sets_lane_env_and_sorts_paths() {
        let generator = JobGenerator::new();
        let job = generator.generate(
            &[PathBuf::from("b.py"), PathBuf::from("a.py")],
            4,
            Path::new("/tmp/merged.yaml"),
            TestLane::Api,
            None,
        );
        assert_eq!(job.worker_count, 4);
        assert_eq!(job.env.get("NAC_TEST_TYPE"), Some(&"api".to_string()));
        assert!(job.test_paths[0].ends_with("a.py"));
        assert!(job.test_paths[1].ends_with("b.py"));
    }

    #[test]
    fn merged_data_path_is_absolute() {
        let generator = JobGenerator::new();
        let job = generator.generate(&[], 1, Path::new("merged.yaml"), TestLane::D2d, None);
        assert!(job.merged_data_path.is_absolute());
    }
}
