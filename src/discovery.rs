//! Test tree walking and execution-plan construction.
//!
//! Grounded in the teacher's directory-walking style (plain recursive
//! `std::fs`/`walkdir`-free traversal, as `framework::pytest` used when
//! scanning for `test_*.py` files) combined with the original spec's exact
//! skip rules: non-`.py` files, `__pycache__` segments, leaf names starting
//! with `_`, and files outside a known import/decorator shape are recorded
//! as skipped rather than causing the walk to fail.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::info;

use crate::resolver::{TestFileRecord, TestLane, TestTypeResolver};
use crate::tagfilter::TagFilter;

/// The immutable result of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub api_tests: Vec<TestFileRecord>,
    pub d2d_tests: Vec<TestFileRecord>,
    pub skipped_files: Vec<(PathBuf, String)>,
    tag_filtered_count: usize,
    path_to_type: HashMap<PathBuf, TestLane>,
}

impl ExecutionPlan {
    pub fn get_test_type(&self, path: &Path) -> Option<TestLane> {
        self.path_to_type.get(path).copied()
    }

    pub fn tag_filtered_count(&self) -> usize {
        self.tag_filtered_count
    }

    pub fn is_empty(&self) -> bool {
        self.api_tests.is_empty() && self.d2d_tests.is_empty()
    }
}

/// Walks a test tree, classifies files, and applies tag filtering.
pub struct TestDiscovery {
    import_pattern: Regex,
    decorator_pattern: Regex,
    resolver: TestTypeResolver,
}

impl Default for TestDiscovery {
    fn default() -> Self {
        Self {
            // The known helper package this suite's tests import from.
            import_pattern: Regex::new(r"^\s*(from|import)\s+nac_test(\.|_| )").unwrap(),
            // The known decorator family marking a class/function as a test.
            decorator_pattern: Regex::new(r"^\s*@(pytest\.mark\.|nac_test\.)").unwrap(),
            resolver: TestTypeResolver::new(),
        }
    }
}

impl TestDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(mut self, resolver: TestTypeResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Builds the full execution plan by walking `root`, excluding any
    /// directory under `exclude_dirs`, then applying `tag_filter`.
    pub fn discover(
        &self,
        root: &Path,
        exclude_dirs: &[PathBuf],
        tag_filter: &TagFilter,
    ) -> std::io::Result<ExecutionPlan> {
        let mut candidates = Vec::new();
        let mut skipped_files = Vec::new();
        self.walk(root, exclude_dirs, &mut candidates, &mut skipped_files)?;

        candidates.sort();

        let mut api_tests = Vec::new();
        let mut d2d_tests = Vec::new();
        let mut path_to_type = HashMap::new();
        let mut tag_filtered_count = 0usize;

        for path in candidates {
            let record = self.resolver.resolve(&path)?;
            if !tag_filter.keep(&record) {
                tag_filtered_count += 1;
                continue;
            }
            path_to_type.insert(record.path.clone(), record.test_type);
            match record.test_type {
                TestLane::Api => api_tests.push(record),
                TestLane::D2d => d2d_tests.push(record),
            }
        }

        if !skipped_files.is_empty() {
            let shown = skipped_files.iter().take(5);
            for (path, reason) in shown {
                info!("skipping {}: {}", path.display(), reason);
            }
            if skipped_files.len() > 5 {
                info!("... and {} more skipped files", skipped_files.len() - 5);
            }
        }

        Ok(ExecutionPlan {
            api_tests,
            d2d_tests,
            skipped_files,
            tag_filtered_count,
            path_to_type,
        })
    }

    /// Fast existence check: stops at the first accepting file instead of
    /// building the whole plan.
    pub fn has_tests(&self, root: &Path, exclude_dirs: &[PathBuf]) -> std::io::Result<bool> {
        self.has_tests_inner(root, exclude_dirs)
    }

    fn has_tests_inner(&self, dir: &Path, exclude_dirs: &[PathBuf]) -> std::io::Result<bool> {
        if !dir.exists() {
            return Ok(false);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                if is_excluded(&path, exclude_dirs) || is_pycache(&path) {
                    continue;
                }
                if self.has_tests_inner(&path, exclude_dirs)? {
                    return Ok(true);
                }
            } else if self.accepts(&path)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn walk(
        &self,
        dir: &Path,
        exclude_dirs: &[PathBuf],
        candidates: &mut Vec<PathBuf>,
        skipped: &mut Vec<(PathBuf, String)>,
    ) -> std::io::Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.path());

        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                if is_excluded(&path, exclude_dirs) || is_pycache(&path) {
                    continue;
                }
                self.walk(&path, exclude_dirs, candidates, skipped)?;
                continue;
            }

            if path.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }
            let leaf = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if leaf.starts_with('_') {
                continue;
            }

            if self.accepts(&path)? {
                candidates.push(path);
            } else {
                skipped.push((path, "no recognized test import/decorator".to_string()));
            }
        }
        Ok(())
    }

    fn accepts(&self, path: &Path) -> std::io::Result<bool> {
        let leaf = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if leaf.starts_with('_') {
            return Ok(false);
        }
        let text = std::fs::read_to_string(path)?;
        let has_import = text.lines().any(|l| self.import_pattern.is_match(l));
        let has_decorator = text.lines().any(|l| self.decorator_pattern.is_match(l));
        Ok(has_import && has_decorator)
    }
}

fn is_pycache(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()) == Some("__pycache__")
}

fn is_excluded(path: &Path, exclude_dirs: &[PathBuf]) -> bool {
    exclude_dirs.iter().any(|e| path.ends_with(e) || path == e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_test_file(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    const API_TEST: &str = r#"
import nac_test.api

@pytest.mark.sanity
class TestThing(NACTestBase):
    groups = ["sanity"]
"#;

    #[test]
    fn discovers_and_classifies_accepted_files() {
        let dir = TempDir::new().unwrap();
        write_test_file(dir.path(), "api/test_thing.py", API_TEST);
        write_test_file(dir.path(), "api/_helpers.py", "def helper(): pass\n");
        write_test_file(dir.path(), "api/not_a_test.py", "x = 1\n");

        let discovery = TestDiscovery::new();
        let filter = TagFilter::new(&[], &[]);
        let plan = discovery.discover(dir.path(), &[], &filter).unwrap();

        assert_eq!(plan.api_tests.len(), 1);
        assert_eq!(plan.skipped_files.len(), 1);
    }

    #[test]
    fn excluded_directories_are_skipped_entirely() {
        let dir = TempDir::new().unwrap();
        write_test_file(dir.path(), "api/test_thing.py", API_TEST);
        write_test_file(dir.path(), "ignored/test_other.py", API_TEST);

        let discovery = TestDiscovery::new();
        let filter = TagFilter::new(&[], &[]);
        let plan = discovery
            .discover(dir.path(), &[PathBuf::from("ignored")], &filter)
            .unwrap();

        assert_eq!(plan.api_tests.len(), 1);
    }

    #[test]
    fn pycache_directories_are_never_walked() {
        let dir = TempDir::new().unwrap();
        write_test_file(dir.path(), "__pycache__/test_thing.py", API_TEST);

        let discovery = TestDiscovery::new();
        let filter = TagFilter::new(&[], &[]);
        let plan = discovery.discover(dir.path(), &[], &filter).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn has_tests_stops_at_first_match() {
        let dir = TempDir::new().unwrap();
        write_test_file(dir.path(), "api/test_thing.py", API_TEST);

        let discovery = TestDiscovery::new();
        assert!(discovery.has_tests(dir.path(), &[]).unwrap());
    }

    #[test]
    fn has_tests_false_for_empty_tree() {
        let dir = TempDir::new().unwrap();
        let discovery = TestDiscovery::new();
        assert!(!discovery.has_tests(dir.path(), &[]).unwrap());
    }

    #[test]
    fn path_to_type_map_matches_lane_assignment() {
        let dir = TempDir::new().unwrap();
        write_test_file(dir.path(), "api/test_thing.py", API_TEST);

        let discovery = TestDiscovery::new();
        let filter = TagFilter::new(&[], &[]);
        let plan = discovery.discover(dir.path(), &[], &filter).unwrap();
        let record = &plan.api_tests[0];
        assert_eq!(plan.get_test_type(&record.path), Some(TestLane::Api));
    }
}
