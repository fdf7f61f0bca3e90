//! Static test-type classification.
//!
//! Classifies a test file as `api` or `d2d` without importing or executing
//! it. Grounded in
//! `original_source/nac_test/pyats_core/discovery/test_type_resolver.py`:
//! the base-class mapping, the per-class "first recognized base wins, then
//! extract `groups` from that same class" sequencing, and the directory and
//! default fallbacks are all reproduced from that file's behavior. Because
//! no Python-parser crate appears anywhere in the example corpus, the
//! parse-tree walk is approximated with a line-oriented scanner in the
//! style of the teacher's own `pytest` output scraping: it looks for class
//! headers and indented `groups = [...]` assignments rather than building a
//! real AST.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A test's lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestLane {
    Api,
    D2d,
}

impl TestLane {
    pub fn as_str(self) -> &'static str {
        match self {
            TestLane::Api => "api",
            TestLane::D2d => "d2d",
        }
    }
}

impl std::fmt::Display for TestLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved test file: its lane and the `groups` tags declared on its
/// first recognized test class.
#[derive(Debug, Clone)]
pub struct TestFileRecord {
    pub path: PathBuf,
    pub test_type: TestLane,
    pub groups: Vec<String>,
}

/// Known base-class to lane mapping, reproduced verbatim from
/// `BASE_CLASS_MAPPING` in the original source.
const API_BASES: &[&str] = &[
    "NACTestBase",
    "APICTestBase",
    "SDWANManagerTestBase",
    "CatalystCenterTestBase",
    "MerakiTestBase",
    "FMCTestBase",
    "ISETestBase",
];

const D2D_BASES: &[&str] = &[
    "SSHTestBase",
    "SDWANTestBase",
    "IOSXETestBase",
    "NXOSTestBase",
    "IOSTestBase",
];

fn lane_for_base(base: &str) -> Option<TestLane> {
    if API_BASES.contains(&base) {
        Some(TestLane::Api)
    } else if D2D_BASES.contains(&base) {
        Some(TestLane::D2d)
    } else {
        None
    }
}

/// Raised internally when no top-level class had a recognized base; carries
/// the bases that were seen so callers can log them before falling back.
#[derive(Debug)]
pub struct NoRecognizedBaseError {
    pub found_bases: Vec<String>,
}

pub struct TestTypeResolver {
    default_lane: TestLane,
}

impl Default for TestTypeResolver {
    fn default() -> Self {
        Self {
            default_lane: TestLane::Api,
        }
    }
}

impl TestTypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lane assumed when a file matches neither a known base class nor
    /// an `/api/`/`/d2d/` path segment. Configurable per Open Question
    /// resolution #1: the original warns and defaults to api; this keeps
    /// that behavior but makes the default an explicit setting.
    pub fn with_default_lane(mut self, lane: TestLane) -> Self {
        self.default_lane = lane;
        self
    }

    /// Classifies a single file, reading it from disk.
    pub fn resolve(&self, path: &Path) -> std::io::Result<TestFileRecord> {
        let text = std::fs::read_to_string(path)?;
        Ok(self.resolve_text(path, &text))
    }

    /// Classifies already-read file text. Exposed separately so tests don't
    /// need real files on disk.
    pub fn resolve_text(&self, path: &Path, text: &str) -> TestFileRecord {
        match classify_via_classes(text) {
            Ok((test_type, groups)) => TestFileRecord {
                path: path.to_path_buf(),
                test_type,
                groups,
            },
            Err(NoRecognizedBaseError { found_bases }) => {
                if let Some(lane) = classify_via_directory(path) {
                    TestFileRecord {
                        path: path.to_path_buf(),
                        test_type: lane,
                        groups: Vec::new(),
                    }
                } else {
                    warn!(
                        "No recognized base class in {} (found {:?}); defaulting to {}",
                        path.display(),
                        found_bases,
                        self.default_lane
                    );
                    TestFileRecord {
                        path: path.to_path_buf(),
                        test_type: self.default_lane,
                        groups: Vec::new(),
                    }
                }
            }
        }
    }
}

fn classify_via_directory(path: &Path) -> Option<TestLane> {
    let normalized = path.to_string_lossy().replace('\\', "/");
    if normalized.contains("/d2d/") {
        Some(TestLane::D2d)
    } else if normalized.contains("/api/") {
        Some(TestLane::Api)
    } else {
        None
    }
}

/// Walks top-level `class Name(Base1, Base2):` headers in file order. For
/// each class, bases are checked left to right against the known mapping;
/// the first recognized base wins and `groups` is pulled from that same
/// class body. If a class has no recognized base the walk continues to the
/// next top-level class -- it does not abort the search.
fn classify_via_classes(text: &str) -> Result<(TestLane, Vec<String>), NoRecognizedBaseError> {
    let mut found_bases = Vec::new();
    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if let Some(header) = top_level_class_header(line) {
            let bases = parse_base_names(&header);
            found_bases.extend(bases.iter().cloned());

            let mut lane = None;
            for base in &bases {
                if let Some(l) = lane_for_base(base) {
                    lane = Some(l);
                    break;
                }
            }

            if let Some(lane) = lane {
                let body_end = find_class_body_end(&lines, i + 1);
                let groups = extract_groups(&lines[i + 1..body_end]);
                return Ok((lane, groups));
            }
        }
        i += 1;
    }

    Err(NoRecognizedBaseError { found_bases })
}

/// Returns the parenthesized base-class list text if `line` is a top-level
/// (zero-indent) class header.
fn top_level_class_header(line: &str) -> Option<String> {
    if line.starts_with(' ') || line.starts_with('\t') {
        return None;
    }
    let rest = line.strip_prefix("class ")?;
    let open = rest.find('(')?;
    let close = rest.find(')')?;
    if close < open {
        return None;
    }
    Some(rest[open + 1..close].to_string())
}

/// Splits a base-class list on commas, takes the last dotted segment of
/// each, trimming keyword-argument style entries (e.g. `metaclass=Foo`).
fn parse_base_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && !s.contains('='))
        .map(|s| s.rsplit('.').next().unwrap_or(s).to_string())
        .collect()
}

/// Finds the exclusive end index of a class body, i.e. the first line at or
/// below the class's own indentation (zero) that is not blank, starting the
/// scan at `start`.
fn find_class_body_end(lines: &[&str], start: usize) -> usize {
    let mut i = start;
    while i < lines.len() {
        let line = lines[i];
        if line.trim().is_empty() {
            i += 1;
            continue;
        }
        if !line.starts_with(' ') && !line.starts_with('\t') {
            break;
        }
        i += 1;
    }
    i
}

/// Extracts a `groups = [...]` or `groups: list[str] = [...]` assignment
/// from a class body, possibly spanning multiple lines.
fn extract_groups(body_lines: &[&str]) -> Vec<String> {
    let joined = body_lines.join("\n");
    let Some(eq_pos) = find_groups_assignment(&joined) else {
        return Vec::new();
    };
    let after_eq = &joined[eq_pos..];
    let Some(open) = after_eq.find('[') else {
        return Vec::new();
    };
    let Some(close) = after_eq[open..].find(']') else {
        return Vec::new();
    };
    let list_text = &after_eq[open + 1..open + close];
    parse_string_list(list_text)
}

fn find_groups_assignment(text: &str) -> Option<usize> {
    let mut offset = 0usize;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("groups") {
            let rest = rest.trim_start();
            // Either a plain assignment (`groups = [...]`) or a typed
            // annotation (`groups: list[str] = [...]`); both resolve to the
            // position right after the first `=`.
            let eq_rel = if let Some(stripped) = rest.strip_prefix(':') {
                stripped.find('=').map(|p| p + 1 + 1)
            } else {
                rest.strip_prefix('=').map(|_| 1)
            };
            if let Some(eq_rel) = eq_rel {
                let trimmed_start = line.len() - trimmed.len();
                return Some(offset + trimmed_start + "groups".len() + eq_rel);
            }
        }
        offset += line.len() + 1; // +1 for the '\n' consumed by str::lines
    }
    None
}

/// Parses a comma-separated list of single- or double-quoted string
/// literals.
fn parse_string_list(text: &str) -> Vec<String> {
    text.split(',')
        .filter_map(|item| {
            let item = item.trim();
            let item = item.strip_prefix('"').or_else(|| item.strip_prefix('\''))?;
            let item = item.strip_suffix('"').or_else(|| item.strip_suffix('\''))?;
            if item.is_empty() {
                None
            } else {
                Some(item.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_api_base_with_groups() {
        let text = r#"
class TestAciTenants(NACTestBase):
    groups = ["sanity", "aci"]

    def test_tenant_exists(self):
        pass
"#;
        let resolver = TestTypeResolver::new();
        let record = resolver.resolve_text(Path::new("suite/test_tenants.py"), text);
        assert_eq!(record.test_type, TestLane::Api);
        assert_eq!(record.groups, vec!["sanity", "aci"]);
    }

    #[test]
    fn classifies_d2d_base_via_dotted_import() {
        let text = r#"
class TestInterfaceStatus(pyats_core.SSHTestBase):
    groups = ["interfaces"]
"#;
        let resolver = TestTypeResolver::new();
        let record = resolver.resolve_text(Path::new("suite/test_iface.py"), text);
        assert_eq!(record.test_type, TestLane::D2d);
    }

    #[test]
    fn first_recognized_class_wins_over_later_classes() {
        let text = r#"
class Helper:
    pass

class TestA(NACTestBase):
    groups = ["first"]

class TestB(SSHTestBase):
    groups = ["second"]
"#;
        let resolver = TestTypeResolver::new();
        let record = resolver.resolve_text(Path::new("suite/test_multi.py"), text);
        assert_eq!(record.test_type, TestLane::Api);
        assert_eq!(record.groups, vec!["first"]);
    }

    #[test]
    fn unrecognized_base_falls_back_to_directory() {
        let text = "class TestFoo(SomeOtherBase):\n    pass\n";
        let resolver = TestTypeResolver::new();
        let record = resolver.resolve_text(Path::new("suite/d2d/test_foo.py"), text);
        assert_eq!(record.test_type, TestLane::D2d);
        assert!(record.groups.is_empty());
    }

    #[test]
    fn unrecognized_base_outside_known_dirs_defaults_with_warning() {
        let text = "class TestFoo(SomeOtherBase):\n    pass\n";
        let resolver = TestTypeResolver::new();
        let record = resolver.resolve_text(Path::new("suite/misc/test_foo.py"), text);
        assert_eq!(record.test_type, TestLane::Api);
    }

    #[test]
    fn configurable_default_lane_is_honored() {
        let text = "class TestFoo(SomeOtherBase):\n    pass\n";
        let resolver = TestTypeResolver::new().with_default_lane(TestLane::D2d);
        let record = resolver.resolve_text(Path::new("suite/misc/test_foo.py"), text);
        assert_eq!(record.test_type, TestLane::D2d);
    }

    #[test]
    fn no_class_at_all_falls_back_to_directory_then_default() {
        let text = "def test_free_function():\n    pass\n";
        let resolver = TestTypeResolver::new();
        let record = resolver.resolve_text(Path::new("suite/api/test_free.py"), text);
        assert_eq!(record.test_type, TestLane::Api);
    }
}
