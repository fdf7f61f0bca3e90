//! Tag-pattern filtering over discovered test files.
//!
//! Patterns support literal tags, `&`/`AND`, `OR`, a leading `NOT`, and
//! `*` wildcards. An empty include set keeps everything; exclusion is
//! applied after inclusion. Filtering never reorders its input.

use crate::resolver::TestFileRecord;

/// A single parsed tag pattern.
#[derive(Debug, Clone)]
enum Pattern {
    /// One or more tags that must all be present (split on `&`/`AND`).
    All(Vec<TagMatcher>),
    /// One or more tags where any match is sufficient (split on `OR`, or
    /// the degenerate single-tag case).
    Any(Vec<TagMatcher>),
    /// Negation of an inner pattern (`NOT <pattern>`).
    Not(Box<Pattern>),
}

#[derive(Debug, Clone)]
struct TagMatcher {
    /// Lowercased pattern text; `*` acts as a glob wildcard.
    text: String,
    /// Set when this individual term carried its own leading `NOT`, e.g.
    /// the second term of `a AND NOT c`.
    negate: bool,
}

impl TagMatcher {
    fn matches(&self, groups: &[String]) -> bool {
        let present = if self.text.contains('*') {
            groups.iter().any(|g| glob_match(&self.text, &g.to_lowercase()))
        } else {
            groups.iter().any(|g| g.to_lowercase() == self.text)
        };
        if self.negate { !present } else { present }
    }
}

fn strip_not_prefix(s: &str) -> Option<&str> {
    s.strip_prefix("NOT ").or_else(|| s.strip_prefix("not "))
}

/// Parses one term of an `AND`/`OR` split, honoring a term-local leading
/// `NOT` (e.g. the `NOT c` in `a AND NOT c`), distinct from a `NOT` leading
/// the whole pattern.
fn parse_matcher(raw: &str) -> TagMatcher {
    let trimmed = raw.trim();
    match strip_not_prefix(trimmed) {
        Some(rest) => TagMatcher {
            text: rest.trim().to_lowercase(),
            negate: true,
        },
        None => TagMatcher {
            text: trimmed.to_lowercase(),
            negate: false,
        },
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.is_empty() {
        return true;
    }
    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text[pos..].starts_with(part) {
                return false;
            }
            pos += part.len();
        } else if i == parts.len() - 1 {
            return text[pos..].ends_with(part);
        } else if let Some(found) = text[pos..].find(part) {
            pos += found + part.len();
        } else {
            return false;
        }
    }
    true
}

fn parse_pattern(raw: &str) -> Pattern {
    let trimmed = raw.trim();
    let (negate, body) = match strip_not_prefix(trimmed) {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let pattern = if body.contains('&') || body.to_uppercase().contains(" AND ") {
        let matchers = split_on_any(body, &["&", " AND ", " and "])
            .into_iter()
            .map(|t| parse_matcher(&t))
            .collect();
        Pattern::All(matchers)
    } else {
        let matchers = split_on_any(body, &[" OR ", " or "])
            .into_iter()
            .map(|t| parse_matcher(&t))
            .collect();
        Pattern::Any(matchers)
    };

    if negate {
        Pattern::Not(Box::new(pattern))
    } else {
        pattern
    }
}

fn split_on_any(text: &str, seps: &[&str]) -> Vec<String> {
    let mut pieces = vec![text.to_string()];
    for sep in seps {
        pieces = pieces
            .into_iter()
            .flat_map(|p| p.split(sep).map(|s| s.to_string()).collect::<Vec<_>>())
            .collect();
    }
    pieces
}

impl Pattern {
    fn matches(&self, groups: &[String]) -> bool {
        match self {
            Pattern::All(matchers) => matchers.iter().all(|m| m.matches(groups)),
            Pattern::Any(matchers) => matchers.iter().any(|m| m.matches(groups)),
            Pattern::Not(inner) => !inner.matches(groups),
        }
    }
}

/// Applies include/exclude tag patterns to a set of test file records.
pub struct TagFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl TagFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            include: include.iter().map(|s| parse_pattern(s)).collect(),
            exclude: exclude.iter().map(|s| parse_pattern(s)).collect(),
        }
    }

    /// Returns true if `record` survives both the include and exclude
    /// passes.
    pub fn keep(&self, record: &TestFileRecord) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|p| p.matches(&record.groups));
        if !included {
            return false;
        }
        !self.exclude.iter().any(|p| p.matches(&record.groups))
    }

    /// Filters a slice of records, preserving order.
    pub fn apply<'a>(&self, records: &'a [TestFileRecord]) -> Vec<&'a TestFileRecord> {
        records.iter().filter(|r| self.keep(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::TestLane;
    use std::path::PathBuf;

    fn record(groups: &[&str]) -> TestFileRecord {
        TestFileRecord {
            path: PathBuf::from("x.py"),
            test_type: TestLane::Api,
            groups: groups.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn empty_include_keeps_all() {
        let filter = TagFilter::new(&[], &[]);
        assert!(filter.keep(&record(&["anything"])));
    }

    #[test]
    fn literal_include_narrows() {
        let filter = TagFilter::new(&["sanity".to_string()], &[]);
        assert!(filter.keep(&record(&["sanity"])));
        assert!(!filter.keep(&record(&["regression"])));
    }

    #[test]
    fn and_pattern_requires_all_tags() {
        let filter = TagFilter::new(&["sanity&aci".to_string()], &[]);
        assert!(filter.keep(&record(&["sanity", "aci"])));
        assert!(!filter.keep(&record(&["sanity"])));
    }

    #[test]
    fn or_pattern_requires_any_tag() {
        let filter = TagFilter::new(&["sanity OR regression".to_string()], &[]);
        assert!(filter.keep(&record(&["regression"])));
    }

    #[test]
    fn not_pattern_excludes_via_include_set() {
        let filter = TagFilter::new(&["NOT flaky".to_string()], &[]);
        assert!(!filter.keep(&record(&["flaky"])));
        assert!(filter.keep(&record(&["stable"])));
    }

    #[test]
    fn wildcard_matches_substrings() {
        let filter = TagFilter::new(&["aci-*".to_string()], &[]);
        assert!(filter.keep(&record(&["aci-fabric"])));
        assert!(!filter.keep(&record(&["sdwan-fabric"])));
    }

    #[test]
    fn and_not_combination_narrows_as_in_the_worked_example() {
        // Five D2D tests tagged {[a,b], [a], [c], [], [a,c]}; `a AND NOT c`
        // keeps exactly the two tagged [a,b] and [a].
        let filter = TagFilter::new(&["a AND NOT c".to_string()], &[]);
        assert!(filter.keep(&record(&["a", "b"])));
        assert!(filter.keep(&record(&["a"])));
        assert!(!filter.keep(&record(&["c"])));
        assert!(!filter.keep(&record(&[])));
        assert!(!filter.keep(&record(&["a", "c"])));
    }

    #[test]
    fn exclude_applies_after_include() {
        let filter = TagFilter::new(&["sanity".to_string()], &["slow".to_string()]);
        assert!(filter.keep(&record(&["sanity"])));
        assert!(!filter.keep(&record(&["sanity", "slow"])));
    }

    #[test]
    fn refiltering_is_idempotent() {
        let records = vec![record(&["sanity"]), record(&["regression"])];
        let filter = TagFilter::new(&["sanity".to_string()], &[]);
        let once: Vec<TestFileRecord> = filter.apply(&records).into_iter().cloned().collect();
        let twice: Vec<&TestFileRecord> = filter.apply(&once);
        assert_eq!(once.len(), twice.len());
    }
}
