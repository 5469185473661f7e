//! Test definitions and name-based selection
//!
//! The registry owns every test definition. Selection patterns decide which
//! definitions are enabled for a run and which queue each one targets.

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use crate::error::{Result, RunnerError};

/// Stable index of a definition inside its registry
pub type TestId = u32;

/// Which queues an enabled test runs on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuePref {
    /// Every queue the device exposes
    #[default]
    Any,
    /// Exactly one queue, selected with a `.qN` pattern suffix
    Fixed(u32),
}

/// A single test definition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDef {
    pub name: String,

    /// Work-in-progress tests are reported as skipped without running
    #[serde(default)]
    pub skip: bool,

    #[serde(skip)]
    enabled: bool,

    #[serde(skip)]
    queue_pref: QueuePref,
}

impl TestDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skip: false,
            enabled: false,
            queue_pref: QueuePref::Any,
        }
    }

    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn queue_pref(&self) -> QueuePref {
        self.queue_pref
    }

    /// Queue indices this test is dispatched on. A fixed preference may lie
    /// outside the device's queue count; the dispatcher reports that as a skip.
    pub fn queues(&self, num_queues: u32) -> Range<u32> {
        match self.queue_pref {
            QueuePref::Any => 0..num_queues,
            QueuePref::Fixed(q) => q..q + 1,
        }
    }

    /// Name used in reports, e.g. `func.draw.q0`
    pub fn qualified_name(&self, queue: u32) -> String {
        format!("{}.q{}", self.name, queue)
    }
}

impl fmt::Display for TestDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Does `pattern` select `def`? Leading `!` characters are ignored here;
/// negation is handled by [`TestRegistry::enable_matching`].
pub fn matches(def: &TestDef, pattern: &str) -> Result<bool> {
    let matcher = compile(pattern.trim_start_matches('!'))?;
    Ok(matcher.is_match(&def.name))
}

fn compile(glob: &str) -> Result<GlobMatcher> {
    Glob::new(glob)
        .map(|g| g.compile_matcher())
        .map_err(|source| RunnerError::InvalidPattern {
            pattern: glob.to_string(),
            source,
        })
}

/// Queue suffix carried by a pattern
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueSelector {
    Any,
    Fixed(u32),
    /// `.qN` with an N that is not a usable queue index
    Invalid,
}

/// A parsed selection pattern such as `!func.*.q1`
#[derive(Debug)]
struct Selection {
    matcher: GlobMatcher,
    negative: bool,
    queue: QueueSelector,
}

impl Selection {
    fn parse(pattern: &str) -> Result<Self> {
        let (body, queue) = split_queue_suffix(pattern);
        Ok(Self {
            matcher: compile(body.trim_start_matches('!'))?,
            negative: is_negative(body),
            queue,
        })
    }
}

/// An odd number of leading `!` negates a pattern.
fn is_negative(pattern: &str) -> bool {
    let bangs = pattern.len() - pattern.trim_start_matches('!').len();
    bangs % 2 == 1
}

fn split_queue_suffix(pattern: &str) -> (&str, QueueSelector) {
    let Some(pos) = pattern.rfind(".q") else {
        return (pattern, QueueSelector::Any);
    };

    let digits = &pattern[pos + 2..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return (pattern, QueueSelector::Any);
    }

    let queue = match digits.parse::<u32>() {
        Ok(q) if q < u32::MAX => QueueSelector::Fixed(q),
        _ => QueueSelector::Invalid,
    };

    (&pattern[..pos], queue)
}

/// Ordered collection of test definitions
#[derive(Clone, Debug, Default)]
pub struct TestRegistry {
    defs: Vec<TestDef>,
}

impl TestRegistry {
    pub fn new(defs: Vec<TestDef>) -> Self {
        Self { defs }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn get(&self, id: TestId) -> Option<&TestDef> {
        self.defs.get(id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TestId, &TestDef)> {
        self.defs.iter().enumerate().map(|(i, d)| (i as TestId, d))
    }

    pub fn enabled(&self) -> impl Iterator<Item = (TestId, &TestDef)> {
        self.iter().filter(|(_, d)| d.enabled)
    }

    pub fn enabled_count(&self) -> u32 {
        self.defs.iter().filter(|d| d.enabled).count() as u32
    }

    /// Number of test/queue pairs an enabled run will report
    pub fn planned(&self, num_queues: u32) -> u32 {
        self.enabled().map(|(_, d)| d.queues(num_queues).len() as u32).sum()
    }

    /// Enable tests by name pattern and return the number enabled.
    ///
    /// The last matching pattern wins. When no pattern is given, or the first
    /// one is negative, an implicit `*` comes first.
    pub fn enable_matching<S: AsRef<str>>(&mut self, patterns: &[S]) -> Result<u32> {
        let selections = patterns
            .iter()
            .map(|p| Selection::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let implicit_all = patterns.first().map_or(true, |p| is_negative(p.as_ref()));

        let mut count = 0;
        for def in &mut self.defs {
            def.queue_pref = QueuePref::Any;
            let mut enable = implicit_all;

            for sel in &selections {
                if !sel.matcher.is_match(&def.name) {
                    continue;
                }
                enable = sel.queue != QueueSelector::Invalid && !sel.negative;
                def.queue_pref = match sel.queue {
                    QueueSelector::Fixed(q) => QueuePref::Fixed(q),
                    QueueSelector::Any | QueueSelector::Invalid => QueuePref::Any,
                };
            }

            def.enabled = enable;
            if enable {
                count += 1;
            }
        }

        Ok(count)
    }
}

impl FromIterator<TestDef> for TestRegistry {
    fn from_iter<I: IntoIterator<Item = TestDef>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(names: &[&str]) -> TestRegistry {
        names.iter().map(|n| TestDef::new(*n)).collect()
    }

    fn enabled_names(reg: &TestRegistry) -> Vec<&str> {
        reg.enabled().map(|(_, d)| d.name.as_str()).collect()
    }

    #[test]
    fn test_no_patterns_enables_everything() {
        let mut reg = registry(&["a.one", "b.two"]);
        assert_eq!(reg.enable_matching::<&str>(&[]).unwrap(), 2);
    }

    #[test]
    fn test_negative_after_positive() {
        let mut reg = registry(&["foo.bar", "foo.baz", "foo.qux", "other"]);
        let n = reg.enable_matching(&["foo.*", "!foo.bar"]).unwrap();
        assert_eq!(n, 2);
        assert_eq!(enabled_names(&reg), vec!["foo.baz", "foo.qux"]);
    }

    #[test]
    fn test_leading_negative_implies_all() {
        let mut reg = registry(&["foo.bar", "foo.baz", "other"]);
        reg.enable_matching(&["!foo.bar"]).unwrap();
        assert_eq!(enabled_names(&reg), vec!["foo.baz", "other"]);
    }

    #[test]
    fn test_last_match_wins() {
        let mut reg = registry(&["foo.bar", "foo.baz"]);
        reg.enable_matching(&["!foo.*", "foo.bar"]).unwrap();
        assert_eq!(enabled_names(&reg), vec!["foo.bar"]);
    }

    #[test]
    fn test_double_bang_is_positive() {
        assert!(is_negative("!a"));
        assert!(!is_negative("!!a"));
        assert!(is_negative("!!!a"));
    }

    #[test]
    fn test_queue_suffix_sets_preference() {
        let mut reg = registry(&["func.draw", "func.clear"]);
        reg.enable_matching(&["func.draw.q1"]).unwrap();

        let def = reg.get(0).unwrap();
        assert!(def.is_enabled());
        assert_eq!(def.queue_pref(), QueuePref::Fixed(1));
        assert_eq!(def.queues(4), 1..2);
        assert!(!reg.get(1).unwrap().is_enabled());
    }

    #[test]
    fn test_oversized_queue_suffix_disables() {
        let mut reg = registry(&["func.draw"]);
        let n = reg.enable_matching(&["func.draw.q99999999999"]).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_split_queue_suffix() {
        assert_eq!(split_queue_suffix("a.q3"), ("a", QueueSelector::Fixed(3)));
        assert_eq!(split_queue_suffix("a.quick"), ("a.quick", QueueSelector::Any));
        assert_eq!(split_queue_suffix("a.q"), ("a.q", QueueSelector::Any));
    }

    #[test]
    fn test_matches_ignores_bang() {
        let def = TestDef::new("foo.bar");
        assert!(matches(&def, "foo.*").unwrap());
        assert!(matches(&def, "!foo.bar").unwrap());
        assert!(!matches(&def, "baz").unwrap());
    }

    #[test]
    fn test_invalid_pattern() {
        let mut reg = registry(&["a"]);
        assert!(reg.enable_matching(&["a[".to_string()]).is_err());
    }

    #[test]
    fn test_planned_counts_queues() {
        let mut reg = registry(&["a", "b"]);
        reg.enable_matching(&["a", "b.q0"]).unwrap();
        assert_eq!(reg.planned(3), 4);
        assert_eq!(reg.get(0).unwrap().qualified_name(2), "a.q2");
    }
}
