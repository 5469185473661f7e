//! Data models for the test runner
//!
//! Test definitions, selection, and verdicts shared by the dispatcher,
//! workers and reporters.

mod test_def;
mod verdict;

pub use test_def::{matches, QueuePref, TestDef, TestId, TestRegistry};
pub use verdict::{Outcome, RunCounts, Verdict};
