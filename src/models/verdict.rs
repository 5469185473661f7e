//! Test verdict models
//!
//! Defines what a worker may report for a test, what the dispatcher records,
//! and the per-run tally.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result a worker produces for one test on one queue.
///
/// Workers cannot report a lost test; only the dispatcher knows that a worker
/// died while holding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Skip,
    Fail,
}

impl Outcome {
    /// Wire encoding used inside result packets
    pub fn to_byte(self) -> u8 {
        match self {
            Outcome::Pass => 0,
            Outcome::Skip => 1,
            Outcome::Fail => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Outcome::Pass),
            1 => Some(Outcome::Skip),
            2 => Some(Outcome::Fail),
            _ => None,
        }
    }
}

/// Verdict recorded by the dispatcher
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Skip,
    Fail,
    Lost,
}

impl Verdict {
    /// Lowercase name, used for console tags and JUnit `status`
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Skip => "skip",
            Verdict::Fail => "fail",
            Verdict::Lost => "lost",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Pass | Verdict::Skip)
    }
}

impl From<Outcome> for Verdict {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Pass => Verdict::Pass,
            Outcome::Skip => Verdict::Skip,
            Outcome::Fail => Verdict::Fail,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running tally of a test run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Test/queue pairs the run intended to execute
    pub planned: u32,
    pub pass: u32,
    pub fail: u32,
    pub skip: u32,
    pub lost: u32,
}

impl RunCounts {
    pub fn new(planned: u32) -> Self {
        Self {
            planned,
            ..Self::default()
        }
    }

    pub fn record(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Pass => self.pass += 1,
            Verdict::Fail => self.fail += 1,
            Verdict::Skip => self.skip += 1,
            Verdict::Lost => self.lost += 1,
        }
    }

    /// Number of results reported so far
    pub fn ran(&self) -> u32 {
        self.pass + self.fail + self.skip + self.lost
    }

    /// A run succeeds iff every planned test passed or was skipped.
    pub fn is_success(&self) -> bool {
        self.pass + self.skip == self.planned
    }

    pub fn pass_rate(&self) -> f64 {
        if self.ran() == 0 {
            0.0
        } else {
            (self.pass as f64 / self.ran() as f64) * 100.0
        }
    }
}

impl fmt::Display for RunCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ran: {} | Pass: {} | Fail: {} | Skip: {} | Lost: {}",
            self.ran(),
            self.pass,
            self.fail,
            self.skip,
            self.lost
        )
    }
}
