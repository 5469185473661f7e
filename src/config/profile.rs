//! Selection profiles
//!
//! A profile is a named list of test patterns, so common selections can be
//! run with `--profile <name>` instead of spelling out globs.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::models::{matches, TestDef};

/// Named set of selection patterns
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionProfile {
    /// Profile name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Patterns, applied in order
    pub patterns: Vec<String>,
    /// Job count override
    #[serde(default)]
    pub jobs: Option<usize>,
}

impl SelectionProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            patterns: Vec::new(),
            jobs: None,
        }
    }

    /// Every registered test
    pub fn all() -> Self {
        Self::new("all")
            .with_description("Every registered test on every queue")
            .with_patterns(["*"])
    }

    /// Every test on queue 0 only
    pub fn first_queue() -> Self {
        Self::new("first-queue")
            .with_description("Every test on queue 0 only")
            .with_patterns(["*.q0"])
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Check that every pattern compiles
    pub fn validate(&self) -> Result<()> {
        let probe = TestDef::new("");
        for pattern in &self.patterns {
            matches(&probe, pattern)?;
        }
        Ok(())
    }

    /// Built-in profiles
    pub fn predefined() -> Vec<SelectionProfile> {
        vec![Self::all(), Self::first_queue()]
    }

    pub fn find(name: &str) -> Option<SelectionProfile> {
        Self::predefined().into_iter().find(|p| p.name == name)
    }
}
