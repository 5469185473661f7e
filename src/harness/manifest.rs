//! Manifest-driven harness
//!
//! Each test is an external command. The queue index is passed to the
//! command through the environment and the exit status is the verdict,
//! following the automake convention: 0 passes, 77 skips, anything else
//! fails.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

use super::TestHarness;
use crate::config::read_document;
use crate::models::{Outcome, TestDef, TestRegistry};

/// Environment variable carrying the queue index to a test command
pub const QUEUE_ENV: &str = "CTS_QUEUE_INDEX";

/// Exit status a test command uses to report a skip
pub const SKIP_EXIT_CODE: i32 = 77;

fn default_queues() -> u32 {
    1
}

/// Test manifest file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    /// Number of queues exposed to tests
    #[serde(default = "default_queues")]
    pub queues: u32,

    pub tests: Vec<ManifestTest>,
}

/// One entry of a manifest
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestTest {
    pub name: String,

    /// Program and arguments
    pub command: Vec<String>,

    #[serde(default)]
    pub skip: bool,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let manifest: Self = read_document(path.as_ref(), "manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for test in &self.tests {
            if test.name.is_empty() || test.name.contains('/') {
                anyhow::bail!("Invalid test name '{}'", test.name);
            }
            if test.command.is_empty() {
                anyhow::bail!("Test '{}' has an empty command", test.name);
            }
            if !seen.insert(test.name.as_str()) {
                anyhow::bail!("Duplicate test name '{}'", test.name);
            }
        }

        Ok(())
    }

    /// Build the registry in manifest order
    pub fn registry(&self) -> TestRegistry {
        self.tests
            .iter()
            .map(|t| {
                let def = TestDef::new(&t.name);
                if t.skip {
                    def.skipped()
                } else {
                    def
                }
            })
            .collect()
    }
}

/// Harness that runs manifest commands
#[derive(Clone, Debug)]
pub struct ManifestHarness {
    queues: u32,
    commands: HashMap<String, Vec<String>>,
}

impl ManifestHarness {
    pub fn new(manifest: &Manifest) -> Self {
        Self {
            queues: manifest.queues,
            commands: manifest
                .tests
                .iter()
                .map(|t| (t.name.clone(), t.command.clone()))
                .collect(),
        }
    }
}

impl TestHarness for ManifestHarness {
    fn execute(&self, def: &TestDef, queue: u32) -> Outcome {
        let Some((program, args)) = self.commands.get(&def.name).and_then(|c| c.split_first())
        else {
            warn!("No command registered for {}", def.name);
            return Outcome::Fail;
        };

        debug!("Executing {} on queue {}", def.name, queue);

        let status = Command::new(program)
            .args(args)
            .env(QUEUE_ENV, queue.to_string())
            .stdin(Stdio::null())
            .status();

        match status {
            Ok(status) => match status.code() {
                Some(0) => Outcome::Pass,
                Some(SKIP_EXIT_CODE) => Outcome::Skip,
                _ => Outcome::Fail,
            },
            Err(e) => {
                warn!("Failed to spawn {} for {}: {}", program, def.name, e);
                Outcome::Fail
            }
        }
    }

    fn queue_count(&self) -> Result<u32> {
        Ok(self.queues)
    }
}
