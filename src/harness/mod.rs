//! Test harness collaborators
//!
//! The dispatcher does not know how a test runs. It asks a [`TestHarness`]
//! to execute one definition on one queue and to report how many queues the
//! device exposes.

mod manifest;

pub use manifest::{Manifest, ManifestHarness, ManifestTest};

use anyhow::Result;

use crate::models::{Outcome, TestDef};

/// Executes test bodies on behalf of a worker.
///
/// Implementations must be shareable with a worker thread. `execute` is
/// synchronous and may take arbitrarily long; a crash inside it takes the
/// worker down and the dispatcher reports the test as lost.
pub trait TestHarness: Send + Sync {
    /// Run `def` against queue index `queue`.
    fn execute(&self, def: &TestDef, queue: u32) -> Outcome;

    /// Number of hardware queues available to tests.
    fn queue_count(&self) -> Result<u32>;
}
