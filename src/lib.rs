//! cts-runner: an isolating test runner for GPU conformance suites
//!
//! Tests are selected by glob pattern, handed to forked worker processes
//! (or a single worker thread) over pipes, and reported on the console and
//! optionally as JUnit XML. A worker that dies mid-test costs only that
//! test, which is reported as lost.

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod harness;
pub mod models;
pub mod output;
pub mod utils;

pub use error::{Result, RunnerError};
