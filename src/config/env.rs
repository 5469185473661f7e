//! `CTS_RUNNER_*` environment overrides
//!
//! Every variable is listed once in [`VARIABLES`]; loading and the help text
//! both read from that table.

use std::env;
use std::path::PathBuf;
use tracing::warn;

use crate::executor::IsolationMode;

const ENV_PREFIX: &str = "CTS_RUNNER";

/// Suffix and help text of each recognised variable
const VARIABLES: &[(&str, &str)] = &[
    ("JOBS", "Number of concurrent workers"),
    ("ISOLATION", "Isolation mode (process, thread)"),
    ("FORK", "Run tests in workers (true/false)"),
    ("JUNIT_XML", "Path of the JUnit XML report"),
    ("LOG_PIDS", "Prefix result lines with worker pids (true/false)"),
    ("LOG", "Log level (trace, debug, info, warn, error)"),
    ("CONFIG", "Path to configuration file"),
    ("MANIFEST", "Path to the test manifest"),
];

fn key(suffix: &str) -> String {
    format!("{ENV_PREFIX}_{suffix}")
}

fn lookup(suffix: &str) -> Option<String> {
    env::var(key(suffix)).ok().filter(|v| !v.is_empty())
}

/// Look up a variable and parse it; malformed values are ignored with a
/// warning.
fn parsed<T>(suffix: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let raw = lookup(suffix)?;
    let value = parse(&raw);
    if value.is_none() {
        warn!("Ignoring {}={:?}", key(suffix), raw);
    }
    value
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_isolation(value: &str) -> Option<IsolationMode> {
    match value.to_ascii_lowercase().as_str() {
        "process" => Some(IsolationMode::Process),
        "thread" => Some(IsolationMode::Thread),
        _ => None,
    }
}

/// Settings found in the environment; `None` means "not set".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub jobs: Option<usize>,
    pub isolation: Option<IsolationMode>,
    pub fork: Option<bool>,
    pub junit_xml: Option<PathBuf>,
    pub log_pids: Option<bool>,
    pub log_level: Option<String>,
    pub config_file: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
}

impl EnvConfig {
    pub fn load() -> Self {
        Self {
            jobs: parsed("JOBS", |v| v.parse().ok()),
            isolation: parsed("ISOLATION", parse_isolation),
            fork: parsed("FORK", parse_flag),
            junit_xml: lookup("JUNIT_XML").map(PathBuf::from),
            log_pids: parsed("LOG_PIDS", parse_flag),
            log_level: lookup("LOG"),
            config_file: lookup("CONFIG").map(PathBuf::from),
            manifest: lookup("MANIFEST").map(PathBuf::from),
        }
    }

    pub fn has_any(&self) -> bool {
        *self != Self::default()
    }
}

/// Sets `CTS_RUNNER_*` variables, mainly for tests.
#[derive(Debug, Default)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(mut self, suffix: &str, value: impl ToString) -> Self {
        self.vars.push((key(suffix), value.to_string()));
        self
    }

    pub fn jobs(self, jobs: usize) -> Self {
        self.set("JOBS", jobs)
    }

    pub fn isolation(self, isolation: IsolationMode) -> Self {
        self.set("ISOLATION", isolation)
    }

    pub fn fork(self, fork: bool) -> Self {
        self.set("FORK", fork)
    }

    pub fn junit_xml(self, path: &str) -> Self {
        self.set("JUNIT_XML", path)
    }

    /// Set the variables until the returned guard is dropped.
    pub fn apply_scoped(self) -> EnvGuard {
        let saved = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();
        for (k, v) in &self.vars {
            env::set_var(k, v);
        }
        EnvGuard { saved }
    }
}

/// Puts variables back the way [`EnvBuilder::apply_scoped`] found them.
#[derive(Debug)]
pub struct EnvGuard {
    saved: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (k, old) in self.saved.drain(..).rev() {
            match old {
                Some(v) => env::set_var(&k, v),
                None => env::remove_var(&k),
            }
        }
    }
}

pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    for (suffix, help) in VARIABLES {
        println!("  {:<22} {}", key(suffix), help);
    }
}
