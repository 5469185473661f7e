//! Configuration module
//!
//! Settings are layered: built-in defaults, then a config file, then
//! `CTS_RUNNER_*` environment variables, then command-line flags.

mod env;
mod file;
mod profile;

pub use env::{print_env_help, EnvBuilder, EnvConfig, EnvGuard};
pub use file::{expand_path, is_yaml_file, read_document, write_document, ConfigFile};
pub use profile::SelectionProfile;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::executor::IsolationMode;

fn default_suite_name() -> String {
    "crucible".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Runner settings shared by the config file and the environment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Concurrent workers; unset picks a default from the isolation mode
    pub jobs: Option<usize>,

    pub isolation: IsolationMode,

    /// Run tests in workers; unset decides from the selected tests
    pub fork: Option<bool>,

    pub junit_xml: Option<PathBuf>,

    /// Prefix result lines with the worker pid
    pub log_pids: bool,

    /// `name` of the JUnit testsuite element
    #[serde(default = "default_suite_name")]
    pub suite_name: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Test manifest to load
    pub manifest: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            jobs: None,
            isolation: IsolationMode::Process,
            fork: None,
            junit_xml: None,
            log_pids: false,
            suite_name: default_suite_name(),
            log_level: default_log_level(),
            manifest: None,
        }
    }
}

impl RunnerConfig {
    /// Apply environment overrides on top of these settings.
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(jobs) = env.jobs {
            self.jobs = Some(jobs);
        }
        if let Some(isolation) = env.isolation {
            self.isolation = isolation;
        }
        if let Some(fork) = env.fork {
            self.fork = Some(fork);
        }
        if let Some(path) = &env.junit_xml {
            self.junit_xml = Some(path.clone());
        }
        if let Some(log_pids) = env.log_pids {
            self.log_pids = log_pids;
        }
        if let Some(level) = &env.log_level {
            self.log_level = level.clone();
        }
        if let Some(path) = &env.manifest {
            self.manifest = Some(path.clone());
        }
    }
}
