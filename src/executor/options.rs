//! Resolved run options

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::thread;

use crate::error::{Result, RunnerError};

/// Upper bound on concurrently running workers
pub const MAX_JOBS: usize = 64;

/// How tests are isolated from the dispatcher
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// One forked process per test
    #[default]
    Process,
    /// A single worker thread running tests in order
    Thread,
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationMode::Process => write!(f, "process"),
            IsolationMode::Thread => write!(f, "thread"),
        }
    }
}

/// Options for one dispatcher run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOptions {
    pub jobs: usize,
    pub isolation: IsolationMode,
    /// Run tests in workers. When false, tests run inline in the dispatcher.
    pub fork: bool,
    pub junit_xml: Option<PathBuf>,
    pub log_pids: bool,
    pub suite_name: String,
    /// Prefix of every console line
    pub program: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            isolation: IsolationMode::Process,
            fork: true,
            junit_xml: None,
            log_pids: false,
            suite_name: "crucible".to_string(),
            program: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// A single plain test name means someone is debugging that test.
pub fn is_one_test<S: AsRef<str>>(patterns: &[S]) -> bool {
    match patterns {
        [only] => {
            let p = only.as_ref();
            !p.starts_with('!') && !p.contains('*')
        }
        _ => false,
    }
}

impl RunOptions {
    /// Derive fork mode and job count from what the user asked for.
    ///
    /// An explicit fork choice wins. Otherwise a single plain test name runs
    /// inline. Without an explicit job count, process isolation uses one job
    /// per online CPU and everything else uses one.
    pub fn resolve<S: AsRef<str>>(
        patterns: &[S],
        isolation: IsolationMode,
        fork: Option<bool>,
        jobs: Option<usize>,
    ) -> Result<Self> {
        let one_test = is_one_test(patterns);
        let fork = fork.unwrap_or(!one_test);

        let jobs = match jobs {
            Some(j) => j,
            None if one_test || !fork => 1,
            None => match isolation {
                IsolationMode::Process => thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
                IsolationMode::Thread => 1,
            },
        };

        let options = Self {
            jobs,
            isolation,
            fork,
            ..Self::default()
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.fork && self.isolation == IsolationMode::Thread {
            return Err(RunnerError::InvalidOptions(
                "thread isolation requires forking to be enabled".into(),
            ));
        }
        if self.jobs > 1 && self.isolation == IsolationMode::Thread {
            return Err(RunnerError::InvalidOptions(
                "thread isolation supports only one job".into(),
            ));
        }
        if self.jobs > 1 && !self.fork {
            return Err(RunnerError::InvalidOptions(
                "multiple jobs require forking to be enabled".into(),
            ));
        }
        Ok(())
    }

    /// Workers allowed at once
    pub fn max_concurrent(&self) -> usize {
        self.jobs.clamp(1, MAX_JOBS)
    }

    pub fn with_junit_xml(mut self, path: impl Into<PathBuf>) -> Self {
        self.junit_xml = Some(path.into());
        self
    }

    pub fn with_log_pids(mut self, enable: bool) -> Self {
        self.log_pids = enable;
        self
    }

    pub fn with_suite_name(mut self, name: impl Into<String>) -> Self {
        self.suite_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_test_detection() {
        assert!(is_one_test(&["func.draw"]));
        assert!(!is_one_test(&["func.*"]));
        assert!(!is_one_test(&["!func.draw"]));
        assert!(!is_one_test(&["a", "b"]));
        assert!(!is_one_test::<&str>(&[]));
    }

    #[test]
    fn test_one_test_runs_inline() {
        let opts = RunOptions::resolve(&["func.draw"], IsolationMode::Process, None, None).unwrap();
        assert!(!opts.fork);
        assert_eq!(opts.jobs, 1);
    }

    #[test]
    fn test_explicit_fork_wins() {
        let opts =
            RunOptions::resolve(&["func.draw"], IsolationMode::Process, Some(true), None).unwrap();
        assert!(opts.fork);
        assert_eq!(opts.jobs, 1);
    }

    #[test]
    fn test_default_jobs_per_isolation() {
        let opts = RunOptions::resolve::<&str>(&[], IsolationMode::Process, None, None).unwrap();
        assert!(opts.fork);
        assert!(opts.jobs >= 1);

        let opts = RunOptions::resolve::<&str>(&[], IsolationMode::Thread, None, None).unwrap();
        assert_eq!(opts.jobs, 1);
    }

    #[test]
    fn test_invalid_combinations() {
        assert!(RunOptions::resolve::<&str>(&[], IsolationMode::Thread, Some(false), None).is_err());
        assert!(RunOptions::resolve::<&str>(&[], IsolationMode::Thread, None, Some(2)).is_err());
        assert!(RunOptions::resolve::<&str>(&[], IsolationMode::Process, Some(false), Some(4)).is_err());
    }

    #[test]
    fn test_max_concurrent_is_clamped() {
        let opts = RunOptions {
            jobs: 500,
            ..RunOptions::default()
        };
        assert_eq!(opts.max_concurrent(), MAX_JOBS);

        let opts = RunOptions {
            jobs: 0,
            ..RunOptions::default()
        };
        assert_eq!(opts.max_concurrent(), 1);
    }
}
