//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::executor::IsolationMode;

/// Isolating test runner for GPU conformance suites
#[derive(Parser, Debug)]
#[command(name = "cts-runner")]
#[command(version)]
#[command(about = "Run conformance tests in isolated workers")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output (same as --log-level debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the selected tests
    Run(RunArgs),

    /// List the tests a selection enables
    List(ListArgs),

    /// Manage the configuration file
    Config(ConfigArgs),
}

/// Options shared by every command that selects tests
#[derive(ClapArgs, Debug, Default)]
pub struct SelectionArgs {
    /// Test name patterns; `!` negates and a `.qN` suffix pins the queue
    pub patterns: Vec<String>,

    /// Test manifest (YAML or JSON)
    #[arg(short, long)]
    pub manifest: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Named selection profile, applied before the patterns
    #[arg(short, long)]
    pub profile: Option<String>,

    /// Output format (table, json, json-pretty, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Number of concurrent worker processes
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// How tests are isolated from the dispatcher
    #[arg(short = 'I', long, value_enum)]
    pub isolation: Option<IsolationMode>,

    /// Run tests in workers even when a single test is selected
    #[arg(long, conflicts_with = "no_fork")]
    pub fork: bool,

    /// Run tests inside the dispatcher process
    #[arg(long)]
    pub no_fork: bool,

    /// Write a JUnit XML report to this path
    #[arg(long)]
    pub junit_xml: Option<PathBuf>,

    /// Prefix each result line with the worker pid
    #[arg(long)]
    pub log_pids: bool,
}

impl RunArgs {
    /// Fork setting from the command line, if one was given
    pub fn fork_override(&self) -> Option<bool> {
        match (self.fork, self.no_fork) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

/// Arguments for list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write an example configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "./cts-runner.yaml")]
        output: String,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Show {
        /// Show environment variables instead
        #[arg(short, long)]
        env: bool,

        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Validate a configuration file
    Validate {
        /// File to validate; defaults to the first one found
        file: Option<String>,
    },

    /// List selection profiles
    Profiles,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parsing() {
        let args = Args::parse_from([
            "cts-runner",
            "run",
            "-j",
            "4",
            "--junit-xml",
            "out.xml",
            "func.*",
            "!func.draw.q1",
        ]);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.jobs, Some(4));
                assert_eq!(run.junit_xml, Some(PathBuf::from("out.xml")));
                assert_eq!(run.selection.patterns, vec!["func.*", "!func.draw.q1"]);
                assert_eq!(run.fork_override(), None);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_isolation_and_fork_flags() {
        let args = Args::parse_from(["cts-runner", "run", "-I", "thread", "--fork"]);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.isolation, Some(IsolationMode::Thread));
                assert_eq!(run.fork_override(), Some(true));
            }
            _ => panic!("Expected Run command"),
        }

        let args = Args::parse_from(["cts-runner", "run", "--no-fork"]);
        match args.command {
            Command::Run(run) => assert_eq!(run.fork_override(), Some(false)),
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_fork_flags_conflict() {
        let result = Args::try_parse_from(["cts-runner", "run", "--fork", "--no-fork"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_list_args() {
        let args = Args::parse_from(["cts-runner", "list", "-m", "tests.yaml", "-f", "json"]);
        match args.command {
            Command::List(list) => {
                assert_eq!(list.selection.manifest, Some(PathBuf::from("tests.yaml")));
                assert_eq!(list.selection.format, "json");
            }
            _ => panic!("Expected List command"),
        }
    }
}
