//! cts-runner - isolating test runner for GPU conformance suites
//!
//! Loads a test manifest, selects tests by pattern, and runs them in forked
//! worker processes (or a worker thread), reporting each result on stdout and
//! optionally as JUnit XML.
//!
//! ## Usage
//!
//! ```bash
//! # Run every test in the manifest, one worker per CPU
//! cts-runner run -m tests.yaml
//!
//! # Run draw tests on queue 0 only, four at a time
//! cts-runner run -m tests.yaml -j 4 'func.draw.*.q0'
//!
//! # Debug a single test inside the runner process
//! cts-runner run -m tests.yaml func.draw.triangle
//!
//! # List what a selection enables
//! cts-runner list -m tests.yaml '!stress.*'
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use cts_runner::cli::{self, Args, SelectionArgs};
use cts_runner::config::{self, ConfigFile, EnvConfig, SelectionProfile};
use cts_runner::executor::{Dispatcher, RunOptions};
use cts_runner::harness::{Manifest, ManifestHarness};
use cts_runner::models::TestRegistry;
use cts_runner::output::{OutputFormat, ResultFormatter, RunSummary};
use cts_runner::utils::{init_logger, LogLevel, Timer};

fn main() -> Result<()> {
    let args = Args::parse();

    let env = EnvConfig::load();
    let config_path = match &args.command {
        cli::Command::Run(run) => run.selection.config.clone(),
        cli::Command::List(list) => list.selection.config.clone(),
        cli::Command::Config(_) => None,
    }
    .or_else(|| env.config_file.clone());

    // `config` subcommands load the file themselves so they can report on it
    let mut file = match (&args.command, &config_path) {
        (cli::Command::Config(_), _) => ConfigFile::default(),
        (_, Some(path)) => ConfigFile::load(path)?,
        (_, None) => ConfigFile::load_default()?,
    };
    file.runner.apply_env(&env);

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        args.log_level
            .as_deref()
            .unwrap_or(file.runner.log_level.as_str())
            .parse()
            .map_err(anyhow::Error::msg)?
    };
    init_logger(level);

    if let Some(path) = &config_path {
        debug!("Using configuration {}", path.display());
    }

    match args.command {
        cli::Command::Run(run_args) => {
            let success = run_tests(run_args, &file)?;
            std::process::exit(if success { 0 } else { 1 });
        }
        cli::Command::List(list_args) => list_tests(list_args, &file)?,
        cli::Command::Config(config_args) => manage_config(config_args, config_path.as_deref())?,
    }

    Ok(())
}

/// Manifest and registry with the selection applied
struct Selected {
    manifest: Manifest,
    registry: TestRegistry,
    patterns: Vec<String>,
    profile: Option<SelectionProfile>,
}

fn select(selection: &SelectionArgs, file: &ConfigFile) -> Result<Selected> {
    let path = selection
        .manifest
        .clone()
        .or_else(|| file.runner.manifest.clone())
        .context("No test manifest given. Use --manifest or set runner.manifest")?;
    let manifest = Manifest::load(config::expand_path(&path.to_string_lossy()))?;

    let profile = match &selection.profile {
        Some(name) => Some(
            file.profile(name)
                .with_context(|| format!("Unknown profile: {name}"))?,
        ),
        None => None,
    };

    let mut patterns: Vec<String> = profile
        .as_ref()
        .map(|p| p.patterns.clone())
        .unwrap_or_default();
    patterns.extend(selection.patterns.iter().cloned());

    let mut registry = manifest.registry();
    let enabled = registry.enable_matching(&patterns)?;
    info!("{} of {} tests enabled", enabled, registry.len());

    Ok(Selected {
        manifest,
        registry,
        patterns,
        profile,
    })
}

fn output_format(name: &str) -> Result<OutputFormat> {
    OutputFormat::from_str(name).with_context(|| format!("Unknown output format: {name}"))
}

fn formatter(format: OutputFormat) -> ResultFormatter {
    let formatter = ResultFormatter::new(format);
    if std::io::stdout().is_terminal() {
        formatter
    } else {
        formatter.no_color()
    }
}

fn run_tests(args: cli::RunArgs, file: &ConfigFile) -> Result<bool> {
    let format = output_format(&args.selection.format)?;
    let selected = select(&args.selection, file)?;
    let runner = &file.runner;

    let jobs = args
        .jobs
        .or(selected.profile.as_ref().and_then(|p| p.jobs))
        .or(runner.jobs);
    let isolation = args.isolation.unwrap_or(runner.isolation);
    let fork = args.fork_override().or(runner.fork);

    let mut options = RunOptions::resolve(&selected.patterns, isolation, fork, jobs)?
        .with_log_pids(args.log_pids || runner.log_pids)
        .with_suite_name(runner.suite_name.as_str());
    if let Some(path) = args.junit_xml.or_else(|| runner.junit_xml.clone()) {
        options = options.with_junit_xml(path);
    }

    info!(
        "Running with {} isolation, fork={}, jobs={}",
        options.isolation, options.fork, options.jobs
    );

    let harness = Arc::new(ManifestHarness::new(&selected.manifest));
    let timer = Timer::start();
    let mut dispatcher = Dispatcher::new(Arc::new(selected.registry), harness, options)?;
    let success = dispatcher.run()?;

    if format != OutputFormat::Table {
        let summary = RunSummary::new(dispatcher.counts().clone(), timer.elapsed_ms());
        println!("{}", formatter(format).format_summary(&summary));
    }

    Ok(success)
}

fn list_tests(args: cli::ListArgs, file: &ConfigFile) -> Result<()> {
    let format = output_format(&args.selection.format)?;
    let selected = select(&args.selection, file)?;

    print!("{}", formatter(format).format_listing(&selected.registry));
    if format != OutputFormat::Table {
        println!();
    }
    Ok(())
}

fn manage_config(args: cli::ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    match args.action {
        cli::ConfigAction::Init { output, force } => {
            let path = Path::new(&output);
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {output}. Use --force to overwrite."
                );
            }

            ConfigFile::example().save(path)?;
            println!("Configuration file created: {output}");
        }

        cli::ConfigAction::Show { env, format } => {
            if env {
                config::print_env_help();
                let current = EnvConfig::load();
                if current.has_any() {
                    println!();
                    println!("Currently set: {current:?}");
                }
            } else {
                let mut file = match config_path {
                    Some(path) => ConfigFile::load(path)?,
                    None => ConfigFile::load_default()?,
                };
                file.runner.apply_env(&EnvConfig::load());
                let output = if format == "json" {
                    serde_json::to_string_pretty(&file)?
                } else {
                    serde_yaml::to_string(&file)?
                };
                println!("{output}");
            }
        }

        cli::ConfigAction::Validate { file } => {
            let path = file
                .map(PathBuf::from)
                .or_else(|| config_path.map(Path::to_path_buf))
                .or_else(ConfigFile::find)
                .unwrap_or_else(|| PathBuf::from("./cts-runner.yaml"));

            match ConfigFile::load(&path) {
                Ok(_) => println!("Configuration file is valid: {}", path.display()),
                Err(e) => {
                    println!("Configuration file is invalid: {}", path.display());
                    println!("  Error: {e:#}");
                    return Err(e);
                }
            }
        }

        cli::ConfigAction::Profiles => {
            let file = match config_path {
                Some(path) => ConfigFile::load(path)?,
                None => ConfigFile::load_default()?,
            };

            println!("Selection Profiles:");
            println!("{:-<60}", "");
            let builtin = SelectionProfile::predefined();
            for profile in file.profiles.iter().chain(builtin.iter()) {
                println!("  {:20} {}", profile.name, profile.patterns.join(" "));
                if !profile.description.is_empty() {
                    println!("  {:20} {}", "", profile.description);
                }
            }
        }
    }

    Ok(())
}
