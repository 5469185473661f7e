//! Config file discovery and the YAML/JSON document helpers
//!
//! The format is picked from the extension: `.yaml`/`.yml` are YAML,
//! anything else is JSON. The manifest loader uses the same helpers.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::profile::SelectionProfile;
use super::RunnerConfig;

/// Searched in order; the first existing file wins.
const CONFIG_LOCATIONS: &[&str] = &[
    "./cts-runner.yaml",
    "./cts-runner.yml",
    "./.cts-runner.yaml",
    "~/.config/cts-runner/config.yaml",
];

const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub runner: RunnerConfig,

    /// Named test selections, looked up before the built-in ones
    #[serde(default)]
    pub profiles: Vec<SelectionProfile>,
}

fn default_version() -> String {
    SUPPORTED_VERSIONS[0].to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            runner: RunnerConfig::default(),
            profiles: Vec::new(),
        }
    }
}

impl ConfigFile {
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(location))
            .find(|path| path.exists())
    }

    /// Load the first config found, or the defaults when there is none.
    pub fn load_default() -> Result<Self> {
        match Self::find() {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_document(path.as_ref(), "config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_document(path.as_ref(), self)
    }

    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            anyhow::bail!("Unsupported config version: {}", self.version);
        }
        if self.runner.jobs == Some(0) {
            anyhow::bail!("runner.jobs must be at least 1");
        }
        for profile in &self.profiles {
            profile
                .validate()
                .with_context(|| format!("Invalid profile '{}'", profile.name))?;
        }
        Ok(())
    }

    /// Look up a profile, falling back to the built-in ones
    pub fn profile(&self, name: &str) -> Option<SelectionProfile> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .or_else(|| SelectionProfile::find(name))
    }

    /// Starting point written by `config init`
    pub fn example() -> Self {
        Self {
            version: default_version(),
            runner: RunnerConfig {
                jobs: Some(4),
                junit_xml: Some(PathBuf::from("results.xml")),
                ..RunnerConfig::default()
            },
            profiles: vec![
                SelectionProfile::new("draw")
                    .with_description("Draw tests on the first queue")
                    .with_patterns(["func.draw.*.q0"]),
                SelectionProfile::new("no-stress").with_patterns(["!stress.*"]),
            ],
        }
    }
}

/// Parse a YAML or JSON document. `what` names the document in errors.
pub fn read_document<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {what} file: {}", path.display()))?;

    if is_yaml_file(path) {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML {what}: {}", path.display()))
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON {what}: {}", path.display()))
    }
}

/// Serialize `value` to `path`, creating parent directories.
pub fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = if is_yaml_file(path) {
        serde_yaml::to_string(value).context("Failed to serialize YAML")?
    } else {
        serde_json::to_string_pretty(value).context("Failed to serialize JSON")?
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

pub fn is_yaml_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}
