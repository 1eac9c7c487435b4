//! CLI configuration management.

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration. Command-line flags override these values.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CliConfig {
    /// Default HTTP registry.
    #[serde(default)]
    pub registry_url: Option<String>,
    /// Default directory registry, used when no URL is set.
    #[serde(default)]
    pub registry_dir: Option<PathBuf>,
    /// JSON file backing the `file` secret provider.
    #[serde(default)]
    pub secrets_file: Option<PathBuf>,
    /// Prefix for the `env` secret provider.
    #[serde(default)]
    pub env_prefix: Option<String>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Step timeout when a step sets none.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    /// Output format.
    #[serde(default)]
    pub output_format: OutputFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl CliConfig {
    /// Load configuration from the platform config file.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Save configuration to the platform config file.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Get the configuration file path.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "tollgate", "tollgate")
            .context("could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value. An empty value clears optional keys.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let opt = |v: &str| (!v.is_empty()).then(|| v.to_string());
        match key {
            "registry_url" => self.registry_url = opt(value),
            "registry_dir" => self.registry_dir = opt(value).map(PathBuf::from),
            "secrets_file" => self.secrets_file = opt(value).map(PathBuf::from),
            "env_prefix" => self.env_prefix = opt(value),
            "max_parallel" => {
                self.max_parallel = match opt(value) {
                    Some(v) => Some(
                        v.parse()
                            .with_context(|| format!("invalid max_parallel: {}", v))?,
                    ),
                    None => None,
                }
            }
            "step_timeout_secs" => {
                self.step_timeout_secs = match opt(value) {
                    Some(v) => Some(
                        v.parse()
                            .with_context(|| format!("invalid step_timeout_secs: {}", v))?,
                    ),
                    None => None,
                }
            }
            "output_format" => {
                self.output_format = match value {
                    "text" => OutputFormat::Text,
                    "json" => OutputFormat::Json,
                    _ => bail!("Invalid output format: {}", value),
                };
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }
}
