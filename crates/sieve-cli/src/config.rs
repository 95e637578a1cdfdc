//! CLI configuration management.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sieve_runner::RunnerConfig;
use sieve_scheduler::{ArbiterConfig, SchedulerConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "SIEVE_CONFIG";

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Jobs allowed to run at the same time.
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,
    /// Seconds a superseded run gets to stop before it is forced to Cancelled.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Step timeout when neither the step nor its job sets one.
    #[serde(default)]
    pub step_timeout_minutes: Option<u32>,
    /// Output lines kept per step.
    #[serde(default = "default_output_tail_lines")]
    pub output_tail_lines: usize,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub output_format: OutputFormat,
}

fn default_max_parallel_jobs() -> usize {
    4
}

fn default_grace_period_secs() -> u64 {
    10
}

fn default_output_tail_lines() -> usize {
    200
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: default_max_parallel_jobs(),
            grace_period_secs: default_grace_period_secs(),
            step_timeout_minutes: None,
            output_tail_lines: default_output_tail_lines(),
            log_format: LogFormat::default(),
            output_format: OutputFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl CliConfig {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a file; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).with_context(|| format!("writing config {}", path.display()))
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let dirs = directories::ProjectDirs::from("dev", "sieve", "sieve")
            .context("could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "max_parallel_jobs" => {
                let jobs: usize = parse(key, value)?;
                if jobs == 0 {
                    bail!("max_parallel_jobs must be at least 1");
                }
                self.max_parallel_jobs = jobs;
            }
            "grace_period_secs" => self.grace_period_secs = parse(key, value)?,
            "step_timeout_minutes" => {
                self.step_timeout_minutes = match value {
                    "" | "none" => None,
                    _ => Some(parse(key, value)?),
                }
            }
            "output_tail_lines" => self.output_tail_lines = parse(key, value)?,
            "log_format" => {
                self.log_format = match value {
                    "text" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    _ => bail!("Invalid log format: {value}"),
                }
            }
            "output_format" => {
                self.output_format = match value {
                    "table" => OutputFormat::Table,
                    "json" => OutputFormat::Json,
                    "yaml" => OutputFormat::Yaml,
                    _ => bail!("Invalid output format: {value}"),
                }
            }
            _ => bail!("Unknown config key: {key}"),
        }
        Ok(())
    }

    pub fn scheduler_config(&self, workspace: &Path) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_max_parallel_jobs(self.max_parallel_jobs)
            .with_workspace(workspace)
            .with_default_step_timeout(self.step_timeout())
    }

    pub fn arbiter_config(&self) -> ArbiterConfig {
        ArbiterConfig::default().with_grace_period(Duration::from_secs(self.grace_period_secs))
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::default()
            .with_default_timeout(self.step_timeout())
            .with_kill_grace(Duration::from_secs(self.grace_period_secs))
            .with_tail_lines(self.output_tail_lines)
    }

    fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60))
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {key}: {value}"))
}
