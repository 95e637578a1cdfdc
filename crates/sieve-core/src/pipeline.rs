//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.

use crate::predicate::Predicate;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Which events trigger the pipeline. Absent means every event.
    #[serde(default, rename = "on")]
    pub triggers: Option<TriggerConfig>,
    #[serde(default)]
    pub concurrency: Option<ConcurrencyConfig>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub categories: BTreeMap<String, CategoryDefinition>,
    pub jobs: Vec<JobDefinition>,
}

impl PipelineDefinition {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|e| match e {
            Error::Serialization(msg) => {
                Error::InvalidPipeline(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// The concurrency settings in effect, falling back to the defaults.
    pub fn concurrency(&self) -> ConcurrencyConfig {
        self.concurrency.clone().unwrap_or_default()
    }

    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    #[serde(default)]
    pub push: Option<BranchFilter>,
    #[serde(default)]
    pub pull_request: Option<BranchFilter>,
}

/// Branch globs an event must (not) target. Empty `branches` means all.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BranchFilter {
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub branches_ignore: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConcurrencyConfig {
    /// Group key template, rendered per event.
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_cancel_in_progress")]
    pub cancel_in_progress: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            cancel_in_progress: default_cancel_in_progress(),
        }
    }
}

fn default_group() -> String {
    "${{ workflow }}-${{ ref }}".to_string()
}

fn default_cancel_in_progress() -> bool {
    true
}

/// A named partition of the change set.
///
/// The category is relevant when some changed path matches `files` (or
/// `files` is empty) and matches none of `ignore`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CategoryDefinition {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Upstream jobs that must succeed.
    #[serde(default)]
    pub needs: Vec<String>,
    /// Upstream jobs that must finish first, whatever their outcome.
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub when: Option<RunCondition>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub services: Vec<ServiceRequirement>,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

impl JobDefinition {
    /// The job's run predicate; jobs without `when` always run.
    pub fn predicate(&self) -> Result<Predicate> {
        match &self.when {
            None => Ok(Predicate::Always),
            Some(RunCondition::Expression(expr)) => Predicate::parse(expr),
            Some(RunCondition::Tree(tree)) => Ok(tree.clone()),
        }
    }

    /// Every upstream job, required or ordering-only.
    pub fn upstream(&self) -> impl Iterator<Item = &str> {
        self.needs
            .iter()
            .chain(self.after.iter())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RunCondition {
    Expression(String),
    Tree(
        #[serde(with = "serde_yaml::with::singleton_map_recursive")]
        #[schemars(with = "Predicate")]
        Predicate,
    ),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    pub run: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

fn default_shell() -> String {
    "bash".to_string()
}

/// A long-lived auxiliary service a job waits on before its first step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceRequirement {
    pub name: String,
    pub probe: ProbeDefinition,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

fn default_interval() -> u64 {
    10
}

fn default_service_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeDefinition {
    Tcp {
        #[serde(default = "default_host")]
        host: String,
        port: u16,
    },
    Command {
        run: String,
        #[serde(default = "default_shell")]
        shell: String,
    },
}

fn default_host() -> String {
    "localhost".to_string()
}
