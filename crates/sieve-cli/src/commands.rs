//! CLI command definitions.

use crate::config::OutputFormat;
use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use sieve_core::trigger::{ChangeSet, EventKind, TriggerEvent};
use std::io::Read;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "sieve.yaml")]
        path: PathBuf,
    },

    /// Show which jobs an event would run, skip or block
    Plan {
        /// Path to pipeline file
        #[arg(default_value = "sieve.yaml")]
        path: PathBuf,

        #[command(flatten)]
        event: EventArgs,

        /// Output format
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Run the pipeline on this host for one event
    Run {
        /// Path to pipeline file
        #[arg(default_value = "sieve.yaml")]
        path: PathBuf,

        #[command(flatten)]
        event: EventArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run the pipeline for each JSON event read from stdin, one per line
    Listen {
        /// Path to pipeline file
        #[arg(default_value = "sieve.yaml")]
        path: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Print the JSON Schema of the pipeline file
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },
}

/// Describes the triggering event on the command line.
#[derive(Args, Debug, Clone)]
pub struct EventArgs {
    /// Event kind: push or pull_request
    #[arg(long, default_value = "push")]
    pub event: EventKind,

    /// Pushed ref, or the pull request head branch
    #[arg(long = "ref", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Pull request base branch
    #[arg(long)]
    pub base: Option<String>,

    /// Changed path, repeatable
    #[arg(short, long = "changed")]
    pub changed: Vec<String>,

    /// File listing changed paths, one per line ("-" for stdin)
    #[arg(long)]
    pub changed_from: Option<PathBuf>,

    /// Read the whole event as JSON from a file
    #[arg(long, conflicts_with_all = ["changed", "changed_from", "base"])]
    pub event_file: Option<PathBuf>,
}

impl EventArgs {
    pub fn into_event(self) -> Result<TriggerEvent> {
        if let Some(path) = &self.event_file {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading event {}", path.display()))?;
            return serde_json::from_str(&content)
                .with_context(|| format!("parsing event {}", path.display()));
        }

        let mut paths = self.changed;
        if let Some(source) = &self.changed_from {
            let content = if source.as_os_str() == "-" {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("reading changed paths from stdin")?;
                buf
            } else {
                std::fs::read_to_string(source)
                    .with_context(|| format!("reading changed paths from {}", source.display()))?
            };
            paths.extend(content.lines().map(str::to_string));
        }
        let changes = ChangeSet::new(paths);

        Ok(match self.event {
            EventKind::Push => TriggerEvent::push(self.git_ref, changes),
            EventKind::PullRequest => {
                let Some(base) = self.base else {
                    bail!("--base is required for pull_request events");
                };
                let head = self
                    .git_ref
                    .strip_prefix("refs/heads/")
                    .unwrap_or(&self.git_ref)
                    .to_string();
                TriggerEvent::pull_request(head, base, changes)
            }
        })
    }
}

/// Host execution options.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Directory steps run in
    #[arg(short, long, default_value = ".")]
    pub workspace: PathBuf,

    /// Jobs allowed to run at the same time (overrides config)
    #[arg(short = 'j', long)]
    pub max_parallel_jobs: Option<usize>,

    /// Output format (overrides config)
    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(kind: EventKind, git_ref: &str, base: Option<&str>, changed: &[&str]) -> EventArgs {
        EventArgs {
            event: kind,
            git_ref: git_ref.to_string(),
            base: base.map(str::to_string),
            changed: changed.iter().map(|s| s.to_string()).collect(),
            changed_from: None,
            event_file: None,
        }
    }

    #[test]
    fn test_push_event_from_flags() {
        let event = args(EventKind::Push, "refs/heads/main", None, &["./src/lib.rs", ""])
            .into_event()
            .unwrap();
        assert_eq!(event.kind, EventKind::Push);
        assert_eq!(event.target_branch(), "main");
        assert_eq!(event.changes.paths(), ["src/lib.rs".to_string()]);
    }

    #[test]
    fn test_pull_request_requires_base() {
        assert!(
            args(EventKind::PullRequest, "feature", None, &[])
                .into_event()
                .is_err()
        );

        let event = args(EventKind::PullRequest, "refs/heads/feature", Some("main"), &[])
            .into_event()
            .unwrap();
        assert_eq!(event.head_branch.as_deref(), Some("feature"));
        assert_eq!(event.target_branch(), "main");
        assert_eq!(event.concurrency_ref(), "feature");
    }

    #[test]
    fn test_changed_paths_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("changed.txt");
        std::fs::write(&list, "app/templates/foo.hbs\nCargo.lock\n").unwrap();

        let mut args = args(EventKind::Push, "main", None, &["README.md"]);
        args.changed_from = Some(list);
        let event = args.into_event().unwrap();
        assert_eq!(event.changes.len(), 3);
    }

    #[test]
    fn test_event_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("event.json");
        std::fs::write(
            &file,
            r#"{"kind": "pull_request", "ref": "refs/pull/7/merge", "head_branch": "fix", "base_branch": "main", "changed_files": ["src/lib.rs"]}"#,
        )
        .unwrap();

        let mut args = args(EventKind::Push, "ignored", None, &[]);
        args.event_file = Some(file);
        let event = args.into_event().unwrap();
        assert_eq!(event.kind, EventKind::PullRequest);
        assert_eq!(event.concurrency_ref(), "fix");
        assert_eq!(event.changes.len(), 1);
    }
}
