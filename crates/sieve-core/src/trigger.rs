//! Trigger events and change sets.

use crate::glob::normalize_path;
use crate::ids::EventId;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            other => Err(format!("unknown event kind `{other}`")),
        }
    }
}

/// Changed file paths of one event, captured once at run start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct ChangeSet(Vec<String>);

impl ChangeSet {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            paths
                .into_iter()
                .map(|p| normalize_path(p.as_ref().trim()).to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        )
    }

    pub fn paths(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for ChangeSet {
    fn from(paths: Vec<String>) -> Self {
        Self::new(paths)
    }
}

impl From<ChangeSet> for Vec<String> {
    fn from(changes: ChangeSet) -> Self {
        changes.0
    }
}

impl<S: AsRef<str>> FromIterator<S> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// An incoming push or pull request event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerEvent {
    #[serde(default)]
    pub id: EventId,
    pub kind: EventKind,
    /// Pushed ref (`refs/heads/main`, `main`) or the PR merge ref.
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub head_branch: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default, alias = "changed_files")]
    pub changes: ChangeSet,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn push(git_ref: impl Into<String>, changes: ChangeSet) -> Self {
        Self {
            id: EventId::new(),
            kind: EventKind::Push,
            git_ref: git_ref.into(),
            head_branch: None,
            base_branch: None,
            changes,
            received_at: Utc::now(),
        }
    }

    pub fn pull_request(
        head_branch: impl Into<String>,
        base_branch: impl Into<String>,
        changes: ChangeSet,
    ) -> Self {
        let head_branch = head_branch.into();
        Self {
            id: EventId::new(),
            kind: EventKind::PullRequest,
            git_ref: format!("refs/heads/{head_branch}"),
            head_branch: Some(head_branch),
            base_branch: Some(base_branch.into()),
            changes,
            received_at: Utc::now(),
        }
    }

    /// Branch the event is aimed at: the PR base, or the pushed branch.
    pub fn target_branch(&self) -> &str {
        match (self.kind, self.base_branch.as_deref()) {
            (EventKind::PullRequest, Some(base)) => strip_ref(base),
            _ => strip_ref(&self.git_ref),
        }
    }

    /// Branch used to derive the concurrency group: the PR head branch, or
    /// the pushed branch. A push and a PR from the same branch share it.
    pub fn concurrency_ref(&self) -> &str {
        match (self.kind, self.head_branch.as_deref()) {
            (EventKind::PullRequest, Some(head)) => strip_ref(head),
            _ => strip_ref(&self.git_ref),
        }
    }
}

fn strip_ref(r: &str) -> &str {
    r.strip_prefix("refs/heads/").unwrap_or(r)
}
