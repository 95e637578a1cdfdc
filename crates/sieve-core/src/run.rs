//! Run and execution types.

use crate::ids::RunId;
use crate::trigger::TriggerEvent;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-category "relevant change present" flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CategoryFlags(BTreeMap<String, bool>);

impl CategoryFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown categories read as false.
    pub fn get(&self, category: &str) -> bool {
        self.0.get(category).copied().unwrap_or(false)
    }

    pub fn set(&mut self, category: impl Into<String>, relevant: bool) {
        self.0.insert(category.into(), relevant);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, bool)> for CategoryFlags {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for CategoryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (name, relevant)) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={relevant}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Blocked,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded
                | JobStatus::Failed
                | JobStatus::Skipped
                | JobStatus::Blocked
                | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Blocked => "blocked",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    NotRun,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    /// Tail of the captured stdout/stderr.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    pub duration_ms: Option<u64>,
}

impl StepRecord {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            exit_code: None,
            output: String::new(),
            duration_ms: None,
        }
    }
}

/// Why a job ended Failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FailureDetail {
    /// Failing step, or the service that never became healthy.
    pub step: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    pub name: String,
    pub status: JobStatus,
    pub steps: Vec<StepRecord>,
    pub failure: Option<FailureDetail>,
    /// Required dependencies that did not succeed, for Blocked jobs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl JobRecord {
    pub fn pending<I, S>(name: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            status: JobStatus::Pending,
            steps: steps.into_iter().map(StepRecord::pending).collect(),
            failure: None,
            blocked_by: Vec::new(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Active,
    Completed,
    Cancelled,
}

/// Snapshot of one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunGraph {
    pub id: RunId,
    pub pipeline: String,
    /// Concurrency group key.
    pub group: String,
    pub event: TriggerEvent,
    pub categories: CategoryFlags,
    pub state: RunState,
    /// Jobs in topological order.
    pub jobs: Vec<JobRecord>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunGraph {
    pub fn new(
        pipeline: impl Into<String>,
        group: impl Into<String>,
        event: TriggerEvent,
        jobs: Vec<JobRecord>,
    ) -> Self {
        Self {
            id: RunId::new(),
            pipeline: pipeline.into(),
            group: group.into(),
            event,
            categories: CategoryFlags::default(),
            state: RunState::Active,
            jobs,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn job(&self, name: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Option<&mut JobRecord> {
        self.jobs.iter_mut().find(|j| j.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<JobStatus> {
        self.job(name).map(|j| j.status)
    }

    /// Mark a pending job as running. Returns false if the job is not pending.
    pub fn start_job(&mut self, name: &str) -> bool {
        match self.job_mut(name) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Record a job's final state. Terminal statuses are never overwritten,
    /// so a job the arbiter already cancelled stays cancelled.
    pub fn complete_job(&mut self, record: JobRecord) -> JobStatus {
        let Some(job) = self.job_mut(&record.name) else {
            return record.status;
        };
        if job.status.is_terminal() {
            return job.status;
        }
        let started_at = job.started_at.or(record.started_at);
        let completed_at = record.completed_at.unwrap_or_else(Utc::now);
        *job = JobRecord {
            started_at,
            completed_at: Some(completed_at),
            duration_ms: started_at
                .map(|s| (completed_at - s).num_milliseconds().max(0) as u64)
                .or(record.duration_ms),
            ..record
        };
        job.status
    }

    /// Force every non-terminal job (and its unfinished steps) to Cancelled.
    /// Returns the names of the jobs that changed.
    pub fn cancel_pending(&mut self) -> Vec<String> {
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for job in &mut self.jobs {
            if job.status.is_terminal() {
                continue;
            }
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(now);
            for step in &mut job.steps {
                if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                    step.status = StepStatus::Cancelled;
                }
            }
            cancelled.push(job.name.clone());
        }
        if self.state == RunState::Active {
            self.state = RunState::Cancelled;
        }
        if self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        cancelled
    }

    pub fn is_complete(&self) -> bool {
        self.jobs.iter().all(|j| j.status.is_terminal())
    }

    pub fn is_active(&self) -> bool {
        self.state == RunState::Active
    }

    /// Close the run once every job is terminal.
    pub fn finish(&mut self) {
        if self.state == RunState::Active {
            self.state = RunState::Completed;
        }
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.id,
            pipeline: self.pipeline.clone(),
            group: self.group.clone(),
            state: self.state,
            categories: self.categories.clone(),
            jobs: self.jobs.clone(),
            duration_ms: self
                .completed_at
                .map(|c| (c - self.created_at).num_milliseconds().max(0) as u64),
        }
    }
}

/// Final per-job outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub group: String,
    pub state: RunState,
    pub categories: CategoryFlags,
    pub jobs: Vec<JobRecord>,
    pub duration_ms: Option<u64>,
}

impl RunReport {
    pub fn status_of(&self, name: &str) -> Option<JobStatus> {
        self.jobs.iter().find(|j| j.name == name).map(|j| j.status)
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter().filter(|j| j.status == JobStatus::Failed)
    }

    pub fn succeeded(&self) -> bool {
        self.failed_jobs().next().is_none()
    }

    /// Process exit code: 0 iff no job failed.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() { 0 } else { 1 }
    }

    /// Count of jobs per status, in status order.
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for job in &self.jobs {
            *counts.entry(job.status.to_string()).or_insert(0) += 1;
        }
        counts
    }
}
