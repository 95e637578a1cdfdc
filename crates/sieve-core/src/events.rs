//! Run lifecycle events.

use crate::ids::RunId;
use crate::run::{CategoryFlags, JobStatus, RunState};
use crate::trigger::EventKind;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunAdmitted(RunAdmittedPayload),
    RunSuperseded(RunSupersededPayload),
    CategoriesResolved(CategoriesResolvedPayload),
    JobStarted(JobStartedPayload),
    ServiceReady(ServiceReadyPayload),
    JobCompleted(JobCompletedPayload),
    RunCompleted(RunCompletedPayload),
}

impl RunEvent {
    /// Dotted subject, e.g. `job.completed.<run_id>.<job>`.
    pub fn subject(&self) -> String {
        match self {
            RunEvent::RunAdmitted(p) => format!("run.admitted.{}", p.run_id),
            RunEvent::RunSuperseded(p) => format!("run.superseded.{}", p.run_id),
            RunEvent::CategoriesResolved(p) => format!("run.categories.{}", p.run_id),
            RunEvent::JobStarted(p) => format!("job.started.{}.{}", p.run_id, p.job),
            RunEvent::ServiceReady(p) => {
                format!("job.service_ready.{}.{}.{}", p.run_id, p.job, p.service)
            }
            RunEvent::JobCompleted(p) => format!("job.completed.{}.{}", p.run_id, p.job),
            RunEvent::RunCompleted(p) => format!("run.completed.{}", p.run_id),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunAdmitted(p) => p.run_id,
            RunEvent::RunSuperseded(p) => p.run_id,
            RunEvent::CategoriesResolved(p) => p.run_id,
            RunEvent::JobStarted(p) => p.run_id,
            RunEvent::ServiceReady(p) => p.run_id,
            RunEvent::JobCompleted(p) => p.run_id,
            RunEvent::RunCompleted(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunAdmittedPayload {
    pub run_id: RunId,
    pub pipeline: String,
    pub group: String,
    pub event: EventKind,
    pub git_ref: String,
    pub admitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunSupersededPayload {
    /// The run being cancelled.
    pub run_id: RunId,
    pub superseded_by: RunId,
    pub group: String,
    pub cancelled_jobs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CategoriesResolvedPayload {
    pub run_id: RunId,
    pub changed_paths: usize,
    pub categories: CategoryFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobStartedPayload {
    pub run_id: RunId,
    pub job: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceReadyPayload {
    pub run_id: RunId,
    pub job: String,
    pub service: String,
    pub attempts: u32,
    pub waited_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobCompletedPayload {
    pub run_id: RunId,
    pub job: String,
    pub status: JobStatus,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub state: RunState,
    pub failed_jobs: Vec<String>,
    pub duration_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let run_id = RunId::new();
        let event = RunEvent::JobCompleted(JobCompletedPayload {
            run_id,
            job: "backend-test".into(),
            status: JobStatus::Blocked,
            duration_ms: None,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_completed");
        assert_eq!(json["status"], "blocked");
        assert_eq!(event.subject(), format!("job.completed.{run_id}.backend-test"));
        assert_eq!(event.run_id(), run_id);
    }
}
