//! Error types for Sieve.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Pipeline definition errors
    #[error("Cycle detected in job dependencies: {}", .jobs.join(" -> "))]
    CyclicDependency { jobs: Vec<String> },

    #[error("Job `{job}` depends on unknown job `{dependency}`")]
    UnknownDependency { job: String, dependency: String },

    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Pipeline defines no jobs")]
    EmptyPipeline,

    #[error("Job `{job}` references unknown category `{category}`")]
    UnknownCategory { job: String, category: String },

    #[error("Invalid predicate `{expression}`: {reason}")]
    InvalidPredicate { expression: String, reason: String },

    #[error("Invalid glob pattern `{pattern}`: {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    // Execution errors
    #[error("Step `{step}` failed with exit code {exit_code}")]
    StepFailed {
        step: String,
        exit_code: i32,
        output: String,
    },

    #[error("Service `{service}` not healthy after {waited_ms} ms ({attempts} probes)")]
    ServiceTimeout {
        service: String,
        attempts: u32,
        waited_ms: u64,
    },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors raised while loading a pipeline, before any run starts.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::CyclicDependency { .. }
                | Error::UnknownDependency { .. }
                | Error::DuplicateJob(_)
                | Error::EmptyPipeline
                | Error::UnknownCategory { .. }
                | Error::InvalidPredicate { .. }
                | Error::InvalidGlob { .. }
                | Error::InvalidPipeline(_)
        )
    }

    /// Cancellation is recorded separately and never counts as a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
