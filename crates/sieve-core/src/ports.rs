//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and the
//! adapters that execute steps, probe services and observe runs.

use crate::events::RunEvent;
use crate::ids::RunId;
use crate::pipeline::{ProbeDefinition, StepDefinition};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything an executor needs to run one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub job: String,
    pub step: StepDefinition,
    pub workspace: PathBuf,
    /// Pipeline, job and step env merged, step winning.
    pub env: HashMap<String, String>,
    /// Effective timeout (step, then job, then executor default).
    pub timeout: Option<Duration>,
}

/// Result of executing a step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub exit_code: i32,
    /// Tail of stdout and stderr.
    pub output: String,
    pub duration_ms: u64,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl StepOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.cancelled && !self.timed_out
    }
}

/// Runs opaque steps by contract: exit code plus captured output.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute a step. Cancelling the token must stop the step and return
    /// an outcome with `cancelled` set.
    async fn run(&self, ctx: StepContext, cancel: CancellationToken) -> Result<StepOutcome>;
}

/// A single health check of an auxiliary service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok(())` when the service is healthy.
    async fn check(&self) -> Result<()>;

    fn describe(&self) -> String {
        "probe".to_string()
    }
}

/// Builds probes from their pipeline definitions.
pub trait ProbeFactory: Send + Sync {
    fn build(&self, definition: &ProbeDefinition) -> Result<Arc<dyn HealthProbe>>;
}

/// Receives run lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: RunEvent) -> Result<()>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: RunEvent) -> Result<()> {
        Ok(())
    }
}
