//! Dependency-ordered job execution for one run.

use crate::concurrency::RunHandle;
use crate::dag::{JobGraph, JobNode};
use crate::service_gate::{GateError, ServiceGate};
use chrono::Utc;
use futures::FutureExt;
use sieve_core::events::{
    JobCompletedPayload, JobStartedPayload, RunCompletedPayload, RunEvent, ServiceReadyPayload,
};
use sieve_core::interpolation::InterpolationContext;
use sieve_core::pipeline::PipelineDefinition;
use sieve_core::ports::{EventSink, ProbeFactory, StepContext, StepExecutor};
use sieve_core::predicate::EvaluationContext;
use sieve_core::run::{FailureDetail, JobRecord, JobStatus, RunReport, StepStatus};
use sieve_core::{Error, Result};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Jobs allowed to execute steps at the same time.
    pub max_parallel_jobs: usize,
    /// Working directory handed to every step.
    pub workspace: PathBuf,
    /// Step timeout when neither the step nor its job sets one.
    pub default_step_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 4,
            workspace: PathBuf::from("."),
            default_step_timeout: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_parallel_jobs(mut self, max_parallel_jobs: usize) -> Self {
        self.max_parallel_jobs = max_parallel_jobs.max(1);
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_step_timeout = timeout;
        self
    }
}

/// Walks a job graph in dependency order and decides, per job, whether it
/// runs, is skipped or is blocked.
pub struct RunScheduler {
    executor: Arc<dyn StepExecutor>,
    probes: Arc<dyn ProbeFactory>,
    sink: Arc<dyn EventSink>,
    config: SchedulerConfig,
}

impl RunScheduler {
    pub fn new(
        executor: Arc<dyn StepExecutor>,
        probes: Arc<dyn ProbeFactory>,
        sink: Arc<dyn EventSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            executor,
            probes,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Execute every job of the run and return the final report.
    ///
    /// A job starts only once all of its upstream jobs are terminal. Its
    /// predicate is evaluated first (false: Skipped), then its required
    /// dependencies are checked (any not Succeeded: Blocked).
    pub async fn schedule(
        &self,
        pipeline: &PipelineDefinition,
        graph: &JobGraph,
        run: &RunHandle,
    ) -> Result<RunReport> {
        let (categories, event, base_ctx) = {
            let snapshot = run.read().await;
            (
                snapshot.categories.clone(),
                snapshot.event.clone(),
                InterpolationContext::for_event(&pipeline.name, &snapshot.event)
                    .with_env(&pipeline.env),
            )
        };
        let target_branch = event.target_branch().to_string();
        let eval_ctx = EvaluationContext {
            categories: &categories,
            event: event.kind,
            target_branch: &target_branch,
        };
        let cancel = run.cancel_token().clone();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_jobs.max(1)));

        info!(
            run_id = %run.id(),
            group = %run.group(),
            jobs = graph.len(),
            categories = %categories,
            "Scheduling run"
        );

        let mut statuses: HashMap<String, JobStatus> = graph
            .topological_order()
            .into_iter()
            .map(|node| (node.name.clone(), JobStatus::Pending))
            .collect();
        let mut waiting: Vec<&JobNode> = graph.topological_order();
        let mut join_set = JoinSet::new();

        loop {
            let mut progressed = true;
            while progressed {
                progressed = false;
                let mut still_waiting = Vec::with_capacity(waiting.len());
                for node in waiting {
                    if cancel.is_cancelled() {
                        let record = cancelled_record(run, &node.name).await;
                        self.record(run, &mut statuses, record).await;
                        progressed = true;
                        continue;
                    }

                    let deps = graph.dependencies(&node.name);
                    if !deps.iter().all(|(dep, _)| statuses[&dep.name].is_terminal()) {
                        still_waiting.push(node);
                        continue;
                    }
                    progressed = true;

                    if !node.predicate.evaluate(&eval_ctx) {
                        debug!(run_id = %run.id(), job = %node.name, predicate = %node.predicate, "Predicate false");
                        let record = settled_record(run, &node.name, JobStatus::Skipped, Vec::new()).await;
                        self.record(run, &mut statuses, record).await;
                        continue;
                    }

                    let blocked_by: Vec<String> = graph
                        .required_dependencies(&node.name)
                        .into_iter()
                        .filter(|dep| statuses[&dep.name] != JobStatus::Succeeded)
                        .map(|dep| dep.name.clone())
                        .collect();
                    if !blocked_by.is_empty() {
                        debug!(run_id = %run.id(), job = %node.name, blocked_by = ?blocked_by, "Required dependency did not succeed");
                        let record = settled_record(run, &node.name, JobStatus::Blocked, blocked_by).await;
                        self.record(run, &mut statuses, record).await;
                        continue;
                    }

                    statuses.insert(node.name.clone(), JobStatus::Running);
                    let task = JobTask {
                        run: run.clone(),
                        node: node.clone(),
                        pipeline_env: pipeline.env.clone(),
                        interpolation: base_ctx.clone(),
                        workspace: self.config.workspace.clone(),
                        default_step_timeout: self.config.default_step_timeout,
                        executor: Arc::clone(&self.executor),
                        probes: Arc::clone(&self.probes),
                        sink: Arc::clone(&self.sink),
                        cancel: cancel.clone(),
                        semaphore: Arc::clone(&semaphore),
                    };
                    let name = node.name.clone();
                    let handle = run.clone();
                    join_set.spawn(async move {
                        match AssertUnwindSafe(task.execute()).catch_unwind().await {
                            Ok(record) => record,
                            Err(_) => {
                                error!(run_id = %handle.id(), job = %name, "Job task panicked");
                                let record = pending_record(&handle, &name).await;
                                finish_failed(record, None, &name, "job task panicked".to_string(), String::new())
                            }
                        }
                    });
                }
                waiting = still_waiting;
            }

            if join_set.is_empty() {
                break;
            }

            match join_set.join_next().await {
                Some(Ok(record)) => self.record(run, &mut statuses, record).await,
                Some(Err(e)) => {
                    error!(run_id = %run.id(), error = %e, "Job task aborted");
                    run.mark_finished();
                    return Err(Error::Internal(format!("job task aborted: {e}")));
                }
                None => break,
            }
        }

        let report = {
            let mut graph = run.write().await;
            if cancel.is_cancelled() {
                graph.cancel_pending();
            }
            graph.finish();
            graph.report()
        };
        run.mark_finished();

        let failed_jobs: Vec<String> = report.failed_jobs().map(|j| j.name.clone()).collect();
        info!(
            run_id = %report.run_id,
            state = ?report.state,
            failed = failed_jobs.len(),
            "Run finished"
        );
        self.publish(RunEvent::RunCompleted(RunCompletedPayload {
            run_id: report.run_id,
            state: report.state,
            failed_jobs,
            duration_ms: report.duration_ms,
        }))
        .await;

        Ok(report)
    }

    async fn record(
        &self,
        run: &RunHandle,
        statuses: &mut HashMap<String, JobStatus>,
        record: JobRecord,
    ) {
        let name = record.name.clone();
        let status = run.write().await.complete_job(record);
        statuses.insert(name.clone(), status);

        let duration_ms = run.read().await.job(&name).and_then(|j| j.duration_ms);
        match status {
            JobStatus::Failed => warn!(run_id = %run.id(), job = %name, "Job failed"),
            _ => info!(run_id = %run.id(), job = %name, status = %status, "Job completed"),
        }
        self.publish(RunEvent::JobCompleted(JobCompletedPayload {
            run_id: run.id(),
            job: name,
            status,
            duration_ms,
        }))
        .await;
    }

    async fn publish(&self, event: RunEvent) {
        publish(self.sink.as_ref(), event).await;
    }
}

/// Publish an event, logging rather than propagating sink failures.
pub(crate) async fn publish(sink: &dyn EventSink, event: RunEvent) {
    let subject = event.subject();
    if let Err(e) = sink.publish(event).await {
        warn!(subject = %subject, error = %e, "Failed to publish run event");
    }
}

/// The run graph's current record of a job.
async fn pending_record(run: &RunHandle, name: &str) -> JobRecord {
    run.read()
        .await
        .job(name)
        .cloned()
        .unwrap_or_else(|| JobRecord::pending(name, Vec::<String>::new()))
}

/// Record for a job decided without running it.
async fn settled_record(
    run: &RunHandle,
    name: &str,
    status: JobStatus,
    blocked_by: Vec<String>,
) -> JobRecord {
    let mut record = pending_record(run, name).await;
    record.status = status;
    record.blocked_by = blocked_by;
    for step in &mut record.steps {
        step.status = StepStatus::NotRun;
    }
    record
}

async fn cancelled_record(run: &RunHandle, name: &str) -> JobRecord {
    let mut record = settled_record(run, name, JobStatus::Cancelled, Vec::new()).await;
    for step in &mut record.steps {
        step.status = StepStatus::Cancelled;
    }
    record
}

/// Everything one spawned job needs, owned.
struct JobTask {
    run: RunHandle,
    node: JobNode,
    pipeline_env: HashMap<String, String>,
    interpolation: InterpolationContext,
    workspace: PathBuf,
    default_step_timeout: Option<Duration>,
    executor: Arc<dyn StepExecutor>,
    probes: Arc<dyn ProbeFactory>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
}

impl JobTask {
    async fn execute(self) -> JobRecord {
        let run_id = self.run.id();
        let name = self.node.name.clone();
        let mut record = pending_record(&self.run, &name).await;

        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return finish_cancelled(record, 0),
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return finish_failed(record, None, &name, "job semaphore closed".to_string(), String::new()),
            },
        };

        self.run.write().await.start_job(&name);
        let started_at = Utc::now();
        record.status = JobStatus::Running;
        record.started_at = Some(started_at);
        info!(run_id = %run_id, job = %name, "Job started");
        publish(
            self.sink.as_ref(),
            RunEvent::JobStarted(JobStartedPayload {
                run_id,
                job: name.clone(),
                started_at,
            }),
        )
        .await;

        if let Some(record) = self.await_services(&mut record).await {
            return record;
        }
        self.run_steps(record).await
    }

    /// Gate on every service requirement. Returns the final record if the
    /// job cannot proceed.
    async fn await_services(&self, record: &mut JobRecord) -> Option<JobRecord> {
        let run_id = self.run.id();
        for requirement in &self.node.definition.services {
            let probe = match self.probes.build(&requirement.probe) {
                Ok(probe) => probe,
                Err(e) => {
                    return Some(finish_failed(
                        record.clone(),
                        None,
                        &requirement.name,
                        e.to_string(),
                        String::new(),
                    ));
                }
            };

            debug!(run_id = %run_id, job = %self.node.name, service = %requirement.name, probe = %probe.describe(), "Waiting for service");
            match ServiceGate::for_requirement(requirement)
                .await_healthy(probe.as_ref(), &self.cancel)
                .await
            {
                Ok(ready) => {
                    info!(
                        run_id = %run_id,
                        job = %self.node.name,
                        service = %requirement.name,
                        attempts = ready.attempts,
                        "Service ready"
                    );
                    publish(
                        self.sink.as_ref(),
                        RunEvent::ServiceReady(ServiceReadyPayload {
                            run_id,
                            job: self.node.name.clone(),
                            service: requirement.name.clone(),
                            attempts: ready.attempts,
                            waited_ms: ready.waited.as_millis() as u64,
                        }),
                    )
                    .await;
                }
                Err(GateError::Cancelled { .. }) => {
                    return Some(finish_cancelled(record.clone(), 0));
                }
                Err(GateError::TimedOut {
                    attempts,
                    waited,
                    last_error,
                }) => {
                    let err = Error::ServiceTimeout {
                        service: requirement.name.clone(),
                        attempts,
                        waited_ms: waited.as_millis() as u64,
                    };
                    warn!(run_id = %run_id, job = %self.node.name, error = %err, "Service never became healthy");
                    return Some(finish_failed(
                        record.clone(),
                        None,
                        &requirement.name,
                        err.to_string(),
                        last_error.unwrap_or_default(),
                    ));
                }
            }
        }
        None
    }

    async fn run_steps(&self, mut record: JobRecord) -> JobRecord {
        let job = &self.node.definition;
        let job_ctx = self.interpolation.clone().with_env(&job.env);

        for (idx, step) in job.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return finish_cancelled(record, idx);
            }

            let mut env = self.pipeline_env.clone();
            env.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));
            env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));

            let mut step_def = step.clone();
            step_def.run = job_ctx.clone().with_env(&step.env).interpolate(&step.run);

            let timeout = step
                .timeout_minutes
                .or(job.timeout_minutes)
                .map(|m| Duration::from_secs(u64::from(m) * 60))
                .or(self.default_step_timeout);

            let ctx = StepContext {
                run_id: self.run.id(),
                job: self.node.name.clone(),
                step: step_def,
                workspace: self.workspace.clone(),
                env,
                timeout,
            };

            if let Some(rec) = record.steps.get_mut(idx) {
                rec.status = StepStatus::Running;
            }
            debug!(run_id = %self.run.id(), job = %self.node.name, step = %step.name, "Running step");

            match self.executor.run(ctx, self.cancel.child_token()).await {
                Ok(outcome) => {
                    if let Some(rec) = record.steps.get_mut(idx) {
                        rec.exit_code = Some(outcome.exit_code);
                        rec.output = outcome.output.clone();
                        rec.duration_ms = Some(outcome.duration_ms);
                    }
                    if outcome.cancelled {
                        return finish_cancelled(record, idx);
                    }
                    if outcome.success() {
                        if let Some(rec) = record.steps.get_mut(idx) {
                            rec.status = StepStatus::Succeeded;
                        }
                        continue;
                    }
                    let message = if outcome.timed_out {
                        format!("Step `{}` timed out", step.name)
                    } else {
                        Error::StepFailed {
                            step: step.name.clone(),
                            exit_code: outcome.exit_code,
                            output: String::new(),
                        }
                        .to_string()
                    };
                    return finish_failed(record, Some(idx), &step.name, message, outcome.output);
                }
                Err(e) => {
                    return finish_failed(record, Some(idx), &step.name, e.to_string(), String::new());
                }
            }
        }

        record.status = JobStatus::Succeeded;
        record.completed_at = Some(Utc::now());
        record
    }
}

/// Mark the failing step (if a step failed) Failed and every step after it
/// NotRun. `cause` names the step or service that failed.
fn finish_failed(
    mut record: JobRecord,
    failed_step: Option<usize>,
    cause: &str,
    message: String,
    output: String,
) -> JobRecord {
    for (idx, rec) in record.steps.iter_mut().enumerate() {
        match failed_step {
            Some(failed) if idx == failed => rec.status = StepStatus::Failed,
            Some(failed) if idx < failed => {}
            _ => rec.status = StepStatus::NotRun,
        }
    }
    record.status = JobStatus::Failed;
    record.failure = Some(FailureDetail {
        step: cause.to_string(),
        message,
        output,
    });
    record.completed_at = Some(Utc::now());
    record
}

/// Mark every step from `from` onwards Cancelled.
fn finish_cancelled(mut record: JobRecord, from: usize) -> JobRecord {
    for rec in record.steps.iter_mut().skip(from) {
        rec.status = StepStatus::Cancelled;
    }
    record.status = JobStatus::Cancelled;
    record.completed_at = Some(Utc::now());
    record
}
