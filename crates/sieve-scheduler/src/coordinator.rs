//! Glue service: trigger match, admit, classify, schedule, release.

use crate::classifier::PathClassifier;
use crate::concurrency::{ArbiterConfig, ConcurrencyArbiter, GroupRegistry, RunHandle};
use crate::dag::JobGraph;
use crate::plan::{RunPlan, plan_jobs};
use crate::scheduler::{RunScheduler, SchedulerConfig};
use crate::triggers::TriggerMatcher;
use sieve_core::Result;
use sieve_core::events::{CategoriesResolvedPayload, RunEvent};
use sieve_core::pipeline::PipelineDefinition;
use sieve_core::ports::{EventSink, ProbeFactory, StepExecutor};
use sieve_core::run::RunReport;
use sieve_core::trigger::TriggerEvent;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub scheduler: SchedulerConfig,
    pub arbiter: ArbiterConfig,
}

/// Runs one pipeline for incoming events.
pub struct Coordinator {
    pipeline: PipelineDefinition,
    graph: JobGraph,
    classifier: PathClassifier,
    triggers: TriggerMatcher,
    arbiter: ConcurrencyArbiter,
    scheduler: RunScheduler,
    sink: Arc<dyn EventSink>,
}

impl Coordinator {
    /// Validate the pipeline and wire the components together.
    ///
    /// Fails on any load-time error (cycles, unknown jobs or categories,
    /// bad predicates or globs) before a run can start.
    pub fn new(
        pipeline: PipelineDefinition,
        executor: Arc<dyn StepExecutor>,
        probes: Arc<dyn ProbeFactory>,
        sink: Arc<dyn EventSink>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        Self::with_registry(
            pipeline,
            executor,
            probes,
            sink,
            config,
            Arc::new(GroupRegistry::new()),
        )
    }

    /// Like [`Coordinator::new`], sharing an existing group registry.
    pub fn with_registry(
        pipeline: PipelineDefinition,
        executor: Arc<dyn StepExecutor>,
        probes: Arc<dyn ProbeFactory>,
        sink: Arc<dyn EventSink>,
        config: CoordinatorConfig,
        registry: Arc<GroupRegistry>,
    ) -> Result<Self> {
        let graph = JobGraph::build(&pipeline)?;
        let classifier = PathClassifier::new(&pipeline.categories)?;
        let triggers = TriggerMatcher::new(pipeline.triggers.as_ref())?;
        let arbiter = ConcurrencyArbiter::new(registry, config.arbiter, Arc::clone(&sink));
        let scheduler = RunScheduler::new(executor, probes, Arc::clone(&sink), config.scheduler);

        Ok(Self {
            pipeline,
            graph,
            classifier,
            triggers,
            arbiter,
            scheduler,
            sink,
        })
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.pipeline
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn arbiter(&self) -> &ConcurrencyArbiter {
        &self.arbiter
    }

    /// Decide what an event would do without executing anything.
    pub fn plan(&self, event: &TriggerEvent) -> RunPlan {
        let categories = self.classifier.classify(&event.changes);
        RunPlan {
            triggered: self.triggers.matches(event),
            group: ConcurrencyArbiter::group_key(&self.pipeline, event),
            jobs: plan_jobs(&self.graph, &categories, event),
            categories,
        }
    }

    /// Handle an event end to end. Returns `None` when the pipeline is not
    /// triggered by it.
    pub async fn handle(&self, event: TriggerEvent) -> Result<Option<RunReport>> {
        if !self.triggers.matches(&event) {
            info!(
                event_id = %event.id,
                kind = %event.kind,
                git_ref = %event.git_ref,
                "Event does not trigger pipeline"
            );
            return Ok(None);
        }

        let handle = self
            .arbiter
            .admit(&self.pipeline, event, self.graph.pending_records())
            .await?;
        let result = self.execute(&handle).await;

        handle.mark_finished();
        self.arbiter.release(&handle).await;
        result.map(Some)
    }

    async fn execute(&self, handle: &RunHandle) -> Result<RunReport> {
        let (categories, changed_paths) = {
            let mut graph = handle.write().await;
            let categories = self.classifier.classify(&graph.event.changes);
            graph.categories = categories.clone();
            (categories, graph.event.changes.len())
        };

        if let Err(e) = self
            .sink
            .publish(RunEvent::CategoriesResolved(CategoriesResolvedPayload {
                run_id: handle.id(),
                changed_paths,
                categories,
            }))
            .await
        {
            warn!(run_id = %handle.id(), error = %e, "Failed to publish run event");
        }

        self.scheduler
            .schedule(&self.pipeline, &self.graph, handle)
            .await
    }

    /// Cancel every run currently admitted, e.g. on Ctrl-C.
    pub async fn cancel_all(&self) {
        self.arbiter.cancel_all().await;
    }
}
