//! Concurrency groups: at most one active run per group key.

use crate::scheduler::publish;
use sieve_core::Result;
use sieve_core::events::{RunAdmittedPayload, RunEvent, RunSupersededPayload};
use sieve_core::ids::RunId;
use sieve_core::interpolation::InterpolationContext;
use sieve_core::pipeline::PipelineDefinition;
use sieve_core::ports::EventSink;
use sieve_core::run::{JobRecord, RunGraph, RunState};
use sieve_core::trigger::TriggerEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct RunHandleInner {
    id: RunId,
    group: String,
    graph: RwLock<RunGraph>,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

/// Shared ownership of one admitted run.
#[derive(Clone)]
pub struct RunHandle {
    inner: Arc<RunHandleInner>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.inner.id)
            .field("group", &self.inner.group)
            .finish()
    }
}

impl RunHandle {
    fn new(graph: RunGraph) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            inner: Arc::new(RunHandleInner {
                id: graph.id,
                group: graph.group.clone(),
                graph: RwLock::new(graph),
                cancel: CancellationToken::new(),
                finished,
            }),
        }
    }

    pub fn id(&self) -> RunId {
        self.inner.id
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Token cancelled when the run is superseded or aborted.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, RunGraph> {
        self.inner.graph.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, RunGraph> {
        self.inner.graph.write().await
    }

    pub async fn snapshot(&self) -> RunGraph {
        self.inner.graph.read().await.clone()
    }

    /// Signal that the scheduler is done with this run.
    pub fn mark_finished(&self) {
        self.inner.finished.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.inner.finished.borrow()
    }

    /// Wait until [`RunHandle::mark_finished`] has been called.
    pub async fn wait_finished(&self) {
        let mut rx = self.inner.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

type Slot = Arc<Mutex<Option<RunHandle>>>;

/// Mutex-guarded map of group key to active run.
///
/// Each key has its own slot lock, so admissions for one key are serialized
/// while other keys proceed independently.
#[derive(Default)]
pub struct GroupRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    /// The active run for a key, if any.
    pub async fn active(&self, key: &str) -> Option<RunHandle> {
        let slot = self.slots.lock().await.get(key).cloned()?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Every active run, across keys.
    pub async fn active_runs(&self) -> Vec<RunHandle> {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut runs = Vec::new();
        for slot in slots {
            if let Some(handle) = slot.lock().await.clone() {
                runs.push(handle);
            }
        }
        runs
    }

    /// Drop the slot for a key once nothing holds or waits on it.
    async fn prune(&self, key: &str) {
        let mut slots = self.slots.lock().await;
        let idle = slots.get(key).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|guard| guard.is_none())
        });
        if idle {
            slots.remove(key);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// How long a superseded run may take to wind down before its
    /// remaining jobs are forced to Cancelled.
    pub grace_period: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
        }
    }
}

impl ArbiterConfig {
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

/// Maps invocations to concurrency groups and supersedes in-flight runs.
pub struct ConcurrencyArbiter {
    registry: Arc<GroupRegistry>,
    config: ArbiterConfig,
    sink: Arc<dyn EventSink>,
}

impl ConcurrencyArbiter {
    pub fn new(registry: Arc<GroupRegistry>, config: ArbiterConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            registry,
            config,
            sink,
        }
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    /// Render the group key of an event.
    pub fn group_key(pipeline: &PipelineDefinition, event: &TriggerEvent) -> String {
        InterpolationContext::for_event(&pipeline.name, event)
            .interpolate(&pipeline.concurrency().group)
    }

    /// Admit a new run for the event's group.
    ///
    /// An active run for the same key is cancelled (or, with
    /// `cancel_in_progress: false`, awaited) before the new run exists.
    pub async fn admit(
        &self,
        pipeline: &PipelineDefinition,
        event: TriggerEvent,
        jobs: Vec<JobRecord>,
    ) -> Result<RunHandle> {
        let concurrency = pipeline.concurrency();
        let key = Self::group_key(pipeline, &event);
        let id = RunId::new();

        let slot = self.registry.slot(&key).await;
        let mut active = slot.lock().await;

        if let Some(previous) = active.take() {
            if concurrency.cancel_in_progress {
                self.supersede(&previous, id).await;
            } else if !previous.is_finished() {
                info!(run_id = %previous.id(), group = %key, "Waiting for in-progress run");
                previous.wait_finished().await;
            }
        }

        let mut graph = RunGraph::new(&pipeline.name, &key, event, jobs);
        graph.id = id;
        let payload = RunAdmittedPayload {
            run_id: id,
            pipeline: pipeline.name.clone(),
            group: key.clone(),
            event: graph.event.kind,
            git_ref: graph.event.git_ref.clone(),
            admitted_at: graph.created_at,
        };
        let handle = RunHandle::new(graph);
        *active = Some(handle.clone());
        drop(active);

        info!(run_id = %id, group = %key, "Run admitted");
        publish(self.sink.as_ref(), RunEvent::RunAdmitted(payload)).await;
        Ok(handle)
    }

    async fn supersede(&self, previous: &RunHandle, superseded_by: RunId) {
        if previous.is_finished() {
            return;
        }

        warn!(
            run_id = %previous.id(),
            superseded_by = %superseded_by,
            group = %previous.group(),
            "Cancelling superseded run"
        );
        previous.cancel();

        if tokio::time::timeout(self.config.grace_period, previous.wait_finished())
            .await
            .is_err()
        {
            warn!(
                run_id = %previous.id(),
                grace_ms = self.config.grace_period.as_millis() as u64,
                "Superseded run did not stop within grace period"
            );
        }

        let cancelled_jobs = {
            let mut graph = previous.write().await;
            let cancelled = graph.cancel_pending();
            graph.state = RunState::Cancelled;
            cancelled
        };
        previous.mark_finished();

        publish(
            self.sink.as_ref(),
            RunEvent::RunSuperseded(RunSupersededPayload {
                run_id: previous.id(),
                superseded_by,
                group: previous.group().to_string(),
                cancelled_jobs,
            }),
        )
        .await;
    }

    /// Archive a run: drop it from the registry if it is still the active
    /// run of its group.
    pub async fn release(&self, handle: &RunHandle) {
        if let Some(slot) = self.registry.slots.lock().await.get(handle.group()).cloned() {
            let mut active = slot.lock().await;
            if active.as_ref().is_some_and(|h| h.id() == handle.id()) {
                *active = None;
            }
        }
        self.registry.prune(handle.group()).await;
    }

    /// Cancel every active run, e.g. on shutdown.
    pub async fn cancel_all(&self) {
        for handle in self.registry.active_runs().await {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_core::pipeline::ConcurrencyConfig;
    use sieve_core::ports::NullSink;
    use sieve_core::run::JobStatus;
    use sieve_core::trigger::ChangeSet;

    fn pipeline(cancel_in_progress: bool) -> PipelineDefinition {
        PipelineDefinition {
            name: "ci".to_string(),
            description: None,
            triggers: None,
            concurrency: Some(ConcurrencyConfig {
                group: "${{ workflow }}-${{ ref }}".to_string(),
                cancel_in_progress,
            }),
            env: Default::default(),
            categories: Default::default(),
            jobs: vec![],
        }
    }

    fn arbiter() -> ConcurrencyArbiter {
        ConcurrencyArbiter::new(
            Arc::new(GroupRegistry::new()),
            ArbiterConfig::default().with_grace_period(Duration::from_secs(5)),
            Arc::new(NullSink),
        )
    }

    struct BrokenSink;

    #[async_trait::async_trait]
    impl EventSink for BrokenSink {
        async fn publish(&self, _event: RunEvent) -> Result<()> {
            Err(sieve_core::Error::Internal("sink unavailable".into()))
        }
    }

    fn jobs() -> Vec<JobRecord> {
        vec![
            JobRecord::pending("build", ["compile"]),
            JobRecord::pending("test", ["unit"]),
        ]
    }

    fn push(branch: &str) -> TriggerEvent {
        TriggerEvent::push(branch, ChangeSet::new(["src/lib.rs"]))
    }

    #[test]
    fn test_group_key_uses_head_branch_for_pull_requests() {
        let def = pipeline(true);
        let pr = TriggerEvent::pull_request("feature/x", "main", ChangeSet::default());
        assert_eq!(ConcurrencyArbiter::group_key(&def, &pr), "ci-feature/x");
        assert_eq!(ConcurrencyArbiter::group_key(&def, &push("main")), "ci-main");
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_admit_cancels_running_jobs_first() {
        let arbiter = arbiter();
        let def = pipeline(true);

        let first = arbiter.admit(&def, push("main"), jobs()).await.unwrap();
        first.write().await.start_job("build");

        let second = arbiter.admit(&def, push("main"), jobs()).await.unwrap();

        let old = first.snapshot().await;
        assert_eq!(old.state, RunState::Cancelled);
        assert_eq!(old.status_of("build"), Some(JobStatus::Cancelled));
        assert_eq!(old.status_of("test"), Some(JobStatus::Cancelled));
        assert!(first.is_cancelled());

        let new = second.snapshot().await;
        assert!(new.is_active());
        assert_eq!(new.status_of("build"), Some(JobStatus::Pending));

        let active = arbiter.registry().active("ci-main").await.unwrap();
        assert_eq!(active.id(), second.id());
    }

    #[tokio::test]
    async fn test_cooperative_run_skips_grace_wait() {
        let arbiter = arbiter();
        let def = pipeline(true);
        let first = arbiter.admit(&def, push("main"), jobs()).await.unwrap();

        let watcher = first.clone();
        tokio::spawn(async move {
            watcher.cancel_token().cancelled().await;
            watcher.write().await.cancel_pending();
            watcher.mark_finished();
        });

        let started = tokio::time::Instant::now();
        arbiter.admit(&def, push("main"), jobs()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(first.snapshot().await.state, RunState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_request_supersedes_push_from_same_branch() {
        let arbiter = arbiter();
        let def = pipeline(true);
        let pushed = arbiter
            .admit(&def, push("refs/heads/feature"), jobs())
            .await
            .unwrap();
        assert_eq!(pushed.group(), "ci-feature");

        let pr = TriggerEvent::pull_request("feature", "main", ChangeSet::default());
        let opened = arbiter.admit(&def, pr, jobs()).await.unwrap();

        assert!(pushed.is_cancelled());
        assert_eq!(pushed.snapshot().await.state, RunState::Cancelled);
        assert_eq!(
            arbiter.registry().active("ci-feature").await.unwrap().id(),
            opened.id()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_keys_do_not_interfere() {
        let arbiter = arbiter();
        let def = pipeline(true);
        let main = arbiter.admit(&def, push("main"), jobs()).await.unwrap();
        let feature = arbiter.admit(&def, push("feature"), jobs()).await.unwrap();

        assert!(!main.is_cancelled());
        assert!(!feature.is_cancelled());
        assert_eq!(arbiter.registry().active_runs().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_admits_leave_one_active_run() {
        let arbiter = Arc::new(arbiter());
        let def = Arc::new(pipeline(true));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let arbiter = Arc::clone(&arbiter);
            let def = Arc::clone(&def);
            tasks.push(tokio::spawn(async move {
                arbiter.admit(&def, push("main"), jobs()).await.unwrap()
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        let mut active = 0;
        for handle in &handles {
            if handle.snapshot().await.is_active() {
                active += 1;
            }
        }
        assert_eq!(active, 1);

        let registered = arbiter.registry().active("ci-main").await.unwrap();
        assert!(registered.snapshot().await.is_active());
        assert_eq!(arbiter.registry().active_runs().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_cancel_in_progress_waits_for_previous() {
        let arbiter = Arc::new(arbiter());
        let def = Arc::new(pipeline(false));

        let first = arbiter.admit(&def, push("main"), jobs()).await.unwrap();

        let finisher = first.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            finisher.write().await.finish();
            finisher.mark_finished();
        });

        let started = tokio::time::Instant::now();
        let second = arbiter.admit(&def, push("main"), jobs()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(!first.is_cancelled());
        assert_eq!(first.snapshot().await.state, RunState::Completed);
        assert!(second.snapshot().await.is_active());
    }

    #[tokio::test]
    async fn test_release_archives_only_the_current_run() {
        let arbiter = arbiter();
        let def = pipeline(true);
        let first = arbiter.admit(&def, push("main"), jobs()).await.unwrap();
        first.mark_finished();
        arbiter.release(&first).await;
        assert!(arbiter.registry().active("ci-main").await.is_none());

        let second = arbiter.admit(&def, push("main"), jobs()).await.unwrap();
        arbiter.release(&first).await;
        assert_eq!(
            arbiter.registry().active("ci-main").await.unwrap().id(),
            second.id()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_does_not_orphan_the_group() {
        let arbiter = ConcurrencyArbiter::new(
            Arc::new(GroupRegistry::new()),
            ArbiterConfig::default().with_grace_period(Duration::from_secs(5)),
            Arc::new(BrokenSink),
        );
        let def = pipeline(false);

        let first = arbiter.admit(&def, push("main"), jobs()).await.unwrap();
        assert_eq!(
            arbiter.registry().active("ci-main").await.unwrap().id(),
            first.id()
        );
        first.write().await.finish();
        first.mark_finished();
        arbiter.release(&first).await;

        let second = tokio::time::timeout(
            Duration::from_secs(1),
            arbiter.admit(&def, push("main"), jobs()),
        )
        .await
        .expect("admit hung")
        .unwrap();
        assert!(second.snapshot().await.is_active());

        let third = arbiter
            .admit(&pipeline(true), push("main"), jobs())
            .await
            .unwrap();
        assert!(second.is_cancelled());
        assert_eq!(
            arbiter.registry().active("ci-main").await.unwrap().id(),
            third.id()
        );
    }
}
