//! Shared test doubles for scheduler integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use sieve_core::pipeline::{PipelineDefinition, ProbeDefinition};
use sieve_core::ports::{HealthProbe, ProbeFactory, StepContext, StepExecutor, StepOutcome};
use sieve_core::{Error, Result};
use sieve_scheduler::sink::MemorySink;
use sieve_scheduler::{Coordinator, CoordinatorConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Executes steps by looking up their `run` script: exit code and delay.
#[derive(Default)]
pub struct ScriptedExecutor {
    exit_codes: HashMap<String, i32>,
    delays: HashMap<String, Duration>,
    executed: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, script: &str, exit_code: i32) -> Self {
        self.exit_codes.insert(script.to_string(), exit_code);
        self
    }

    pub fn delay(mut self, script: &str, delay: Duration) -> Self {
        self.delays.insert(script.to_string(), delay);
        self
    }

    /// `job/step` for every step started, in start order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn ran_job(&self, job: &str) -> bool {
        self.executed()
            .iter()
            .any(|s| s.starts_with(&format!("{job}/")))
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn run(&self, ctx: StepContext, cancel: CancellationToken) -> Result<StepOutcome> {
        self.executed
            .lock()
            .unwrap()
            .push(format!("{}/{}", ctx.job, ctx.step.name));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .delays
            .get(&ctx.step.run)
            .copied()
            .unwrap_or(Duration::from_millis(1));
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);

        let exit_code = if cancelled {
            -1
        } else {
            self.exit_codes.get(&ctx.step.run).copied().unwrap_or(0)
        };
        Ok(StepOutcome {
            exit_code,
            output: format!("output of {}", ctx.step.run),
            duration_ms: delay.as_millis() as u64,
            cancelled,
            timed_out: false,
        })
    }
}

/// Healthy from the `healthy_on`-th check; 0 means never.
pub struct CountingProbe {
    pub checks: Arc<AtomicU32>,
    healthy_on: u32,
}

#[async_trait]
impl HealthProbe for CountingProbe {
    async fn check(&self) -> Result<()> {
        let n = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        if self.healthy_on != 0 && n >= self.healthy_on {
            Ok(())
        } else {
            Err(Error::ProbeFailed("connection refused".into()))
        }
    }
}

pub struct CountingProbes {
    pub checks: Arc<AtomicU32>,
    healthy_on: u32,
}

impl CountingProbes {
    pub fn healthy_on(healthy_on: u32) -> Self {
        Self {
            checks: Arc::new(AtomicU32::new(0)),
            healthy_on,
        }
    }
}

impl ProbeFactory for CountingProbes {
    fn build(&self, _definition: &ProbeDefinition) -> Result<Arc<dyn HealthProbe>> {
        Ok(Arc::new(CountingProbe {
            checks: Arc::clone(&self.checks),
            healthy_on: self.healthy_on,
        }))
    }
}

pub const CI_PIPELINE: &str = r#"
name: ci
categories:
  non-js:
    ignore: ["app/**", "tests/**", "package.json"]
  non-rust:
    ignore: ["src/**", "migrations/**", "Cargo.toml", "Cargo.lock"]
jobs:
  - name: backend-lint
    when: changed(non-js)
    steps:
      - { name: clippy, run: clippy }
  - name: backend-test
    when: changed(non-js)
    steps:
      - { name: test, run: cargo-test }
  - name: frontend-lint
    when: changed(non-rust)
    steps:
      - { name: eslint, run: eslint }
  - name: frontend-test
    when: "changed(non-rust) || (event == pull_request && branch == main)"
    steps:
      - { name: ember, run: ember-test }
"#;

pub fn pipeline(yaml: &str) -> PipelineDefinition {
    PipelineDefinition::from_yaml(yaml).unwrap()
}

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub executor: Arc<ScriptedExecutor>,
    pub probes: Arc<CountingProbes>,
    pub sink: MemorySink,
}

pub fn harness(yaml: &str, executor: ScriptedExecutor) -> Harness {
    harness_with(yaml, executor, CountingProbes::healthy_on(1), CoordinatorConfig::default())
}

pub fn harness_with(
    yaml: &str,
    executor: ScriptedExecutor,
    probes: CountingProbes,
    config: CoordinatorConfig,
) -> Harness {
    let executor = Arc::new(executor);
    let probes = Arc::new(probes);
    let sink = MemorySink::new();
    let coordinator = Coordinator::new(
        pipeline(yaml),
        Arc::clone(&executor) as Arc<dyn StepExecutor>,
        Arc::clone(&probes) as Arc<dyn ProbeFactory>,
        Arc::new(sink.clone()),
        config,
    )
    .unwrap();
    Harness {
        coordinator: Arc::new(coordinator),
        executor,
        probes,
        sink,
    }
}

/// Poll a condition until it holds or the timeout passes.
pub async fn wait_for<F>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}
