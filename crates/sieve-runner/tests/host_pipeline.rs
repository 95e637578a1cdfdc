//! Pipelines executed on the host with real processes.

use pretty_assertions::assert_eq;
use sieve_core::pipeline::PipelineDefinition;
use sieve_core::run::{JobStatus, StepStatus};
use sieve_core::trigger::{ChangeSet, TriggerEvent};
use sieve_runner::{DefaultProbeFactory, RunnerConfig, ShellRunner};
use sieve_scheduler::sink::MemorySink;
use sieve_scheduler::{Coordinator, CoordinatorConfig, SchedulerConfig};
use std::sync::Arc;

const PIPELINE: &str = r#"
name: host
env:
  OUT: out.txt
categories:
  rust:
    files: ["src/**", "Cargo.toml"]
jobs:
  - name: prepare
    services:
      - name: marker
        probe: { type: command, run: "test -f ready", shell: sh }
        interval_secs: 1
        timeout_secs: 5
    steps:
      - { name: write, run: "echo prepared > $OUT", shell: sh }
  - name: build
    needs: [prepare]
    when: changed(rust)
    steps:
      - { name: check, run: "grep -q prepared $OUT && echo ok", shell: sh }
      - { name: fail, run: "echo broken >&2; exit 4", shell: sh }
      - { name: never, run: "touch never", shell: sh }
  - name: publish
    needs: [build]
    steps:
      - { name: upload, run: "touch published", shell: sh }
"#;

fn coordinator(workspace: &std::path::Path, sink: MemorySink) -> Coordinator {
    Coordinator::new(
        PipelineDefinition::from_yaml(PIPELINE).unwrap(),
        Arc::new(ShellRunner::new(RunnerConfig::default())),
        Arc::new(DefaultProbeFactory::new().with_workdir(workspace)),
        Arc::new(sink),
        CoordinatorConfig {
            scheduler: SchedulerConfig::default().with_workspace(workspace),
            ..Default::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_failure_blocks_dependents_on_the_host() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ready"), "").unwrap();
    let coordinator = coordinator(dir.path(), MemorySink::new());

    let event = TriggerEvent::push("refs/heads/main", ChangeSet::new(["src/lib.rs"]));
    let report = coordinator.handle(event).await.unwrap().unwrap();

    assert_eq!(report.status_of("prepare"), Some(JobStatus::Succeeded));
    assert_eq!(report.status_of("build"), Some(JobStatus::Failed));
    assert_eq!(report.status_of("publish"), Some(JobStatus::Blocked));
    assert_eq!(report.exit_code(), 1);

    let build = report.jobs.iter().find(|j| j.name == "build").unwrap();
    let statuses: Vec<_> = build.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![StepStatus::Succeeded, StepStatus::Failed, StepStatus::NotRun]
    );
    let failure = build.failure.as_ref().unwrap();
    assert_eq!(failure.step, "fail");
    assert_eq!(failure.output, "[stderr] broken");

    assert!(dir.path().join("out.txt").exists());
    assert!(!dir.path().join("never").exists());
    assert!(!dir.path().join("published").exists());
}

#[tokio::test]
async fn test_unrelated_change_skips_gated_job() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ready"), "").unwrap();
    let coordinator = coordinator(dir.path(), MemorySink::new());

    let event = TriggerEvent::push("refs/heads/main", ChangeSet::new(["docs/guide.md"]));
    let report = coordinator.handle(event).await.unwrap().unwrap();

    assert_eq!(report.status_of("prepare"), Some(JobStatus::Succeeded));
    assert_eq!(report.status_of("build"), Some(JobStatus::Skipped));
    assert_eq!(report.status_of("publish"), Some(JobStatus::Blocked));
    assert_eq!(report.exit_code(), 0);
}
