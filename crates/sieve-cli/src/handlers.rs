//! Command handlers.

use crate::commands::{EventArgs, RunArgs};
use crate::config::{CliConfig, OutputFormat};
use crate::output::{emit, render_plan, render_report};
use anyhow::{Context, Result};
use console::style;
use sieve_core::pipeline::PipelineDefinition;
use sieve_core::ports::NullSink;
use sieve_core::run::RunReport;
use sieve_core::trigger::TriggerEvent;
use sieve_runner::{DefaultProbeFactory, ShellRunner};
use sieve_scheduler::sink::TracingSink;
use sieve_scheduler::{Coordinator, CoordinatorConfig, JobGraph, PathClassifier};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

fn load_pipeline(path: &Path) -> Result<PipelineDefinition> {
    PipelineDefinition::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn build_coordinator(
    config: &CliConfig,
    pipeline: PipelineDefinition,
    workspace: &Path,
    max_parallel_jobs: Option<usize>,
    quiet: bool,
) -> Result<Coordinator> {
    let mut scheduler = config.scheduler_config(workspace);
    if let Some(jobs) = max_parallel_jobs {
        scheduler = scheduler.with_max_parallel_jobs(jobs);
    }
    let sink: Arc<dyn sieve_core::ports::EventSink> = if quiet {
        Arc::new(NullSink)
    } else {
        Arc::new(TracingSink)
    };
    let coordinator = Coordinator::new(
        pipeline,
        Arc::new(ShellRunner::new(config.runner_config())),
        Arc::new(DefaultProbeFactory::new().with_workdir(workspace)),
        sink,
        CoordinatorConfig {
            scheduler,
            arbiter: config.arbiter_config(),
        },
    )?;
    Ok(coordinator)
}

/// Cancel every active run on Ctrl-C.
fn cancel_on_ctrl_c(coordinator: &Arc<Coordinator>) {
    let coordinator = Arc::clone(coordinator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling active runs");
            coordinator.cancel_all().await;
        }
    });
}

/// Validate a pipeline definition.
pub fn validate(path: &Path) -> Result<()> {
    let pipeline = load_pipeline(path)?;
    let graph = JobGraph::build(&pipeline)?;
    PathClassifier::new(&pipeline.categories)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        pipeline.name
    );
    println!("  Categories: {}", pipeline.categories.len());
    for name in pipeline.categories.keys() {
        println!("    - {name}");
    }
    println!("  Jobs: {}", graph.len());
    for node in graph.topological_order() {
        let deps: Vec<String> = graph
            .dependencies(&node.name)
            .into_iter()
            .map(|(dep, _)| dep.name.clone())
            .collect();
        let mut line = format!("    - {} ({} steps, when {})", node.name, node.definition.steps.len(), node.predicate);
        if !deps.is_empty() {
            line.push_str(&format!(" after {}", deps.join(", ")));
        }
        println!("{line}");
    }
    Ok(())
}

/// Show what an event would do without running anything.
pub fn plan(config: &CliConfig, path: &Path, event: EventArgs, format: Option<OutputFormat>) -> Result<()> {
    let pipeline = load_pipeline(path)?;
    let coordinator = build_coordinator(config, pipeline, Path::new("."), None, true)?;
    let event = event.into_event()?;
    let plan = coordinator.plan(&event);
    emit(&plan, format.unwrap_or(config.output_format), render_plan)
}

/// Run the pipeline once on this host.
pub async fn run(config: &CliConfig, path: &Path, event: EventArgs, args: RunArgs) -> Result<ExitCode> {
    let pipeline = load_pipeline(path)?;
    let event = event.into_event()?;
    let format = args.format.unwrap_or(config.output_format);
    let coordinator = Arc::new(build_coordinator(
        config,
        pipeline,
        &args.workspace,
        args.max_parallel_jobs,
        false,
    )?);
    cancel_on_ctrl_c(&coordinator);

    match coordinator.handle(event).await? {
        Some(report) => {
            emit(&report, format, render_report)?;
            Ok(exit_code(&report))
        }
        None => {
            println!("{} Event does not trigger this pipeline", style("i").blue());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run the pipeline for every event on stdin. Events for the same
/// concurrency group supersede each other.
pub async fn listen(config: &CliConfig, path: &Path, args: RunArgs) -> Result<ExitCode> {
    let pipeline = load_pipeline(path)?;
    let format = args.format.unwrap_or(config.output_format);
    let coordinator = Arc::new(build_coordinator(
        config,
        pipeline,
        &args.workspace,
        args.max_parallel_jobs,
        false,
    )?);
    cancel_on_ctrl_c(&coordinator);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut runs: JoinSet<sieve_core::Result<Option<RunReport>>> = JoinSet::new();
    let mut failed = false;
    let mut open = true;

    info!(pipeline = %coordinator.pipeline().name, "Listening for events on stdin");
    while open || !runs.is_empty() {
        tokio::select! {
            line = lines.next_line(), if open => match line.context("reading stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<TriggerEvent>(&line) {
                    Ok(event) => {
                        info!(event_id = %event.id, kind = %event.kind, git_ref = %event.git_ref, "Event received");
                        let coordinator = Arc::clone(&coordinator);
                        runs.spawn(async move { coordinator.handle(event).await });
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed event"),
                },
                None => open = false,
            },
            Some(joined) = runs.join_next(), if !runs.is_empty() => match joined {
                Ok(Ok(Some(report))) => {
                    failed |= !report.succeeded();
                    emit(&report, format, render_report)?;
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    failed = true;
                    error!(error = %e, "Run failed to execute");
                }
                Err(e) => {
                    failed = true;
                    error!(error = %e, "Run task aborted");
                }
            },
        }
    }

    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

/// Print the pipeline JSON Schema.
pub fn schema() -> Result<()> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> Result<()> {
    println!("Current configuration:");
    print!("{}", serde_yaml::to_string(config)?);
    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }
    Ok(())
}

/// Set a configuration value.
pub fn set_config(key: &str, value: &str) -> Result<()> {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    let path = config.save()?;
    println!("{} Set {} = {} ({})", style("✓").green(), key, value, path.display());
    Ok(())
}

fn exit_code(report: &RunReport) -> ExitCode {
    ExitCode::from(report.exit_code() as u8)
}
