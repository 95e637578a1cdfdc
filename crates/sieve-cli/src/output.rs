//! Terminal rendering of plans and run reports.

use crate::config::OutputFormat;
use anyhow::Result;
use console::style;
use serde::Serialize;
use sieve_core::run::{CategoryFlags, JobRecord, JobStatus, RunReport, RunState};
use sieve_scheduler::plan::{Decision, RunPlan};
use std::fmt::Write;

/// Print any serializable value in a machine format, or `table` via the
/// given renderer.
pub fn emit<T: Serialize>(value: &T, format: OutputFormat, table: impl FnOnce(&T) -> String) -> Result<()> {
    match format {
        OutputFormat::Table => print!("{}", table(value)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

pub fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    let state = match report.state {
        RunState::Completed if report.succeeded() => style("passed").green(),
        RunState::Completed => style("failed").red(),
        RunState::Cancelled => style("cancelled").yellow(),
        RunState::Active => style("active").cyan(),
    };
    let _ = writeln!(
        out,
        "{} {} ({}) {}",
        style("▶").cyan(),
        style(&report.pipeline).bold(),
        style(&report.group).dim(),
        state
    );
    let _ = writeln!(out, "  categories: {}", render_categories(&report.categories));

    let width = report.jobs.iter().map(|j| j.name.len()).max().unwrap_or(0);
    for job in &report.jobs {
        let _ = writeln!(out, "  {} {:width$}  {}", status_mark(job.status), job.name, describe(job));
    }

    if let Some(ms) = report.duration_ms {
        let summary: Vec<String> = report
            .summary()
            .into_iter()
            .map(|(status, n)| format!("{n} {status}"))
            .collect();
        let _ = writeln!(out, "  {} in {:.1}s", summary.join(", "), ms as f64 / 1000.0);
    }

    for job in report.failed_jobs() {
        if let Some(failure) = &job.failure {
            let _ = writeln!(
                out,
                "\n{} {} / {}: {}",
                style("✗").red(),
                style(&job.name).bold(),
                failure.step,
                failure.message
            );
            for line in failure.output.lines() {
                let _ = writeln!(out, "    {}", style(line).dim());
            }
        }
    }
    out
}

pub fn render_plan(plan: &RunPlan) -> String {
    let mut out = String::new();
    if !plan.triggered {
        let _ = writeln!(out, "{} Event does not trigger this pipeline", style("i").blue());
    }
    let _ = writeln!(out, "group: {}", style(&plan.group).bold());
    let _ = writeln!(out, "categories: {}", render_categories(&plan.categories));

    let width = plan.jobs.iter().map(|j| j.name.len()).max().unwrap_or(0);
    for job in &plan.jobs {
        let decision = match &job.decision {
            Decision::Run => style("run".to_string()).green(),
            Decision::Skip => style("skip".to_string()).dim(),
            Decision::Block { by } => style(format!("blocked by {}", by.join(", "))).yellow(),
        };
        let _ = writeln!(
            out,
            "  {:width$}  {}  {}",
            job.name,
            decision,
            style(format!("when {}", job.predicate)).dim()
        );
    }
    out
}

fn render_categories(categories: &CategoryFlags) -> String {
    if categories.is_empty() {
        return "none".to_string();
    }
    categories
        .iter()
        .map(|(name, relevant)| {
            if relevant {
                style(format!("+{name}")).green().to_string()
            } else {
                style(format!("-{name}")).dim().to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn status_mark(status: JobStatus) -> console::StyledObject<&'static str> {
    match status {
        JobStatus::Succeeded => style("✓").green(),
        JobStatus::Failed => style("✗").red(),
        JobStatus::Skipped => style("-").dim(),
        JobStatus::Blocked => style("!").yellow(),
        JobStatus::Cancelled => style("⊘").yellow(),
        JobStatus::Pending | JobStatus::Running => style("…").cyan(),
    }
}

fn describe(job: &JobRecord) -> String {
    match job.status {
        JobStatus::Blocked if !job.blocked_by.is_empty() => {
            format!("blocked by {}", job.blocked_by.join(", "))
        }
        JobStatus::Succeeded | JobStatus::Failed => match job.duration_ms {
            Some(ms) => format!("{} ({:.1}s)", job.status, ms as f64 / 1000.0),
            None => job.status.to_string(),
        },
        status => status.to_string(),
    }
}
