//! Dry-run planning: which jobs an event would run, skip or block.

use crate::dag::JobGraph;
use serde::Serialize;
use sieve_core::predicate::EvaluationContext;
use sieve_core::run::CategoryFlags;
use sieve_core::trigger::TriggerEvent;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Run,
    Skip,
    /// A required dependency is predicted not to succeed.
    Block { by: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedJob {
    pub name: String,
    pub predicate: String,
    #[serde(flatten)]
    pub decision: Decision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    pub triggered: bool,
    pub group: String,
    pub categories: CategoryFlags,
    pub jobs: Vec<PlannedJob>,
}

impl RunPlan {
    pub fn decision_of(&self, name: &str) -> Option<&Decision> {
        self.jobs.iter().find(|j| j.name == name).map(|j| &j.decision)
    }
}

/// Predict each job's outcome, assuming every job that runs succeeds.
pub fn plan_jobs(graph: &JobGraph, categories: &CategoryFlags, event: &TriggerEvent) -> Vec<PlannedJob> {
    let target_branch = event.target_branch();
    let ctx = EvaluationContext {
        categories,
        event: event.kind,
        target_branch,
    };

    let mut decided: HashMap<&str, bool> = HashMap::new();
    let mut planned = Vec::with_capacity(graph.len());
    for node in graph.topological_order() {
        let decision = if !node.predicate.evaluate(&ctx) {
            Decision::Skip
        } else {
            let by: Vec<String> = graph
                .required_dependencies(&node.name)
                .into_iter()
                .filter(|dep| !decided.get(dep.name.as_str()).copied().unwrap_or(false))
                .map(|dep| dep.name.clone())
                .collect();
            if by.is_empty() {
                Decision::Run
            } else {
                Decision::Block { by }
            }
        };
        decided.insert(node.name.as_str(), decision == Decision::Run);
        planned.push(PlannedJob {
            name: node.name.clone(),
            predicate: node.predicate.to_string(),
            decision,
        });
    }
    planned
}
