//! DAG resolution for pipeline jobs.

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use sieve_core::pipeline::{JobDefinition, PipelineDefinition};
use sieve_core::predicate::CompiledPredicate;
use sieve_core::run::JobRecord;
use sieve_core::{Error, Result};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// How a job depends on an upstream job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// `needs`: the upstream job must succeed.
    Required,
    /// `after`: the upstream job must only be terminal.
    Ordering,
}

/// A node in the job DAG.
#[derive(Debug, Clone)]
pub struct JobNode {
    /// Position in the pipeline file.
    pub index: usize,
    pub name: String,
    pub definition: JobDefinition,
    pub predicate: CompiledPredicate,
}

/// Directed acyclic graph of jobs, validated at load time.
#[derive(Debug, Clone)]
pub struct JobGraph {
    graph: DiGraph<JobNode, DependencyKind>,
    name_to_index: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl JobGraph {
    /// Build and validate the job graph of a pipeline.
    pub fn build(pipeline: &PipelineDefinition) -> Result<Self> {
        if pipeline.jobs.is_empty() {
            return Err(Error::EmptyPipeline);
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for (index, job) in pipeline.jobs.iter().enumerate() {
            if name_to_index.contains_key(&job.name) {
                return Err(Error::DuplicateJob(job.name.clone()));
            }
            let predicate = job.predicate()?.compile()?;
            if let Some(category) = predicate
                .source()
                .categories()
                .into_iter()
                .find(|c| !pipeline.categories.contains_key(*c))
            {
                return Err(Error::UnknownCategory {
                    job: job.name.clone(),
                    category: category.to_string(),
                });
            }

            if let Some(service) = job.services.iter().find(|s| s.interval_secs == 0) {
                return Err(Error::InvalidPipeline(format!(
                    "Service `{}` of job `{}` must have a non-zero interval_secs",
                    service.name, job.name
                )));
            }

            let idx = graph.add_node(JobNode {
                index,
                name: job.name.clone(),
                definition: job.clone(),
                predicate,
            });
            name_to_index.insert(job.name.clone(), idx);
        }

        for job in &pipeline.jobs {
            let job_idx = name_to_index[&job.name];
            let edges = job
                .after
                .iter()
                .map(|dep| (dep, DependencyKind::Ordering))
                .chain(job.needs.iter().map(|dep| (dep, DependencyKind::Required)));
            for (dep, kind) in edges {
                let dep_idx =
                    *name_to_index
                        .get(dep)
                        .ok_or_else(|| Error::UnknownDependency {
                            job: job.name.clone(),
                            dependency: dep.clone(),
                        })?;
                // A job listed in both `needs` and `after` is required.
                graph.update_edge(dep_idx, job_idx, kind);
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(Error::CyclicDependency { jobs: cycle });
        }

        let order = stable_toposort(&graph);
        Ok(Self {
            graph,
            name_to_index,
            order,
        })
    }

    pub fn get(&self, name: &str) -> Option<&JobNode> {
        self.name_to_index
            .get(name)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Jobs in dependency order, ties broken by declaration order.
    pub fn topological_order(&self) -> Vec<&JobNode> {
        self.order.iter().map(|&idx| &self.graph[idx]).collect()
    }

    /// Fresh records for a new run, in topological order.
    pub fn pending_records(&self) -> Vec<JobRecord> {
        self.topological_order()
            .into_iter()
            .map(|node| {
                JobRecord::pending(
                    node.name.clone(),
                    node.definition.steps.iter().map(|s| s.name.clone()),
                )
            })
            .collect()
    }

    /// Jobs without upstream dependencies.
    pub fn roots(&self) -> Vec<&JobNode> {
        self.topological_order()
            .into_iter()
            .filter(|node| {
                let idx = self.name_to_index[&node.name];
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// Upstream jobs with the kind of each dependency.
    pub fn dependencies(&self, name: &str) -> Vec<(&JobNode, DependencyKind)> {
        self.adjacent(name, Direction::Incoming)
    }

    /// Upstream jobs that must succeed.
    pub fn required_dependencies(&self, name: &str) -> Vec<&JobNode> {
        self.dependencies(name)
            .into_iter()
            .filter(|(_, kind)| *kind == DependencyKind::Required)
            .map(|(node, _)| node)
            .collect()
    }

    /// Downstream jobs.
    pub fn dependents(&self, name: &str) -> Vec<&JobNode> {
        self.adjacent(name, Direction::Outgoing)
            .into_iter()
            .map(|(node, _)| node)
            .collect()
    }

    fn adjacent(&self, name: &str, direction: Direction) -> Vec<(&JobNode, DependencyKind)> {
        let Some(&idx) = self.name_to_index.get(name) else {
            return Vec::new();
        };
        let mut out: Vec<_> = self
            .graph
            .edges_directed(idx, direction)
            .map(|edge| {
                let other = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                (&self.graph[other], *edge.weight())
            })
            .collect();
        out.sort_by_key(|(node, _)| node.index);
        out
    }
}

/// Kahn's algorithm, always taking the earliest-declared ready job.
fn stable_toposort(graph: &DiGraph<JobNode, DependencyKind>) -> Vec<NodeIndex> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| {
            (
                idx,
                graph.neighbors_directed(idx, Direction::Incoming).count(),
            )
        })
        .collect();

    let mut ready: BinaryHeap<Reverse<(usize, NodeIndex)>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(&idx, _)| Reverse((graph[idx].index, idx)))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((_, idx))) = ready.pop() {
        order.push(idx);
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((graph[next].index, next)));
                }
            }
        }
    }
    order
}

/// Names of the jobs on one dependency cycle, first job repeated at the end.
fn find_cycle(graph: &DiGraph<JobNode, DependencyKind>) -> Option<Vec<String>> {
    let mut cyclic: Vec<Vec<NodeIndex>> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .collect();
    if cyclic.is_empty() {
        return None;
    }
    // Report the cycle containing the earliest-declared job.
    cyclic.sort_by_key(|scc| scc.iter().map(|&idx| graph[idx].index).min());
    let members: HashSet<NodeIndex> = cyclic[0].iter().copied().collect();
    let start = *cyclic[0].iter().min_by_key(|&&idx| graph[idx].index)?;

    let mut path = vec![start];
    let mut visited = HashSet::from([start]);
    if walk_back(graph, &members, start, &mut path, &mut visited) {
        Some(path.iter().map(|&idx| graph[idx].name.clone()).collect())
    } else {
        None
    }
}

fn walk_back(
    graph: &DiGraph<JobNode, DependencyKind>,
    members: &HashSet<NodeIndex>,
    start: NodeIndex,
    path: &mut Vec<NodeIndex>,
    visited: &mut HashSet<NodeIndex>,
) -> bool {
    let Some(&current) = path.last() else {
        return false;
    };
    let mut next: Vec<NodeIndex> = graph
        .neighbors_directed(current, Direction::Outgoing)
        .filter(|n| members.contains(n))
        .collect();
    next.sort_by_key(|&idx| graph[idx].index);

    for n in next {
        if n == start {
            path.push(n);
            return true;
        }
        if visited.insert(n) {
            path.push(n);
            if walk_back(graph, members, start, path, visited) {
                return true;
            }
            path.pop();
        }
    }
    false
}
