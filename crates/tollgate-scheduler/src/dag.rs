//! Job graph: dependency resolution and scheduling state for one run.

use crate::matrix::MatrixExpander;
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tollgate_core::ids::JobId;
use tollgate_core::run::{JobInstance, JobOutcome, JobReport, JobState};
use tollgate_core::workflow::{JobTemplate, WorkflowError, render_value};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error(transparent)]
    Structure(#[from] WorkflowError),
    #[error("Unknown job instance: {0}")]
    UnknownJob(JobId),
    #[error("Job instance {id} already finished as {state}")]
    AlreadyTerminal { id: JobId, state: JobState },
    #[error("Job instance {id} is {state}; cannot record {outcome}")]
    InvalidTransition {
        id: JobId,
        state: JobState,
        outcome: JobState,
    },
}

/// A job instance together with its scheduling state.
#[derive(Debug, Clone)]
pub struct JobNode {
    pub instance: JobInstance,
    pub state: JobState,
    pub reason: Option<String>,
}

/// Directed acyclic graph of job instances. Edges run from every instance of
/// a needed template to every instance of the needing template.
#[derive(Debug)]
pub struct JobGraph {
    graph: DiGraph<JobNode, ()>,
    by_id: HashMap<JobId, NodeIndex>,
    by_template: HashMap<String, Vec<NodeIndex>>,
    /// Template declaration order, then matrix order.
    order: Vec<NodeIndex>,
}

impl JobGraph {
    /// Validate the `needs` relation and materialize every template's
    /// instances.
    ///
    /// A template whose matrix has an empty axis contributes a single
    /// instance that is already `failed`, so its dependents are skipped.
    pub fn build(templates: &[JobTemplate]) -> Result<Self, GraphError> {
        if templates.is_empty() {
            return Err(WorkflowError::NoJobs.into());
        }
        check_needs(templates)?;

        let expander = MatrixExpander::new();
        let mut graph = DiGraph::new();
        let mut by_id = HashMap::new();
        let mut by_template: HashMap<String, Vec<NodeIndex>> = HashMap::new();
        let mut order = Vec::new();
        let mut failed_closed = Vec::new();

        for template in templates {
            let nodes = match expander.expand_template(template) {
                Ok(instances) => instances
                    .into_iter()
                    .map(|instance| JobNode {
                        instance,
                        state: JobState::Pending,
                        reason: None,
                    })
                    .collect(),
                Err(err) => {
                    warn!(template = %template.name, error = %err, "Matrix expansion failed");
                    vec![JobNode {
                        instance: JobInstance {
                            id: JobId::new(),
                            template: template.name.clone(),
                            index: 0,
                            matrix: vec![],
                            display_name: template.name.clone(),
                        },
                        state: JobState::Failed,
                        reason: Some(err.to_string()),
                    }]
                }
            };

            for node in nodes {
                let id = node.instance.id;
                let is_failed = node.state == JobState::Failed;
                let idx = graph.add_node(node);
                by_id.insert(id, idx);
                by_template
                    .entry(template.name.clone())
                    .or_default()
                    .push(idx);
                order.push(idx);
                if is_failed {
                    failed_closed.push(idx);
                }
            }
        }

        // Fan-in edges: all dependency instances -> all dependent instances
        for template in templates {
            let targets = by_template[&template.name].clone();
            for dep in &template.needs {
                for &from in &by_template[dep] {
                    for &to in &targets {
                        graph.add_edge(from, to, ());
                    }
                }
            }
        }

        let mut dag = JobGraph {
            graph,
            by_id,
            by_template,
            order,
        };
        for idx in failed_closed {
            dag.propagate(idx);
        }
        Ok(dag)
    }

    /// Pending instances whose every predecessor has succeeded.
    pub fn ready(&self) -> Vec<&JobInstance> {
        self.order
            .iter()
            .filter(|&&idx| {
                self.graph[idx].state == JobState::Pending
                    && self
                        .graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .all(|pred| self.graph[pred].state == JobState::Succeeded)
            })
            .map(|&idx| &self.graph[idx].instance)
            .collect()
    }

    /// Mark a ready instance as running.
    pub fn start(&mut self, id: JobId) -> Result<(), GraphError> {
        let idx = self.index(id)?;
        let node = &mut self.graph[idx];
        match node.state {
            JobState::Pending => {
                node.state = JobState::Running;
                Ok(())
            }
            state if state.is_terminal() => Err(GraphError::AlreadyTerminal { id, state }),
            state => Err(GraphError::InvalidTransition {
                id,
                state,
                outcome: JobState::Running,
            }),
        }
    }

    /// Record a terminal outcome and propagate it to dependents.
    ///
    /// Any outcome other than success marks every pending direct and
    /// transitive dependent `skipped`; the newly skipped ids are returned.
    pub fn advance(&mut self, id: JobId, outcome: JobOutcome) -> Result<Vec<JobId>, GraphError> {
        let idx = self.index(id)?;
        let state = self.graph[idx].state;
        let target = outcome.state();

        if state.is_terminal() {
            return Err(GraphError::AlreadyTerminal { id, state });
        }
        if matches!(target, JobState::Succeeded | JobState::Failed) && state != JobState::Running {
            return Err(GraphError::InvalidTransition {
                id,
                state,
                outcome: target,
            });
        }

        let node = &mut self.graph[idx];
        node.state = target;
        node.reason = outcome.reason().map(str::to_string);
        debug!(job = %node.instance.display_name, state = %target, "Job instance finished");

        if target == JobState::Succeeded {
            return Ok(vec![]);
        }
        Ok(self.propagate(idx))
    }

    /// Cancel one instance; its pending dependents are skipped.
    pub fn cancel(&mut self, id: JobId, reason: &str) -> Result<Vec<JobId>, GraphError> {
        self.advance(id, JobOutcome::Cancelled(reason.to_string()))
    }

    /// Cancel every non-terminal instance. Finished instances keep their state.
    pub fn cancel_all(&mut self, reason: &str) -> Vec<JobId> {
        let mut cancelled = Vec::new();
        for &idx in &self.order {
            let node = &mut self.graph[idx];
            if !node.state.is_terminal() {
                node.state = JobState::Cancelled;
                node.reason = Some(reason.to_string());
                cancelled.push(node.instance.id);
            }
        }
        cancelled
    }

    fn propagate(&mut self, origin: NodeIndex) -> Vec<JobId> {
        let cause = format!(
            "upstream job '{}' {}",
            self.graph[origin].instance.display_name, self.graph[origin].state
        );
        let mut skipped = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .neighbors_directed(origin, Direction::Outgoing)
            .collect();

        while let Some(idx) = queue.pop_front() {
            if !seen.insert(idx) {
                continue;
            }
            let node = &mut self.graph[idx];
            if node.state != JobState::Pending {
                continue;
            }
            node.state = JobState::Skipped;
            node.reason = Some(cause.clone());
            skipped.push(node.instance.id);
            queue.extend(self.graph.neighbors_directed(idx, Direction::Outgoing));
        }

        if !skipped.is_empty() {
            debug!(cause = %cause, count = skipped.len(), "Skipped dependents");
        }
        skipped
    }

    pub fn is_complete(&self) -> bool {
        self.order
            .iter()
            .all(|&idx| self.graph[idx].state.is_terminal())
    }

    pub fn node(&self, id: JobId) -> Option<&JobNode> {
        self.by_id.get(&id).map(|&idx| &self.graph[idx])
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.node(id).map(|n| n.state)
    }

    /// Instances in report order.
    pub fn instances(&self) -> Vec<&JobNode> {
        self.order.iter().map(|&idx| &self.graph[idx]).collect()
    }

    pub fn instances_of(&self, template: &str) -> Vec<&JobNode> {
        self.by_template
            .get(template)
            .map(|nodes| nodes.iter().map(|&idx| &self.graph[idx]).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn report(&self) -> Vec<JobReport> {
        self.instances()
            .into_iter()
            .map(|node| JobReport {
                id: node.instance.id,
                template: node.instance.template.clone(),
                display_name: node.instance.display_name.clone(),
                matrix: node
                    .instance
                    .matrix
                    .iter()
                    .map(|(k, v)| (k.clone(), render_value(v)))
                    .collect(),
                state: node.state,
                reason: node.reason.clone(),
            })
            .collect()
    }

    fn index(&self, id: JobId) -> Result<NodeIndex, GraphError> {
        self.by_id
            .get(&id)
            .copied()
            .ok_or(GraphError::UnknownJob(id))
    }
}

/// Check that `needs` resolve and contain no cycle, reporting the first
/// cycle found in declaration order as a closed path of template names.
fn check_needs(templates: &[JobTemplate]) -> Result<(), WorkflowError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index = HashMap::new();

    for template in templates {
        if index.contains_key(template.name.as_str()) {
            return Err(WorkflowError::DuplicateJob(template.name.clone()));
        }
        index.insert(template.name.as_str(), graph.add_node(template.name.as_str()));
    }

    for template in templates {
        let to = index[template.name.as_str()];
        for dep in &template.needs {
            let from = index
                .get(dep.as_str())
                .ok_or_else(|| WorkflowError::UnknownNeeds {
                    job: template.name.clone(),
                    needs: dep.clone(),
                })?;
            graph.add_edge(*from, to, ());
        }
    }

    let cyclic: Vec<HashSet<NodeIndex>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|scc| scc.into_iter().collect())
        .collect();

    for template in templates {
        let start = index[template.name.as_str()];
        if let Some(members) = cyclic.iter().find(|scc| scc.contains(&start)) {
            let path = trace_cycle(&graph, start, members);
            return Err(WorkflowError::Cycle(
                path.into_iter().map(|idx| graph[idx].to_string()).collect(),
            ));
        }
    }

    Ok(())
}

/// Shortest path from `start` back to itself within one strongly connected
/// component.
fn trace_cycle(
    graph: &DiGraph<&str, ()>,
    start: NodeIndex,
    members: &HashSet<NodeIndex>,
) -> Vec<NodeIndex> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(current) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = graph
            .neighbors_directed(current, Direction::Outgoing)
            .filter(|n| members.contains(n))
            .collect();
        next.sort();
        for n in next {
            if n == start {
                let mut inner = Vec::new();
                let mut at = current;
                while at != start {
                    inner.push(at);
                    at = parent[&at];
                }
                inner.reverse();

                let mut path = Vec::with_capacity(inner.len() + 2);
                path.push(start);
                path.extend(inner);
                path.push(start);
                return path;
            }
            if !parent.contains_key(&n) {
                parent.insert(n, current);
                queue.push_back(n);
            }
        }
    }

    vec![start, start]
}
