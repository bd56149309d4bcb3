// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::dag::task::TaskDefinition;
use crate::dag::{GraphId, TaskName};
use crate::errors::{Result, TickdagError};
use crate::schedule::Schedule;

/// Immutable DAG of task definitions plus the schedule it runs on.
///
/// Built once through [`TaskGraph::build`], which validates every edge and
/// rejects cycles. There is no way to mutate a graph afterwards; a changed
/// DAG is a new `TaskGraph`. Runs share it read-only behind an `Arc`.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    id: GraphId,
    schedule: Schedule,
    tasks: BTreeMap<TaskName, TaskDefinition>,
    /// Reverse edges: task -> tasks that list it as upstream.
    downstream: BTreeMap<TaskName, BTreeSet<TaskName>>,
    order: Vec<TaskName>,
}

impl TaskGraph {
    /// Validate `definitions` and build the graph.
    ///
    /// - empty definition set, duplicate ids and unknown upstream ids are
    ///   [`TickdagError::ConfigError`]s;
    /// - a dependency cycle (self-dependencies included) is
    ///   [`TickdagError::DagCycle`].
    pub fn build(
        id: impl Into<GraphId>,
        schedule: Schedule,
        definitions: impl IntoIterator<Item = TaskDefinition>,
    ) -> Result<Self> {
        let id = id.into();

        let mut tasks: BTreeMap<TaskName, TaskDefinition> = BTreeMap::new();
        for def in definitions {
            let name = def.id().to_string();
            if tasks.insert(name.clone(), def).is_some() {
                return Err(TickdagError::ConfigError(format!(
                    "dag '{id}' defines task '{name}' more than once"
                )));
            }
        }

        if tasks.is_empty() {
            return Err(TickdagError::ConfigError(format!(
                "dag '{id}' must contain at least one task"
            )));
        }

        for (name, def) in tasks.iter() {
            for dep in def.upstream() {
                if !tasks.contains_key(dep) {
                    return Err(TickdagError::ConfigError(format!(
                        "task '{name}' in dag '{id}' has unknown dependency '{dep}'"
                    )));
                }
            }
        }

        let order = topological_order(
            &id,
            tasks
                .iter()
                .map(|(name, def)| (name.as_str(), def.upstream().iter().map(String::as_str))),
        )?;

        let mut downstream: BTreeMap<TaskName, BTreeSet<TaskName>> = tasks
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();
        for (name, def) in tasks.iter() {
            for dep in def.upstream() {
                if let Some(set) = downstream.get_mut(dep) {
                    set.insert(name.clone());
                }
            }
        }

        debug!(graph = %id, tasks = tasks.len(), ?order, "built task graph");

        Ok(Self {
            id,
            schedule,
            tasks,
            downstream,
            order,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// All task definitions, ordered by id.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.values()
    }

    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.get(id)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks `id` waits for. Empty for unknown ids.
    pub fn upstreams_of(&self, id: &str) -> BTreeSet<TaskName> {
        self.tasks
            .get(id)
            .map(|def| def.upstream().clone())
            .unwrap_or_default()
    }

    /// Tasks that wait for `id`. Empty for unknown ids.
    pub fn downstreams_of(&self, id: &str) -> BTreeSet<TaskName> {
        self.downstream.get(id).cloned().unwrap_or_default()
    }

    /// Tasks without upstream dependencies.
    pub fn root_tasks(&self) -> BTreeSet<TaskName> {
        self.tasks
            .values()
            .filter(|def| def.upstream().is_empty())
            .map(|def| def.id().to_string())
            .collect()
    }

    /// One valid execution order: every task appears after its upstreams.
    pub fn topological_order(&self) -> &[TaskName] {
        &self.order
    }
}

/// Topologically sort `nodes` (name, upstream names), failing with
/// [`TickdagError::DagCycle`] when no order exists.
///
/// Upstream names must already be known to be valid node names.
pub fn topological_order<'a, I, D>(graph: &str, nodes: I) -> Result<Vec<TaskName>>
where
    I: IntoIterator<Item = (&'a str, D)>,
    D: IntoIterator<Item = &'a str>,
{
    // Edge direction: dep -> task
    let mut dag: DiGraphMap<&str, ()> = DiGraphMap::new();
    let mut edges = Vec::new();

    for (name, deps) in nodes {
        dag.add_node(name);
        for dep in deps {
            edges.push((dep, name));
        }
    }
    for (dep, name) in edges {
        dag.add_edge(dep, name, ());
    }

    match toposort(&dag, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => Err(TickdagError::DagCycle(format!(
            "cycle detected in dag '{}' involving task '{}'",
            graph,
            cycle.node_id()
        ))),
    }
}
