//! Dependency resolution for the tasks of a pipeline.

use conveyor_core::ids::TaskId;
use conveyor_core::task::TaskSpec;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in task dependencies involving {0}")]
    CycleDetected(TaskId),
    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },
}

impl From<DagError> for conveyor_core::Error {
    fn from(err: DagError) -> Self {
        match err {
            DagError::CycleDetected(id) => conveyor_core::Error::CycleDetected(id),
            DagError::UnknownDependency { task, dependency } => {
                conveyor_core::Error::UnknownDependency { task, dependency }
            }
        }
    }
}

/// Reverse adjacency index of one pipeline: task id to the ids that list it
/// as a dependency.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the edges of a newly admitted task.
    pub fn add(&mut self, task: &TaskId, dependencies: &[TaskId]) {
        for dependency in dependencies {
            let entry = self.dependents.entry(dependency.clone()).or_default();
            if !entry.contains(task) {
                entry.push(task.clone());
            }
        }
    }

    /// Tasks that directly depend on `task`, in admission order.
    pub fn dependents(&self, task: &TaskId) -> &[TaskId] {
        self.dependents
            .get(task)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every task reachable through dependent edges, breadth first.
    pub fn transitive_dependents(&self, root: &TaskId) -> Vec<TaskId> {
        let mut seen: HashSet<&TaskId> = HashSet::new();
        let mut queue: VecDeque<&TaskId> = self.dependents(root).iter().collect();
        let mut out = Vec::new();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id.clone());
            queue.extend(self.dependents(id));
        }

        out
    }

    /// Order `ids` so that every task precedes the tasks it depends on.
    pub fn dependents_first(&self, ids: &[TaskId]) -> Vec<TaskId> {
        let wanted: HashSet<&TaskId> = ids.iter().collect();
        let mut visited: HashSet<&TaskId> = HashSet::new();
        let mut order = Vec::with_capacity(ids.len());

        // Iterative post-order over dependent edges.
        for root in ids {
            if visited.contains(root) {
                continue;
            }
            let mut stack: Vec<(&TaskId, bool)> = vec![(root, false)];
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    order.push(id.clone());
                    continue;
                }
                if !visited.insert(id) {
                    continue;
                }
                stack.push((id, true));
                for dependent in self.dependents(id) {
                    if wanted.contains(dependent) && !visited.contains(dependent) {
                        stack.push((dependent, false));
                    }
                }
            }
        }

        order
    }
}

/// Validate the dependency edges of a batch of tasks and return the batch
/// indices in an order where each task follows the batch members it depends
/// on. Dependencies outside the batch must satisfy `known`.
pub fn admission_order(
    batch: &[TaskSpec],
    known: impl Fn(&TaskId) -> bool,
) -> Result<Vec<usize>, DagError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut index: HashMap<&TaskId, NodeIndex> = HashMap::with_capacity(batch.len());

    for (i, spec) in batch.iter().enumerate() {
        index.insert(&spec.id, graph.add_node(i));
    }

    for spec in batch {
        let node = index[&spec.id];
        for dependency in &spec.dependencies {
            if dependency == &spec.id {
                return Err(DagError::CycleDetected(spec.id.clone()));
            }
            match index.get(dependency) {
                Some(&dep_node) => {
                    graph.add_edge(dep_node, node, ());
                }
                None if known(dependency) => {}
                None => {
                    return Err(DagError::UnknownDependency {
                        task: spec.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
    }

    toposort(&graph, None)
        .map(|nodes| nodes.into_iter().map(|n| graph[n]).collect())
        .map_err(|cycle| DagError::CycleDetected(batch[graph[cycle.node_id()]].id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::ids::PipelineId;

    fn spec(pipeline: PipelineId, id: &str, deps: &[&str]) -> TaskSpec {
        deps.iter()
            .fold(TaskSpec::new(id, pipeline), |s, d| s.depends_on(*d))
    }

    #[test]
    fn test_linear_order() {
        let p = PipelineId::new();
        let batch = vec![
            spec(p, "deploy", &["test"]),
            spec(p, "test", &["build"]),
            spec(p, "build", &[]),
        ];

        let order = admission_order(&batch, |_| false).unwrap();
        let names: Vec<_> = order.iter().map(|&i| batch[i].id.as_str()).collect();
        assert_eq!(names, vec!["build", "test", "deploy"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let p = PipelineId::new();
        let batch = vec![
            spec(p, "a", &["c"]),
            spec(p, "b", &["a"]),
            spec(p, "c", &["b"]),
        ];

        let err = admission_order(&batch, |_| false).unwrap_err();
        assert!(matches!(err, DagError::CycleDetected(_)));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let p = PipelineId::new();
        let batch = vec![spec(p, "a", &["a"])];
        let err = admission_order(&batch, |_| true).unwrap_err();
        assert!(matches!(err, DagError::CycleDetected(id) if id.as_str() == "a"));
    }

    #[test]
    fn test_unknown_dependency() {
        let p = PipelineId::new();
        let batch = vec![spec(p, "test", &["build"])];
        let err = admission_order(&batch, |_| false).unwrap_err();
        assert!(matches!(
            err,
            DagError::UnknownDependency { ref dependency, .. } if dependency.as_str() == "build"
        ));

        assert!(admission_order(&batch, |id| id.as_str() == "build").is_ok());
    }

    fn ids(names: &[&str]) -> Vec<TaskId> {
        names.iter().map(|n| TaskId::from(*n)).collect()
    }

    #[test]
    fn test_transitive_dependents() {
        let mut graph = DependencyGraph::new();
        graph.add(&TaskId::from("b"), &ids(&["a"]));
        graph.add(&TaskId::from("c"), &ids(&["a"]));
        graph.add(&TaskId::from("d"), &ids(&["b", "c"]));

        let reached = graph.transitive_dependents(&TaskId::from("a"));
        assert_eq!(reached, ids(&["b", "c", "d"]));
        assert!(graph.transitive_dependents(&TaskId::from("d")).is_empty());
    }

    #[test]
    fn test_dependents_first() {
        let mut graph = DependencyGraph::new();
        graph.add(&TaskId::from("b"), &ids(&["a"]));
        graph.add(&TaskId::from("c"), &ids(&["b"]));

        let order = graph.dependents_first(&ids(&["a", "b", "c"]));
        assert_eq!(order, ids(&["c", "b", "a"]));
    }
}
