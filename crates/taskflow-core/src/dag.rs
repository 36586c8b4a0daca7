//! Dependency graph resolution
//!
//! A workflow's tasks form a DAG. The resolver computes a layered
//! topological order once, at definition build time; each layer is a set of
//! tasks whose dependencies all live in earlier layers and which may run in
//! parallel. `resolve` is then a pure function from the task instance
//! statuses of one workflow run to a verdict plus the tasks to queue next.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::status::TaskInstanceStatus;

/// Task name -> names of the tasks it depends on.
pub type DependencyGraph = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("task `{task}` depends on unknown task `{dependency}`")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle among tasks: {0}")]
    Cycle(String),
}

/// Overall verdict for one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    /// Work remains (in-flight or newly queued tasks).
    Running,
    /// Every task in every layer succeeded.
    Success,
    /// A task in an upstream-complete layer failed or timed out.
    Failed,
}

/// Result of resolving one workflow run against its DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub verdict: RunVerdict,
    /// Tasks in the current layer with no instance yet; queue these.
    pub to_queue: Vec<String>,
}

/// Layered topological view of one workflow's dependency graph.
#[derive(Debug, Clone)]
pub struct DagResolver {
    layers: Vec<Vec<String>>,
}

impl DagResolver {
    /// Layer the graph, rejecting unknown dependencies and cycles.
    pub fn new(graph: &DependencyGraph) -> Result<Self, DagError> {
        for (task, deps) in graph {
            for dep in deps {
                if !graph.contains_key(dep) {
                    return Err(DagError::UnknownDependency {
                        task: task.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut remaining: BTreeMap<&String, &BTreeSet<String>> = graph.iter().collect();
        let mut placed: BTreeSet<&String> = BTreeSet::new();
        let mut layers = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<&String> = remaining
                .iter()
                .filter(|(_, deps)| deps.iter().all(|d| placed.contains(d)))
                .map(|(name, _)| *name)
                .collect();

            if ready.is_empty() {
                let stuck = remaining
                    .keys()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(DagError::Cycle(stuck));
            }

            for name in &ready {
                remaining.remove(*name);
                placed.insert(*name);
            }
            layers.push(ready.into_iter().cloned().collect());
        }

        Ok(Self { layers })
    }

    /// The layered order; tasks within a layer dispatch in parallel.
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Walk the layers against the existing task instance statuses.
    ///
    /// Statuses are keyed by task name; a missing key means no instance has
    /// been queued yet. The walk stops at the first layer that is not fully
    /// successful: a failure there fails the run, otherwise missing tasks
    /// are queued and the run keeps running.
    pub fn resolve(&self, statuses: &HashMap<String, TaskInstanceStatus>) -> Resolution {
        for layer in &self.layers {
            let mut in_progress = 0usize;
            let mut failed = 0usize;
            let mut missing = Vec::new();

            for task in layer {
                match statuses.get(task) {
                    Some(TaskInstanceStatus::Success) => {}
                    Some(status) if status.is_failure() => failed += 1,
                    Some(_) => in_progress += 1,
                    None => missing.push(task.clone()),
                }
            }

            if failed > 0 {
                return Resolution {
                    verdict: RunVerdict::Failed,
                    to_queue: Vec::new(),
                };
            }
            if in_progress > 0 || !missing.is_empty() {
                return Resolution {
                    verdict: RunVerdict::Running,
                    to_queue: missing,
                };
            }
        }

        Resolution {
            verdict: RunVerdict::Success,
            to_queue: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        edges
            .iter()
            .map(|(task, deps)| {
                (
                    task.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    /// task1, task2 -> task3 -> task4
    fn diamond() -> DagResolver {
        DagResolver::new(&graph(&[
            ("task1", &[]),
            ("task2", &[]),
            ("task3", &["task1", "task2"]),
            ("task4", &["task3"]),
        ]))
        .unwrap()
    }

    fn statuses(entries: &[(&str, TaskInstanceStatus)]) -> HashMap<String, TaskInstanceStatus> {
        entries
            .iter()
            .map(|(name, status)| (name.to_string(), *status))
            .collect()
    }

    #[test]
    fn layers_are_topological() {
        let resolver = diamond();
        assert_eq!(
            resolver.layers(),
            &[
                vec!["task1".to_string(), "task2".to_string()],
                vec!["task3".to_string()],
                vec!["task4".to_string()],
            ]
        );
    }

    #[test]
    fn rejects_cycles() {
        let err = DagResolver::new(&graph(&[("a", &["b"]), ("b", &["a"])])).unwrap_err();
        assert!(matches!(err, DagError::Cycle(_)));
    }

    #[test]
    fn rejects_unknown_dependencies() {
        let err = DagResolver::new(&graph(&[("a", &["ghost"])])).unwrap_err();
        assert!(matches!(err, DagError::UnknownDependency { .. }));
    }

    #[test]
    fn empty_run_queues_first_layer() {
        let resolution = diamond().resolve(&HashMap::new());
        assert_eq!(resolution.verdict, RunVerdict::Running);
        assert_eq!(resolution.to_queue, vec!["task1", "task2"]);
    }

    #[test]
    fn in_progress_layer_queues_nothing() {
        use TaskInstanceStatus::*;
        let resolution =
            diamond().resolve(&statuses(&[("task1", Running), ("task2", Running)]));
        assert_eq!(resolution.verdict, RunVerdict::Running);
        assert!(resolution.to_queue.is_empty());
    }

    #[test]
    fn completed_layer_advances_to_next() {
        use TaskInstanceStatus::*;
        let resolution =
            diamond().resolve(&statuses(&[("task1", Success), ("task2", Success)]));
        assert_eq!(resolution.verdict, RunVerdict::Running);
        assert_eq!(resolution.to_queue, vec!["task3"]);
    }

    #[test]
    fn partial_layer_queues_only_missing() {
        use TaskInstanceStatus::*;
        let resolution = diamond().resolve(&statuses(&[("task1", Success)]));
        assert_eq!(resolution.verdict, RunVerdict::Running);
        assert_eq!(resolution.to_queue, vec!["task2"]);
    }

    #[test]
    fn all_success_is_a_success_verdict() {
        use TaskInstanceStatus::*;
        let resolution = diamond().resolve(&statuses(&[
            ("task1", Success),
            ("task2", Success),
            ("task3", Success),
            ("task4", Success),
        ]));
        assert_eq!(resolution.verdict, RunVerdict::Success);
        assert!(resolution.to_queue.is_empty());
    }

    #[test]
    fn failure_stops_downstream_layers() {
        use TaskInstanceStatus::*;
        let resolution = diamond().resolve(&statuses(&[
            ("task1", Success),
            ("task2", Success),
            ("task3", Failed),
        ]));
        assert_eq!(resolution.verdict, RunVerdict::Failed);
        assert!(resolution.to_queue.is_empty());
    }

    #[test]
    fn timed_out_counts_as_failure() {
        use TaskInstanceStatus::*;
        let resolution = diamond().resolve(&statuses(&[
            ("task1", TimedOut),
            ("task2", Success),
        ]));
        assert_eq!(resolution.verdict, RunVerdict::Failed);
        assert!(resolution.to_queue.is_empty());
    }

    #[test]
    fn empty_graph_is_immediately_successful() {
        let resolver = DagResolver::new(&DependencyGraph::new()).unwrap();
        let resolution = resolver.resolve(&HashMap::new());
        assert_eq!(resolution.verdict, RunVerdict::Success);
    }
}
