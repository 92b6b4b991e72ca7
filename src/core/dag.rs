//! Task DAG (Directed Acyclic Graph) for the wave scheduler.
//!
//! Edges point from a prerequisite to the task that depends on it, so the
//! incoming neighbours of a node are its `depends_on` set.

use crate::core::task::Task;
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Phrases in a description that name a prerequisite task:
/// "requires X", "depends on X", "needs X", "after X", "wait for X".
static DEPENDENCY_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:requires?|depends?\s+on|needs?|after|wait\s+for)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .unwrap()
});

/// Task ids mentioned as prerequisites in free text, in order of appearance.
pub fn detect_dependency_mentions(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    DEPENDENCY_PHRASE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// The task dependency graph.
pub struct TaskDAG {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<String, NodeIndex>,
}

impl TaskDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a graph from a task list, wiring every `depends_on` entry.
    ///
    /// # Errors
    /// - `Error::Validation` if a task is malformed or names an unknown dependency
    /// - `Error::DuplicateTask` if two tasks share an id
    /// - `Error::DependencyCycle` if the dependencies form a cycle
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            task.validate()?;
            dag.add_task(task)?;
        }

        let edges: Vec<(String, String)> = dag
            .graph
            .node_weights()
            .flat_map(|task| {
                task.depends_on
                    .iter()
                    .map(move |dep| (dep.clone(), task.id.clone()))
            })
            .collect();

        for (from, to) in edges {
            let from_idx = dag.task_index.get(&from).copied().ok_or_else(|| {
                Error::Validation(format!("Task '{}' depends on unknown task '{}'", to, from))
            })?;
            let to_idx = dag.task_index[&to];
            if dag.graph.find_edge(from_idx, to_idx).is_none() {
                dag.graph.add_edge(from_idx, to_idx, ());
            }
        }

        dag.validate()?;
        Ok(dag)
    }

    /// Add a task to the DAG.
    ///
    /// # Errors
    /// Returns `Error::DuplicateTask` if a task with the same id exists.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        Ok(index)
    }

    /// Add a dependency between two tasks.
    ///
    /// The dependency indicates that `from` must complete before `to` can start.
    /// The stored task's `depends_on` list is updated to match.
    ///
    /// # Arguments
    /// * `from` - The task that must complete first (dependency)
    /// * `to` - The task that depends on `from`
    ///
    /// # Errors
    /// Returns an error if:
    /// - Either task is not found in the DAG
    /// - Adding the edge would create a cycle
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", from)))?;

        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", to)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::DependencyCycle(format!(
                "adding {} -> {} would create a cycle",
                from, to
            )));
        }

        if let Some(task) = self.graph.node_weight_mut(to_index) {
            if !task.depends_on.iter().any(|d| d == from) {
                task.depends_on.push(from.to_string());
            }
        }
        Ok(())
    }

    /// Add edges for prerequisites mentioned in task descriptions.
    ///
    /// Only mentions of ids present in the graph count; self-mentions and
    /// mentions that would close a cycle are skipped. Returns the number of
    /// edges added.
    pub fn detect_dependencies(&mut self) -> usize {
        let mut candidates = Vec::new();
        for task in self.graph.node_weights() {
            for mention in detect_dependency_mentions(task.instruction()) {
                if mention != task.id && self.contains_task(&mention) {
                    candidates.push((mention, task.id.clone()));
                }
            }
        }

        let mut added = 0;
        for (from, to) in candidates {
            if self.has_dependency(&from, &to) {
                continue;
            }
            match self.add_dependency(&from, &to) {
                Ok(()) => {
                    tracing::debug!(from = %from, to = %to, "detected dependency from description");
                    added += 1;
                }
                Err(e) => tracing::warn!(from = %from, to = %to, error = %e, "skipping detected dependency"),
            }
        }
        added
    }

    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_dependency(&self, from: &str, to: &str) -> bool {
        if let (Some(&from_idx), Some(&to_idx)) =
            (self.task_index.get(from), self.task_index.get(to))
        {
            self.graph.find_edge(from_idx, to_idx).is_some()
        } else {
            false
        }
    }

    /// Get all tasks that the given task depends on (predecessors).
    pub fn get_dependencies(&self, id: &str) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get all tasks that directly depend on the given task (successors).
    pub fn get_dependents(&self, id: &str) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|neighbor| self.graph.node_weight(neighbor))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task reachable downstream of `id`, not including `id` itself.
    pub fn transitive_dependents(&self, id: &str) -> Vec<&Task> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(node) = bfs.next(&self.graph) {
            if node != start {
                if let Some(task) = self.graph.node_weight(node) {
                    found.push(task);
                }
            }
        }
        found
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &str) -> bool {
        self.task_index.contains_key(id)
    }

    // ========== Scheduling Operations ==========

    /// Get all tasks ready to execute (dependencies satisfied).
    ///
    /// A task is ready if it has not been started and every incoming edge
    /// comes from a task in the completed set. Insertion order is preserved.
    ///
    /// # Arguments
    /// * `completed` - Set of task IDs that completed successfully
    /// * `started` - Set of task IDs already dispatched or resolved
    pub fn ready_tasks<'a>(
        &'a self,
        completed: &HashSet<String>,
        started: &HashSet<String>,
    ) -> Vec<&'a Task> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if completed.contains(&task.id) || started.contains(&task.id) {
                    return None;
                }

                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep_index| {
                        self.graph
                            .node_weight(dep_index)
                            .map(|dep_task| completed.contains(&dep_task.id))
                            .unwrap_or(false)
                    });

                deps_satisfied.then_some(task)
            })
            .collect()
    }

    /// Check the graph for cycles.
    ///
    /// # Errors
    /// Returns `Error::DependencyCycle` naming the tasks on the cycle.
    pub fn validate(&self) -> Result<()> {
        if !is_cyclic_directed(&self.graph) {
            return Ok(());
        }
        let members = tarjan_scc(&self.graph)
            .into_iter()
            .find(|scc| {
                scc.len() > 1
                    || scc
                        .first()
                        .map(|&n| self.graph.find_edge(n, n).is_some())
                        .unwrap_or(false)
            })
            .unwrap_or_default();
        let mut ids: Vec<&str> = members
            .iter()
            .filter_map(|&n| self.graph.node_weight(n).map(|t| t.id.as_str()))
            .collect();
        ids.sort_unstable();
        Err(Error::DependencyCycle(ids.join(", ")))
    }

    /// Get tasks in topological order (respecting dependencies).
    ///
    /// # Errors
    /// Returns `Error::DependencyCycle` if the graph contains a cycle.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let task_id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.as_str())
                .unwrap_or("unknown");
            Error::DependencyCycle(format!("cycle at task {}", task_id))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Number of tasks not in the given set.
    pub fn pending_count(&self, done: &HashSet<String>) -> usize {
        self.task_index
            .keys()
            .filter(|id| !done.contains(*id))
            .count()
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
