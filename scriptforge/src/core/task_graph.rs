//! Dependency graph of atomic design operations.
//!
//! Tasks live in a flat id-keyed map; edges are added only through
//! [`TaskGraph::add_dependency`]. The graph itself does not refuse back-edges,
//! so callers that build from untrusted input must check [`TaskGraph::has_cycles`]
//! before handing the graph on.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;

/// Kind of design operation a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Primitive,
    Sketch,
    Extrude,
    Revolve,
    Pattern,
    Boolean,
    Fillet,
    Chamfer,
    Transform,
    #[serde(other)]
    Other,
}

impl OperationType {
    /// Every operation a planner may name, in prompt order.
    pub const KNOWN: [OperationType; 9] = [
        OperationType::Primitive,
        OperationType::Sketch,
        OperationType::Extrude,
        OperationType::Revolve,
        OperationType::Pattern,
        OperationType::Boolean,
        OperationType::Fillet,
        OperationType::Chamfer,
        OperationType::Transform,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Primitive => "primitive",
            OperationType::Sketch => "sketch",
            OperationType::Extrude => "extrude",
            OperationType::Revolve => "revolve",
            OperationType::Pattern => "pattern",
            OperationType::Boolean => "boolean",
            OperationType::Fillet => "fillet",
            OperationType::Chamfer => "chamfer",
            OperationType::Transform => "transform",
            OperationType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// One atomic operation in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub description: String,
    pub operation: OperationType,
    pub parameters: BTreeMap<String, Value>,
    pub status: TaskStatus,
    /// Ids this task waits on. Maintained by the owning graph.
    pub dependencies: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub errors: Vec<String>,
}

impl TaskNode {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        operation: OperationType,
        parameters: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            operation,
            parameters,
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            started_at: None,
            completed_at: None,
            output: None,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// `to` consumes geometry produced by `from`.
    #[default]
    Requires,
    /// `to` modifies the result of `from` in place.
    Modifies,
    /// `to` only references `from` (placement, constraints).
    References,
}

/// Edge meaning `from` must finish before `to` starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub from: String,
    pub to: String,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    tasks: BTreeMap<String, TaskNode>,
    /// Insertion order, used to keep levels and summaries stable.
    order: Vec<String>,
    dependencies: Vec<TaskDependency>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.get(id)
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn dependencies(&self) -> &[TaskDependency] {
        &self.dependencies
    }

    pub fn add_task(&mut self, mut task: TaskNode) -> Result<(), GraphError> {
        if self.tasks.contains_key(&task.id) {
            return Err(GraphError::DuplicateTask(task.id));
        }
        task.dependencies.clear();
        self.order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Record that `to` depends on `from`. Repeated edges are ignored.
    pub fn add_dependency(
        &mut self,
        from: &str,
        to: &str,
        kind: DependencyKind,
    ) -> Result<(), GraphError> {
        if from == to {
            return Err(GraphError::SelfDependency(from.to_string()));
        }
        if !self.tasks.contains_key(from) {
            return Err(GraphError::UnknownTask(from.to_string()));
        }
        let Some(target) = self.tasks.get_mut(to) else {
            return Err(GraphError::UnknownTask(to.to_string()));
        };
        if target.dependencies.iter().any(|dep| dep == from) {
            return Ok(());
        }
        target.dependencies.push(from.to_string());
        self.dependencies.push(TaskDependency {
            from: from.to_string(),
            to: to.to_string(),
            kind,
        });
        Ok(())
    }

    /// Depth-first search with an explicit recursion stack.
    pub fn has_cycles(&self) -> bool {
        let adjacency = self.adjacency();
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        self.order.iter().any(|id| {
            !visited.contains(id.as_str())
                && dfs_finds_cycle(id, &adjacency, &mut visited, &mut on_stack)
        })
    }

    /// Group tasks into levels with Kahn's algorithm.
    ///
    /// Every task in level `n` depends only on tasks in levels `< n`, so the
    /// concatenation of levels is a valid topological order.
    pub fn execution_order(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let adjacency = self.adjacency();
        let mut in_degree: HashMap<&str, usize> = self
            .tasks
            .values()
            .map(|task| (task.id.as_str(), task.dependencies.len()))
            .collect();

        let mut current: Vec<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut levels = Vec::new();
        let mut placed = 0usize;

        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for id in &current {
                for successor in adjacency.get(id).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(successor) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*successor);
                        }
                    }
                }
            }
            next.sort_by_key(|id| self.position(id));
            levels.push(current.iter().map(|id| id.to_string()).collect());
            current = next;
        }

        if placed != self.tasks.len() {
            return Err(GraphError::Cycle);
        }
        Ok(levels)
    }

    /// Pending tasks whose dependencies have all completed.
    pub fn ready_tasks(&self) -> Vec<&TaskNode> {
        self.tasks()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| {
                task.dependencies.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .is_some_and(|d| d.status == TaskStatus::Completed)
                })
            })
            .collect()
    }

    pub fn mark_started(&mut self, id: &str) -> Result<(), GraphError> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, id: &str, output: Option<Value>) -> Result<(), GraphError> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.output = output;
        Ok(())
    }

    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> Result<(), GraphError> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.errors.push(error.into());
        Ok(())
    }

    pub fn mark_skipped(&mut self, id: &str) -> Result<(), GraphError> {
        self.task_mut(id)?.status = TaskStatus::Skipped;
        Ok(())
    }

    /// One line per task, for prompts and logs.
    pub fn summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.len());
        for task in self.tasks() {
            let mut line = format!("- {} [{}] {}", task.id, task.operation.as_str(), task.description);
            if !task.dependencies.is_empty() {
                line.push_str(&format!(" (after {})", task.dependencies.join(", ")));
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut TaskNode, GraphError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.to_string()))
    }

    fn position(&self, id: &str) -> usize {
        self.order.iter().position(|o| o == id).unwrap_or(usize::MAX)
    }

    /// Successor lists (`from` -> dependents), in edge insertion order.
    fn adjacency(&self) -> HashMap<&str, Vec<&str>> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for dep in &self.dependencies {
            adjacency
                .entry(dep.from.as_str())
                .or_default()
                .push(dep.to.as_str());
        }
        adjacency
    }
}

fn dfs_finds_cycle<'a>(
    id: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
) -> bool {
    visited.insert(id);
    on_stack.insert(id);
    for successor in adjacency.get(id).into_iter().flatten() {
        if on_stack.contains(successor) {
            return true;
        }
        if !visited.contains(successor) && dfs_finds_cycle(successor, adjacency, visited, on_stack)
        {
            return true;
        }
    }
    on_stack.remove(id);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, operation: OperationType) -> TaskNode {
        TaskNode::new(id, format!("{id} step"), operation, BTreeMap::new())
    }

    fn bracket_graph() -> TaskGraph {
        // sketch -> extrude -> fillet
        //                   -> pattern -> boolean
        let mut graph = TaskGraph::new();
        graph.add_task(task("sketch", OperationType::Sketch)).unwrap();
        graph.add_task(task("extrude", OperationType::Extrude)).unwrap();
        graph.add_task(task("fillet", OperationType::Fillet)).unwrap();
        graph.add_task(task("pattern", OperationType::Pattern)).unwrap();
        graph.add_task(task("boolean", OperationType::Boolean)).unwrap();
        graph.add_dependency("sketch", "extrude", DependencyKind::Requires).unwrap();
        graph.add_dependency("extrude", "fillet", DependencyKind::Modifies).unwrap();
        graph.add_dependency("extrude", "pattern", DependencyKind::Requires).unwrap();
        graph.add_dependency("pattern", "boolean", DependencyKind::Requires).unwrap();
        graph
    }

    #[test]
    fn forward_edges_have_no_cycles() {
        assert!(!bracket_graph().has_cycles());
    }

    #[test]
    fn back_edge_creates_cycle() {
        let mut graph = bracket_graph();
        graph
            .add_dependency("boolean", "sketch", DependencyKind::References)
            .unwrap();
        assert!(graph.has_cycles());
        assert_eq!(graph.execution_order(), Err(GraphError::Cycle));
    }

    #[test]
    fn levels_respect_dependencies() {
        let graph = bracket_graph();
        let levels = graph.execution_order().expect("levels");
        assert_eq!(
            levels,
            vec![
                vec!["sketch".to_string()],
                vec!["extrude".to_string()],
                vec!["fillet".to_string(), "pattern".to_string()],
                vec!["boolean".to_string()],
            ]
        );

        let flat: Vec<String> = levels.into_iter().flatten().collect();
        for task in graph.tasks() {
            let pos = flat.iter().position(|id| id == &task.id).unwrap();
            for dep in &task.dependencies {
                let dep_pos = flat.iter().position(|id| id == dep).unwrap();
                assert!(dep_pos < pos, "{dep} must precede {}", task.id);
            }
        }
    }

    #[test]
    fn independent_tasks_share_first_level_in_insertion_order() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("b", OperationType::Primitive)).unwrap();
        graph.add_task(task("a", OperationType::Primitive)).unwrap();
        let levels = graph.execution_order().unwrap();
        assert_eq!(levels, vec![vec!["b".to_string(), "a".to_string()]]);
    }

    #[test]
    fn rejects_duplicate_unknown_and_self_edges() {
        let mut graph = bracket_graph();
        assert_eq!(
            graph.add_task(task("sketch", OperationType::Sketch)),
            Err(GraphError::DuplicateTask("sketch".to_string()))
        );
        assert_eq!(
            graph.add_dependency("ghost", "sketch", DependencyKind::Requires),
            Err(GraphError::UnknownTask("ghost".to_string()))
        );
        assert_eq!(
            graph.add_dependency("sketch", "sketch", DependencyKind::Requires),
            Err(GraphError::SelfDependency("sketch".to_string()))
        );
    }

    #[test]
    fn repeated_edge_is_recorded_once() {
        let mut graph = bracket_graph();
        graph
            .add_dependency("sketch", "extrude", DependencyKind::Requires)
            .unwrap();
        assert_eq!(graph.dependencies().len(), 4);
        assert_eq!(graph.task("extrude").unwrap().dependencies, vec!["sketch"]);
    }

    #[test]
    fn ready_tasks_follow_completion() {
        let mut graph = bracket_graph();
        let ready: Vec<&str> = graph.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["sketch"]);

        graph.mark_started("sketch").unwrap();
        assert!(graph.ready_tasks().is_empty());
        graph.mark_completed("sketch", None).unwrap();
        graph.mark_completed("extrude", None).unwrap();

        let ready: Vec<&str> = graph.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["fillet", "pattern"]);

        graph.mark_failed("pattern", "bad spacing").unwrap();
        graph.mark_skipped("boolean").unwrap();
        let pattern = graph.task("pattern").unwrap();
        assert_eq!(pattern.status, TaskStatus::Failed);
        assert_eq!(pattern.errors, vec!["bad spacing"]);
        assert!(graph.task("sketch").unwrap().started_at.is_some());
    }

    #[test]
    fn summary_lists_operations_and_dependencies() {
        let summary = bracket_graph().summary();
        assert!(summary.starts_with("- sketch [sketch] sketch step"));
        assert!(summary.contains("- boolean [boolean] boolean step (after pattern)"));
    }

    #[test]
    fn unknown_operation_deserializes_as_other() {
        let op: OperationType = serde_json::from_str("\"loft\"").unwrap();
        assert_eq!(op, OperationType::Other);
    }
}
