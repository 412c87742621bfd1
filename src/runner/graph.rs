//! Dependency graph construction
//!
//! Every reference goes through the context router, so one node exists per
//! resolved definition. Hooks and job ordering become plain edges; the
//! scheduler only ever sees a DAG.

use crate::error::{Result, RunbookError};
use crate::runner::node::NodeId;
use crate::runner::router::TaskTable;
use crate::runner::task::TaskDefinition;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// A node of the built graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    /// Definition key, `name` or `name:context`
    pub key: String,
    pub definition: Arc<TaskDefinition>,
    /// Dependencies: needs, before-hooks, after-hook parents, ordering edges
    pub deps: Vec<NodeId>,
}

impl PartialEq for GraphNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.key == other.key && self.deps == other.deps
    }
}

/// A validated, acyclic task graph
#[derive(Debug, Clone, PartialEq)]
pub struct TaskGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, NodeId>,
}

impl TaskGraph {
    /// Build and validate the graph for `targets`
    pub fn build(tasks: &TaskTable, context: Option<&str>, targets: &[String]) -> Result<Self> {
        let mut builder = GraphBuilder::new(tasks, context);
        for target in targets {
            builder.add(target)?;
        }
        builder.build()
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id]
    }

    pub fn find(&self, key: &str) -> Option<&GraphNode> {
        self.index.get(key).map(|&id| &self.nodes[id])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Edges as `(dependency, dependent)` keys, in node order
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.nodes
            .iter()
            .flat_map(|node| {
                node.deps
                    .iter()
                    .map(move |&dep| (self.nodes[dep].key.as_str(), node.key.as_str()))
            })
            .collect()
    }

    /// Reverse adjacency: for each node, the nodes that depend on it
    pub fn dependents(&self) -> Vec<Vec<NodeId>> {
        let mut dependents = vec![Vec::new(); self.nodes.len()];
        for node in &self.nodes {
            for &dep in &node.deps {
                dependents[dep].push(node.id);
            }
        }
        dependents
    }
}

#[derive(Debug, Default, Clone)]
struct DepLists {
    needs: Vec<NodeId>,
    before: Vec<NodeId>,
    after_parents: Vec<NodeId>,
    ordering: Vec<NodeId>,
}

impl DepLists {
    fn flatten(self) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.needs
            .into_iter()
            .chain(self.before)
            .chain(self.after_parents)
            .chain(self.ordering)
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Incremental graph construction
pub struct GraphBuilder<'a> {
    tasks: &'a TaskTable,
    context: Option<&'a str>,
    nodes: Vec<(String, Arc<TaskDefinition>)>,
    deps: Vec<DepLists>,
    index: HashMap<String, NodeId>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(tasks: &'a TaskTable, context: Option<&'a str>) -> Self {
        GraphBuilder {
            tasks,
            context,
            nodes: Vec::new(),
            deps: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Resolve `name` and everything it references, returning its node
    pub fn add(&mut self, name: &str) -> Result<NodeId> {
        let definition = Arc::clone(self.tasks.resolve(name, self.context)?);
        let key = definition.key();
        if let Some(&id) = self.index.get(&key) {
            return Ok(id);
        }

        let id = self.nodes.len();
        debug!(task = %key, id, "graph node");
        self.nodes.push((key.clone(), Arc::clone(&definition)));
        self.deps.push(DepLists::default());
        self.index.insert(key, id);

        for need in &definition.needs {
            let dep = self.add(need)?;
            self.deps[id].needs.push(dep);
        }
        for hook in &definition.hooks.before {
            let dep = self.add(hook)?;
            self.deps[id].before.push(dep);
        }
        for hook in &definition.hooks.after {
            let hook_id = self.add(hook)?;
            self.deps[hook_id].after_parents.push(id);
        }

        Ok(id)
    }

    /// Require `before` to finish before `after` starts
    pub fn order(&mut self, before: &str, after: &str) -> Result<()> {
        let before = self.add(before)?;
        let after = self.add(after)?;
        self.deps[after].ordering.push(before);
        Ok(())
    }

    /// Validate and freeze the graph
    pub fn build(self) -> Result<TaskGraph> {
        let nodes: Vec<GraphNode> = self
            .nodes
            .into_iter()
            .zip(self.deps)
            .enumerate()
            .map(|(id, ((key, definition), deps))| GraphNode {
                id,
                key,
                definition,
                deps: deps.flatten(),
            })
            .collect();

        let adjacency: Vec<Vec<NodeId>> = nodes.iter().map(|n| n.deps.clone()).collect();
        if let Some(cycle) = find_cycle(&adjacency) {
            return Err(RunbookError::Cycle {
                path: cycle.into_iter().map(|id| nodes[id].key.clone()).collect(),
            });
        }

        Ok(TaskGraph {
            nodes,
            index: self.index,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-colour depth-first search. Returns the nodes of the first cycle
/// found, with the starting node repeated at the end.
pub(crate) fn find_cycle(adjacency: &[Vec<usize>]) -> Option<Vec<usize>> {
    fn visit(
        node: usize,
        adjacency: &[Vec<usize>],
        color: &mut [Color],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        color[node] = Color::Gray;
        stack.push(node);

        for &next in &adjacency[node] {
            match color[next] {
                Color::Gray => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = visit(next, adjacency, color, stack) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        stack.pop();
        color[node] = Color::Black;
        None
    }

    let mut color = vec![Color::White; adjacency.len()];
    let mut stack = Vec::new();
    for node in 0..adjacency.len() {
        if color[node] == Color::White {
            if let Some(cycle) = visit(node, adjacency, &mut color, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
