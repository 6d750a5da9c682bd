//! Graph execution engine.
//!
//! A workflow is a graph of `Node`s over a shared `WorkflowState`. Static
//! `Edge`s and `Join`s define dependencies; a `ConditionalEdge` routes on the
//! post-merge state and may loop back to a node that already ran. Several
//! entry points run concurrently as the first step.
//!
//! The `GraphExecutor` runs the graph in steps: every ready node of a step runs
//! as its own task, updates merge in scheduling order, then the next step's
//! nodes are derived from the edges of the nodes that just ran.

pub mod edge;
pub mod executor;
pub mod node;
pub mod state;

use std::collections::HashSet;

use redline_core::error::{RedlineError, Result};

pub use edge::{evaluate_condition, ConditionalEdge, Edge, Join, Route, END};
pub use executor::{ExecutionResult, ExecutorConfig, GraphExecutor, NodeRun, RunStatus};
pub use node::{Node, NodeBody};
pub use state::{NodeFailure, StateMap, StateUpdate, WorkflowState, ERROR_FIELD};

/// Nodes and the edges between them.
pub struct Graph<S: WorkflowState> {
    nodes: Vec<Node<S>>,
    edges: Vec<Edge>,
    joins: Vec<Join>,
    conditionals: Vec<ConditionalEdge<S>>,
    entry_points: Vec<String>,
}

impl<S: WorkflowState> Default for Graph<S> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            joins: Vec::new(),
            conditionals: Vec::new(),
            entry_points: Vec::new(),
        }
    }
}

impl<S: WorkflowState> Graph<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node<S>) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// `to` runs after `from`. A node with several incoming edges runs after
    /// whichever predecessor completes; use [`Graph::add_join`] to wait for all.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    /// `target` runs once all `sources` have completed.
    pub fn add_join<I, K>(&mut self, sources: I, target: impl Into<String>) -> &mut Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.joins.push(Join {
            sources: sources.into_iter().map(Into::into).collect(),
            target: target.into(),
        });
        self
    }

    pub fn add_conditional_edge(&mut self, edge: ConditionalEdge<S>) -> &mut Self {
        self.conditionals.push(edge);
        self
    }

    /// Mark a node as an entry point. Multiple entry points run concurrently.
    pub fn set_entry_point(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        if !self.entry_points.contains(&name) {
            self.entry_points.push(name);
        }
        self
    }

    pub fn node(&self, name: &str) -> Option<&Node<S>> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn nodes(&self) -> &[Node<S>] {
        &self.nodes
    }

    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    pub(crate) fn edges_from<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == name)
    }

    pub(crate) fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub(crate) fn conditional_from(&self, name: &str) -> Option<&ConditionalEdge<S>> {
        self.conditionals.iter().find(|c| c.from == name)
    }

    /// Check the graph is well formed before running it.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RedlineError::Graph(msg));

        if self.nodes.is_empty() {
            return invalid("graph has no nodes".into());
        }
        if self.entry_points.is_empty() {
            return invalid("graph has no entry point".into());
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name == END {
                return invalid(format!("'{}' is reserved", END));
            }
            if !names.insert(node.name.as_str()) {
                return invalid(format!("duplicate node '{}'", node.name));
            }
        }

        let known = |name: &str| names.contains(name);

        for entry in &self.entry_points {
            if !known(entry) {
                return invalid(format!("entry point '{}' is not a node", entry));
            }
        }

        for edge in &self.edges {
            if !known(&edge.from) {
                return invalid(format!("edge from unknown node '{}'", edge.from));
            }
            if edge.to != END && !known(&edge.to) {
                return invalid(format!("edge to unknown node '{}'", edge.to));
            }
        }

        for join in &self.joins {
            if join.sources.is_empty() {
                return invalid(format!("join into '{}' has no sources", join.target));
            }
            if let Some(src) = join.sources.iter().find(|s| !known(s)) {
                return invalid(format!("join from unknown node '{}'", src));
            }
            if !known(&join.target) {
                return invalid(format!("join into unknown node '{}'", join.target));
            }
        }

        let mut routed = HashSet::new();
        for cond in &self.conditionals {
            if !known(&cond.from) {
                return invalid(format!("conditional edge from unknown node '{}'", cond.from));
            }
            if !routed.insert(cond.from.as_str()) {
                return invalid(format!("node '{}' has more than one conditional edge", cond.from));
            }
        }

        Ok(())
    }
}
