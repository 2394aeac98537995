//! Pipeline dependency graph.
//!
//! An edge `dependent → dependency` means the dependent may not start until
//! the dependency satisfies the edge's [`Condition`]. The graph is fixed:
//! anything but the three canonical edges is rejected, so the orchestrator
//! never has to reason about arbitrary DAGs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Registry,
    Training,
    Serving,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Registry => "registry",
            NodeKind::Training => "training",
            NodeKind::Serving => "serving",
        }
    }

    /// Training is one-shot; the other nodes run until stopped.
    pub fn is_long_running(self) -> bool {
        !matches!(self, NodeKind::Training)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a dependency must have reached before its dependent starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// The process has been spawned (start-order only).
    Started,
    /// The process's health endpoint passed the readiness gate.
    Healthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    /// The node that waits.
    pub from: NodeKind,
    /// The node waited on.
    pub to: NodeKind,
    pub condition: Condition,
}

impl Edge {
    pub const fn new(from: NodeKind, to: NodeKind, condition: Condition) -> Self {
        Self {
            from,
            to,
            condition,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cond = match self.condition {
            Condition::Started => "started",
            Condition::Healthy => "healthy",
        };
        write!(f, "{} -> {} ({cond})", self.from, self.to)
    }
}

/// The only edges a full pipeline may declare.
pub const CANONICAL_EDGES: [Edge; 3] = [
    Edge::new(NodeKind::Serving, NodeKind::Training, Condition::Started),
    Edge::new(NodeKind::Serving, NodeKind::Registry, Condition::Healthy),
    Edge::new(NodeKind::Training, NodeKind::Registry, Condition::Healthy),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("pipeline is missing the {0} node")]
    MissingNode(NodeKind),

    #[error("the {0} node is not allowed in this pipeline")]
    UnexpectedNode(NodeKind),

    #[error("edge {0} references a node that is not declared")]
    DanglingEdge(Edge),

    #[error("edge {0} is not part of the pipeline contract")]
    UnexpectedEdge(Edge),

    #[error("pipeline is missing edge {0}")]
    MissingEdge(Edge),

    #[error("dependency cycle through: {}", .0.iter().map(|n| n.as_str()).collect::<Vec<_>>().join(", "))]
    Cycle(Vec<NodeKind>),
}

impl From<GraphError> for PipelineError {
    fn from(err: GraphError) -> Self {
        PipelineError::Fatal(err.to_string())
    }
}

/// Validated pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineGraph {
    nodes: BTreeSet<NodeKind>,
    edges: BTreeSet<Edge>,
}

impl PipelineGraph {
    /// Registry, training and serving with the canonical edges.
    pub fn full() -> Self {
        Self {
            nodes: [NodeKind::Registry, NodeKind::Training, NodeKind::Serving].into(),
            edges: CANONICAL_EDGES.into(),
        }
    }

    /// Training alone, writing to an embedded registry.
    pub fn self_contained() -> Self {
        Self {
            nodes: [NodeKind::Training].into(),
            edges: BTreeSet::new(),
        }
    }

    /// Validate a declared graph against the fixed pipeline shape.
    pub fn build(
        self_contained: bool,
        nodes: impl IntoIterator<Item = NodeKind>,
        edges: impl IntoIterator<Item = Edge>,
    ) -> Result<Self, GraphError> {
        let nodes: BTreeSet<NodeKind> = nodes.into_iter().collect();
        let edges: BTreeSet<Edge> = edges.into_iter().collect();
        let expected = if self_contained {
            Self::self_contained()
        } else {
            Self::full()
        };

        if let Some(missing) = expected.nodes.difference(&nodes).next() {
            return Err(GraphError::MissingNode(*missing));
        }
        if let Some(extra) = nodes.difference(&expected.nodes).next() {
            return Err(GraphError::UnexpectedNode(*extra));
        }
        if let Some(edge) = edges
            .iter()
            .find(|e| !nodes.contains(&e.from) || !nodes.contains(&e.to))
        {
            return Err(GraphError::DanglingEdge(*edge));
        }

        let graph = Self { nodes, edges };
        graph.start_order()?;

        if let Some(edge) = graph.edges.difference(&expected.edges).next() {
            return Err(GraphError::UnexpectedEdge(*edge));
        }
        if let Some(edge) = expected.edges.difference(&graph.edges).next() {
            return Err(GraphError::MissingEdge(*edge));
        }
        Ok(graph)
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeKind> + '_ {
        self.nodes.iter().copied()
    }

    pub fn contains(&self, node: NodeKind) -> bool {
        self.nodes.contains(&node)
    }

    /// Edges `node` waits on.
    pub fn dependencies_of(&self, node: NodeKind) -> Vec<Edge> {
        self.edges.iter().filter(|e| e.from == node).copied().collect()
    }

    /// Nodes in start order (dependencies first), via Kahn's algorithm.
    pub fn start_order(&self) -> Result<Vec<NodeKind>, GraphError> {
        let mut in_degree: BTreeMap<NodeKind, usize> =
            self.nodes.iter().map(|n| (*n, 0)).collect();
        for edge in &self.edges {
            if let Some(deg) = in_degree.get_mut(&edge.from) {
                *deg += 1;
            }
        }

        let mut queue: VecDeque<NodeKind> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut sorted = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            sorted.push(node);
            for edge in self.edges.iter().filter(|e| e.to == node) {
                if let Some(deg) = in_degree.get_mut(&edge.from) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(edge.from);
                    }
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            let stuck = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(n, _)| n)
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(sorted)
    }
}
