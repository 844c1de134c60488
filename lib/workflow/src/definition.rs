//! Workflow definition types.
//!
//! A definition is the immutable description of a workflow: its nodes, in
//! declaration order, and the edges between them. Structural checks happen
//! when it is turned into a [`WorkflowGraph`](crate::graph::WorkflowGraph).

use crate::edge::EdgeSpec;
use crate::node::{NodeId, NodeSpec};
use klikkflow_core::WorkflowId;
use serde::{Deserialize, Serialize};

/// A workflow as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Generated when absent from the source document.
    #[serde(default)]
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

impl WorkflowDefinition {
    /// Creates an empty workflow.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(WorkflowId::new(), name)
    }

    /// Creates an empty workflow with a known ID.
    #[must_use]
    pub fn with_id(id: WorkflowId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            tags: Vec::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Connects the main ports of two nodes.
    #[must_use]
    pub fn with_edge(mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        self.edges.push(EdgeSpec::new(source, target));
        self
    }

    #[must_use]
    pub fn with_port_edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    /// Returns a node by ID.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|node| &node.id == id)
    }
}

/// Summary view of a workflow (for listings and CLI output).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub node_count: usize,
    pub container_count: usize,
    pub edge_count: usize,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(workflow: &WorkflowDefinition) -> Self {
        Self {
            id: workflow.id,
            name: workflow.name.clone(),
            node_count: workflow.nodes.len(),
            container_count: workflow
                .nodes
                .iter()
                .filter(|node| node.kind.is_container())
                .count(),
            edge_count: workflow.edges.len(),
        }
    }
}
