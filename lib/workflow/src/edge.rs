//! Edge types for workflow graphs.
//!
//! Edges connect a named output port of one node to a named input port of
//! another. Both ports default to `main`; condition nodes additionally emit
//! on `true` and `false`.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// Name of the default port.
pub const MAIN_PORT: &str = "main";

fn main_port() -> String {
    MAIN_PORT.to_string()
}

fn is_main(port: &str) -> bool {
    port == MAIN_PORT
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSpec {
    pub source: NodeId,
    #[serde(default = "main_port", skip_serializing_if = "is_main")]
    pub source_port: String,
    pub target: NodeId,
    #[serde(default = "main_port", skip_serializing_if = "is_main")]
    pub target_port: String,
}

impl EdgeSpec {
    /// Creates an edge between the main ports of two nodes.
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            source_port: main_port(),
            target: target.into(),
            target_port: main_port(),
        }
    }

    /// Creates an edge leaving a named output port.
    #[must_use]
    pub fn from_port(
        source: impl Into<NodeId>,
        source_port: impl Into<String>,
        target: impl Into<NodeId>,
    ) -> Self {
        Self {
            source_port: source_port.into(),
            ..Self::new(source, target)
        }
    }

    /// Whether the edge leaves the source's main port.
    #[must_use]
    pub fn from_main(&self) -> bool {
        is_main(&self.source_port)
    }
}

impl std::fmt::Display for EdgeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.source, self.source_port, self.target, self.target_port
        )
    }
}
