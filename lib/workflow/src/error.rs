//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `GraphError`: structural problems found while validating a definition
//! - `ExecutionError`: failures while a run is in progress, carrying the
//!   failing node and the container frames it failed in
//! - `WorkflowError`: engine operations that fail before or around a run
//!   (wrapped in a `Report` at the public boundary)

use crate::execution::ExecutionStatus;
use crate::executor::NodeExecutionError;
use crate::node::{ContainerKind, NodeId, Slot};
use crate::persistence::PersistenceError;
use klikkflow_core::{ExecutionId, WorkflowId};
use klikkflow_expression::ExpressionError;
use klikkflow_integration::CredentialError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors from validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two nodes share an ID.
    DuplicateNode { node_id: NodeId },
    /// A node ID is referenced but never declared.
    UnknownNode { node_id: NodeId, referenced_by: String },
    /// A node is listed by more than one container slot.
    MultipleParents { node_id: NodeId },
    /// A container contains itself, directly or transitively.
    ContainmentCycle { node_id: NodeId },
    /// `parentContainerId` disagrees with the container child lists.
    ParentMismatch {
        node_id: NodeId,
        declared: NodeId,
        actual: Option<NodeId>,
    },
    /// An edge joins nodes of different scopes.
    CrossScopeEdge { source: NodeId, target: NodeId },
    /// The graph contains a cycle outside a loop container.
    CycleDetected { nodes: Vec<NodeId> },
    /// A node's configuration is unusable.
    InvalidConfig { node_id: NodeId, reason: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::UnknownNode {
                node_id,
                referenced_by,
            } => write!(f, "unknown node '{node_id}' referenced by {referenced_by}"),
            Self::MultipleParents { node_id } => {
                write!(f, "node '{node_id}' is listed by more than one container")
            }
            Self::ContainmentCycle { node_id } => {
                write!(f, "container '{node_id}' contains itself")
            }
            Self::ParentMismatch {
                node_id,
                declared,
                actual,
            } => match actual {
                Some(actual) => write!(
                    f,
                    "node '{node_id}' declares parent '{declared}' but is listed by '{actual}'"
                ),
                None => write!(
                    f,
                    "node '{node_id}' declares parent '{declared}' but no container lists it"
                ),
            },
            Self::CrossScopeEdge { source, target } => {
                write!(f, "edge {source} -> {target} crosses a container boundary")
            }
            Self::CycleDetected { nodes } => {
                let names: Vec<&str> = nodes.iter().map(NodeId::as_str).collect();
                write!(f, "graph contains a cycle through [{}]", names.join(", "))
            }
            Self::InvalidConfig { node_id, reason } => {
                write!(f, "invalid configuration for node '{node_id}': {reason}")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Where inside a container an error happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum FrameStep {
    /// Loop iteration.
    Iteration { index: usize },
    /// Parallel partition.
    Branch { index: usize },
    /// Conditional route taken by one item.
    Route { branch: String, item: usize },
    /// The `try` subgraph, for one item.
    Try { item: usize },
    /// The `catch` subgraph, for one item.
    Catch { item: usize },
    Batch { index: usize },
}

impl fmt::Display for FrameStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iteration { index } => write!(f, "iteration {index}"),
            Self::Branch { index } => write!(f, "branch {index}"),
            Self::Route { branch, item } => write!(f, "branch '{branch}' item {item}"),
            Self::Try { item } => write!(f, "try item {item}"),
            Self::Catch { item } => write!(f, "catch item {item}"),
            Self::Batch { index } => write!(f, "batch {index}"),
        }
    }
}

/// One container level an error passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerFrame {
    pub container_id: NodeId,
    pub kind: ContainerKind,
    pub step: FrameStep,
}

impl ContainerFrame {
    #[must_use]
    pub fn new(container_id: NodeId, kind: ContainerKind, step: FrameStep) -> Self {
        Self {
            container_id,
            kind,
            step,
        }
    }
}

impl fmt::Display for ContainerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' {}", self.kind, self.container_id, self.step)
    }
}

/// Why a single node failed.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeFailure {
    /// The node's own logic failed.
    Execution(NodeExecutionError),
    /// A parameter expression could not be resolved.
    Expression(ExpressionError),
    /// The node's credentials could not be resolved.
    Credentials(CredentialError),
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execution(err) => write!(f, "{err}"),
            Self::Expression(err) => write!(f, "{err}"),
            Self::Credentials(err) => write!(f, "{err}"),
        }
    }
}

impl From<NodeExecutionError> for NodeFailure {
    fn from(err: NodeExecutionError) -> Self {
        Self::Execution(err)
    }
}

impl From<ExpressionError> for NodeFailure {
    fn from(err: ExpressionError) -> Self {
        Self::Expression(err)
    }
}

impl From<CredentialError> for NodeFailure {
    fn from(err: CredentialError) -> Self {
        Self::Credentials(err)
    }
}

/// Errors during workflow execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// A node failed after its retries.
    NodeFailed {
        node_id: NodeId,
        failure: NodeFailure,
        /// Containers the node ran in, outermost first.
        frames: Vec<ContainerFrame>,
    },
    /// A loop container reached its iteration cap.
    IterationLimitExceeded {
        container_id: NodeId,
        max_iterations: u32,
        frames: Vec<ContainerFrame>,
    },
    /// The run's cancellation flag was raised.
    CancellationRequested,
}

impl ExecutionError {
    #[must_use]
    pub fn node_failed(node_id: NodeId, failure: impl Into<NodeFailure>) -> Self {
        Self::NodeFailed {
            node_id,
            failure: failure.into(),
            frames: Vec::new(),
        }
    }

    /// Records that the error escaped through an enclosing container.
    #[must_use]
    pub fn within(mut self, frame: ContainerFrame) -> Self {
        match &mut self {
            Self::NodeFailed { frames, .. } | Self::IterationLimitExceeded { frames, .. } => {
                frames.insert(0, frame);
            }
            Self::CancellationRequested => {}
        }
        self
    }

    /// The node the error is attributed to.
    #[must_use]
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::NodeFailed { node_id, .. } => Some(node_id),
            Self::IterationLimitExceeded { container_id, .. } => Some(container_id),
            Self::CancellationRequested => None,
        }
    }

    #[must_use]
    pub fn frames(&self) -> &[ContainerFrame] {
        match self {
            Self::NodeFailed { frames, .. } | Self::IterationLimitExceeded { frames, .. } => {
                frames
            }
            Self::CancellationRequested => &[],
        }
    }

    /// Whether node failure policies (retry, continue) may absorb this error.
    /// Iteration limits and cancellation always propagate.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NodeFailed { .. })
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeFailed {
                node_id, failure, ..
            } => write!(f, "node '{node_id}' failed: {failure}")?,
            Self::IterationLimitExceeded {
                container_id,
                max_iterations,
                ..
            } => write!(
                f,
                "loop '{container_id}' exceeded its limit of {max_iterations} iterations"
            )?,
            Self::CancellationRequested => return write!(f, "execution cancelled"),
        }
        for frame in self.frames() {
            write!(f, " [in {frame}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutionError {}

/// High-level workflow errors.
///
/// Returned from engine operations wrapped in a rootcause `Report`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// The definition failed validation.
    InvalidGraph {
        workflow_id: WorkflowId,
        error: GraphError,
    },
    /// Workflow not found.
    NotFound { workflow_id: WorkflowId },
    /// The repository failed.
    Persistence(PersistenceError),
    /// A node referenced by an operation does not exist.
    UnknownNode { node_id: NodeId },
    /// The checkpoint belongs to another workflow.
    WorkflowMismatch {
        expected: WorkflowId,
        actual: WorkflowId,
    },
    /// The execution already settled and cannot be resumed.
    NotResumable {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidGraph { workflow_id, error } => {
                write!(f, "workflow {workflow_id} is invalid: {error}")
            }
            Self::NotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::Persistence(err) => write!(f, "persistence failed: {err}"),
            Self::UnknownNode { node_id } => write!(f, "unknown node: {node_id}"),
            Self::WorkflowMismatch { expected, actual } => write!(
                f,
                "checkpoint belongs to workflow {actual}, not {expected}"
            ),
            Self::NotResumable {
                execution_id,
                status,
            } => write!(f, "execution {execution_id} is {status} and cannot be resumed"),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<PersistenceError> for WorkflowError {
    fn from(err: PersistenceError) -> Self {
        Self::Persistence(err)
    }
}

/// Describes a container slot for error messages.
pub(crate) fn slot_owner(container: &NodeId, slot: Slot) -> String {
    format!("container '{container}' {slot}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        let err = GraphError::CycleDetected {
            nodes: vec![NodeId::new("a"), NodeId::new("b")],
        };
        assert_eq!(err.to_string(), "graph contains a cycle through [a, b]");

        let err = GraphError::UnknownNode {
            node_id: NodeId::new("ghost"),
            referenced_by: slot_owner(&NodeId::new("each"), Slot::Body),
        };
        assert!(err.to_string().contains("container 'each' nodes"));
    }

    #[test]
    fn execution_error_frames_are_outermost_first() {
        let err = ExecutionError::node_failed(
            NodeId::new("double"),
            NodeExecutionError::ExecutionFailed {
                message: "boom".to_string(),
            },
        )
        .within(ContainerFrame::new(
            NodeId::new("inner"),
            ContainerKind::Batch,
            FrameStep::Batch { index: 1 },
        ))
        .within(ContainerFrame::new(
            NodeId::new("outer"),
            ContainerKind::Loop,
            FrameStep::Iteration { index: 2 },
        ));

        assert_eq!(err.frames()[0].container_id, NodeId::new("outer"));
        assert_eq!(
            err.to_string(),
            "node 'double' failed: execution failed: boom [in loop 'outer' iteration 2] [in batch 'inner' batch 1]"
        );
        assert!(err.is_recoverable());
    }

    #[test]
    fn limits_and_cancellation_are_not_recoverable() {
        let err = ExecutionError::IterationLimitExceeded {
            container_id: NodeId::new("poll"),
            max_iterations: 5,
            frames: Vec::new(),
        };
        assert!(!err.is_recoverable());
        assert_eq!(err.node_id(), Some(&NodeId::new("poll")));
        assert!(!ExecutionError::CancellationRequested.is_recoverable());
        assert_eq!(
            ExecutionError::CancellationRequested
                .within(ContainerFrame::new(
                    NodeId::new("x"),
                    ContainerKind::Loop,
                    FrameStep::Iteration { index: 0 }
                ))
                .frames()
                .len(),
            0
        );
    }

    #[test]
    fn frame_serializes_with_scope_tag() {
        let frame = ContainerFrame::new(
            NodeId::new("route"),
            ContainerKind::Conditional,
            FrameStep::Route {
                branch: "active".to_string(),
                item: 0,
            },
        );
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value["containerId"], "route");
        assert_eq!(value["kind"], "conditional");
        assert_eq!(value["step"]["scope"], "route");
    }

    #[test]
    fn workflow_error_display() {
        let workflow_id = WorkflowId::new();
        let err = WorkflowError::NotFound { workflow_id };
        assert!(err.to_string().contains("workflow not found"));
    }
}
