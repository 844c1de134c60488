//! Execution state of a workflow run.
//!
//! The [`ExecutionContext`] is the whole mutable record of one run: status,
//! per-node records, node outputs and workflow variables. It is passed
//! explicitly through the scheduler and serialized as the checkpoint;
//! resuming from a deserialized copy continues where the run left off.

use crate::container::ContainerState;
use crate::error::{ContainerFrame, ExecutionError};
use crate::item::DataItem;
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use klikkflow_core::{ExecutionId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;

/// The overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not started.
    #[default]
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The state of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet reached.
    #[default]
    Idle,
    /// All upstream nodes completed; waiting for its turn.
    Pending,
    Running,
    Completed,
    Failed,
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Manual,
    Trigger,
    Webhook,
    /// Re-run of part of an earlier execution.
    Retry,
}

/// Per-node bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRunRecord {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Attempts made by the latest execution, retries included.
    #[serde(default)]
    pub attempts: u32,
    /// Failure message, also kept when the node continued on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final state of a container node's last invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_state: Option<ContainerState>,
}

/// Why a run ended in `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    /// Containers the failing node ran in, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<ContainerFrame>,
    pub timestamp: DateTime<Utc>,
}

impl RunError {
    #[must_use]
    pub fn from_execution(error: &ExecutionError, node_type: Option<&str>) -> Self {
        Self {
            message: error.to_string(),
            node_id: error.node_id().cloned(),
            node_type: node_type.map(str::to_string),
            frames: error.frames().to_vec(),
            timestamp: Utc::now(),
        }
    }
}

/// The mutable record of one run, and its checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub status: ExecutionStatus,
    /// Data the run was triggered with, kept so triggers can be re-run.
    #[serde(default)]
    pub trigger_data: JsonValue,
    /// Main-port output of every completed node.
    #[serde(default)]
    pub node_outputs: BTreeMap<NodeId, Vec<DataItem>>,
    /// Named non-main port outputs, e.g. a condition's `true` and `false`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub port_outputs: BTreeMap<NodeId, BTreeMap<String, Vec<DataItem>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<NodeId>,
    /// Workflow-scoped variables, written through executor results.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    #[serde(default)]
    pub node_states: BTreeMap<NodeId, NodeRunRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl ExecutionContext {
    /// Creates a pending context.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, mode: ExecutionMode, trigger_data: JsonValue) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            workflow_id,
            mode,
            status: ExecutionStatus::Pending,
            trigger_data,
            node_outputs: BTreeMap::new(),
            port_outputs: BTreeMap::new(),
            current_node: None,
            variables: Map::new(),
            node_states: BTreeMap::new(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Moves to `running`, keeping the original start time on resume.
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.finished_at = None;
        self.error = None;
    }

    /// Settles the run. Already terminal runs are left untouched.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<RunError>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.current_node = None;
        self.finished_at = Some(Utc::now());
    }

    /// How long the run took, once it has finished.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Main-port output of a node.
    #[must_use]
    pub fn output(&self, node_id: &NodeId) -> Option<&[DataItem]> {
        self.node_outputs.get(node_id).map(Vec::as_slice)
    }

    /// Output of a node on a named port. `main` reads the main output.
    #[must_use]
    pub fn port_output(&self, node_id: &NodeId, port: &str) -> Option<&[DataItem]> {
        if port == crate::edge::MAIN_PORT {
            return self.output(node_id);
        }
        self.port_outputs
            .get(node_id)
            .and_then(|ports| ports.get(port))
            .map(Vec::as_slice)
    }

    #[must_use]
    pub fn node_status(&self, node_id: &NodeId) -> NodeStatus {
        self.node_states
            .get(node_id)
            .map_or(NodeStatus::Idle, |record| record.status)
    }

    /// The record of a node, created idle on first access.
    pub fn record_mut(&mut self, node_id: &NodeId) -> &mut NodeRunRecord {
        self.node_states.entry(node_id.clone()).or_default()
    }

    /// Forgets everything a node produced, returning it to idle.
    pub fn reset_node(&mut self, node_id: &NodeId) {
        self.node_outputs.remove(node_id);
        self.port_outputs.remove(node_id);
        self.node_states.remove(node_id);
    }
}

/// Events published while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        mode: ExecutionMode,
        timestamp: DateTime<Utc>,
    },
    NodeStatusChanged {
        execution_id: ExecutionId,
        node_id: NodeId,
        status: NodeStatus,
        timestamp: DateTime<Utc>,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// Returns the execution this event belongs to.
    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::NodeStatusChanged { execution_id, .. }
            | Self::ExecutionFinished { execution_id, .. } => *execution_id,
        }
    }

    /// Returns the timestamp of this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ExecutionStarted { timestamp, .. }
            | Self::NodeStatusChanged { timestamp, .. }
            | Self::ExecutionFinished { timestamp, .. } => *timestamp,
        }
    }
}
