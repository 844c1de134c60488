//! Workflow node types and configurations.
//!
//! Nodes are the building blocks of workflows. Each node has:
//! - An ID unique within the workflow
//! - A closed `type` tag selecting its typed configuration
//! - Parameters, resolved through expressions before every execution
//! - Settings controlling retries and failure handling
//!
//! Containers (loop, parallel, conditional, try-catch, batch) own the ids of
//! their children; children never point back at their container except
//! through the optional, validated `parentContainerId`.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Identifier of a node, unique within a workflow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The kinds of container nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerKind {
    Loop,
    Parallel,
    Conditional,
    TryCatch,
    Batch,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::Conditional => "conditional",
            Self::TryCatch => "try-catch",
            Self::Batch => "batch",
        };
        f.write_str(name)
    }
}

/// Configuration for trigger nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    /// What fires the trigger (`manual`, `webhook`, `schedule`, ...).
    /// Informational; callers invoke the engine directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Configuration for action nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionConfig {
    /// Name of the operation in the executor registry.
    pub operation: String,
}

/// Configuration for condition nodes.
///
/// Items for which the condition holds leave on the `true` port, the rest
/// on the `false` port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    pub condition: String,
}

/// Configuration for AI agent nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAgentConfig {
    /// Model override; the backend's default model when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Prompt template, resolved per item.
    pub prompt: String,
    /// System prompt template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

/// How a loop container produces its iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// One iteration per element of the collection.
    #[default]
    #[serde(alias = "for")]
    Foreach,
    /// Iterate while the condition holds, feeding each iteration's output
    /// into the next one.
    While,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    #[serde(default)]
    pub mode: LoopMode,
    /// Collection to iterate: a JSON array, or an expression evaluating to
    /// one. Defaults to the container's input items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<JsonValue>,
    /// Continuation condition for `while` loops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Iteration cap; the engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub iteration_delay_ms: u64,
    pub nodes: Vec<NodeId>,
}

/// What a parallel container does when one of its branches fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStrategy {
    /// Abort the remaining branches and fail the container.
    #[default]
    FailFast,
    /// Let every branch finish; failed branches yield error items.
    CollectErrors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelConfig {
    /// Maximum branches in flight; the engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default = "default_items_per_branch")]
    pub items_per_branch: usize,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    pub nodes: Vec<NodeId>,
}

fn default_items_per_branch() -> usize {
    1
}

/// One guarded branch of a conditional container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub name: String,
    pub condition: String,
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalConfig {
    pub branches: Vec<BranchSpec>,
    /// Nodes taking items no branch claimed. Unclaimed items are dropped
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Vec<NodeId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TryCatchConfig {
    #[serde(rename = "try")]
    pub try_nodes: Vec<NodeId>,
    #[serde(rename = "catch", default)]
    pub catch_nodes: Vec<NodeId>,
    /// Retries applied to the `try` subgraph before the catch path runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    pub batch_size: usize,
    #[serde(default)]
    pub inter_batch_delay_ms: u64,
    pub nodes: Vec<NodeId>,
}

/// A child list of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The body of a loop, parallel or batch container.
    Body,
    /// A conditional branch, by position.
    Branch(usize),
    /// The default branch of a conditional container.
    Default,
    Try,
    Catch,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body => write!(f, "nodes"),
            Self::Branch(index) => write!(f, "branches[{index}]"),
            Self::Default => write!(f, "default"),
            Self::Try => write!(f, "try"),
            Self::Catch => write!(f, "catch"),
        }
    }
}

/// The type of a node and its typed configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeKind {
    Trigger(TriggerConfig),
    Action(ActionConfig),
    Condition(ConditionConfig),
    AiAgent(AiAgentConfig),
    LoopContainer(LoopConfig),
    ParallelContainer(ParallelConfig),
    ConditionalContainer(ConditionalConfig),
    TryCatchContainer(TryCatchConfig),
    BatchContainer(BatchConfig),
}

impl NodeKind {
    /// The wire name of the type tag.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Trigger(_) => "trigger",
            Self::Action(_) => "action",
            Self::Condition(_) => "condition",
            Self::AiAgent(_) => "ai-agent",
            Self::LoopContainer(_) => "loop-container",
            Self::ParallelContainer(_) => "parallel-container",
            Self::ConditionalContainer(_) => "conditional-container",
            Self::TryCatchContainer(_) => "try-catch-container",
            Self::BatchContainer(_) => "batch-container",
        }
    }

    /// The container kind, or `None` for leaf nodes.
    #[must_use]
    pub fn container_kind(&self) -> Option<ContainerKind> {
        match self {
            Self::Trigger(_) | Self::Action(_) | Self::Condition(_) | Self::AiAgent(_) => None,
            Self::LoopContainer(_) => Some(ContainerKind::Loop),
            Self::ParallelContainer(_) => Some(ContainerKind::Parallel),
            Self::ConditionalContainer(_) => Some(ContainerKind::Conditional),
            Self::TryCatchContainer(_) => Some(ContainerKind::TryCatch),
            Self::BatchContainer(_) => Some(ContainerKind::Batch),
        }
    }

    #[must_use]
    pub fn is_container(&self) -> bool {
        self.container_kind().is_some()
    }

    /// The child lists owned by this node, in slot order. Empty for leaves.
    #[must_use]
    pub fn child_slots(&self) -> Vec<(Slot, &[NodeId])> {
        match self {
            Self::Trigger(_) | Self::Action(_) | Self::Condition(_) | Self::AiAgent(_) => {
                Vec::new()
            }
            Self::LoopContainer(config) => vec![(Slot::Body, config.nodes.as_slice())],
            Self::ParallelContainer(config) => vec![(Slot::Body, config.nodes.as_slice())],
            Self::BatchContainer(config) => vec![(Slot::Body, config.nodes.as_slice())],
            Self::ConditionalContainer(config) => {
                let mut slots: Vec<(Slot, &[NodeId])> = config
                    .branches
                    .iter()
                    .enumerate()
                    .map(|(i, branch)| (Slot::Branch(i), branch.nodes.as_slice()))
                    .collect();
                if let Some(default) = &config.default {
                    slots.push((Slot::Default, default.as_slice()));
                }
                slots
            }
            Self::TryCatchContainer(config) => vec![
                (Slot::Try, config.try_nodes.as_slice()),
                (Slot::Catch, config.catch_nodes.as_slice()),
            ],
        }
    }
}

/// What happens when a node still fails after its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorPolicy {
    /// Halt the run.
    #[default]
    #[serde(alias = "stopWorkflow")]
    Stop,
    /// Record the failure and emit an error item downstream.
    #[serde(alias = "continueRegularOutput", alias = "continueErrorOutput")]
    Continue,
}

/// Per-node execution settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSettings {
    #[serde(default)]
    pub on_error: ErrorPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Legacy retry switch, used with `max_tries` and `wait_between`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retry_on_fail: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,
    /// Milliseconds between legacy retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_between: Option<u64>,
    /// A disabled node passes its input through unchanged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    /// Emit one empty item when the node produced none.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub always_output: bool,
}

impl NodeSettings {
    /// The effective retry policy: the explicit `retry` block, else the
    /// legacy fields when `retryOnFail` is set.
    #[must_use]
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        if let Some(policy) = &self.retry {
            return Some(policy.clone());
        }
        self.retry_on_fail.then(|| {
            RetryPolicy::fixed(self.max_tries.unwrap_or(3), self.wait_between.unwrap_or(1_000))
        })
    }
}

/// Canvas position. Not used by execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A node as declared in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Raw parameter values; strings may contain `{{ }}` expressions.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_container_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(flatten)]
    pub settings: NodeSettings,
}

impl NodeSpec {
    /// Creates a node with no parameters and default settings.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            parameters: Map::new(),
            parent_container_id: None,
            position: None,
            settings: NodeSettings::default(),
        }
    }

    #[must_use]
    pub fn trigger(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Trigger(TriggerConfig::default()))
    }

    #[must_use]
    pub fn action(id: impl Into<NodeId>, operation: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Action(ActionConfig {
                operation: operation.into(),
            }),
        )
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_parent(mut self, container: impl Into<NodeId>) -> Self {
        self.parent_container_id = Some(container.into());
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: NodeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Display name, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}
