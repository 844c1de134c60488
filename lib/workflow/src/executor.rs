//! Leaf node execution.
//!
//! The scheduler resolves a node's parameters and credentials, then hands a
//! [`NodeInvocation`] to the [`ExecutorRegistry`]. The registry dispatches
//! on the node kind:
//!
//! - `trigger`: passes the trigger items through
//! - `action`: looks up a [`NodeExecutor`] by operation name
//! - `condition`: routes items to the `true` and `false` ports
//! - `ai-agent`: calls the injected [`LlmBackend`]
//!
//! Containers never reach the registry; the container runtime runs them.

use crate::builtin;
use crate::edge::MAIN_PORT;
use crate::item::DataItem;
use crate::node::{AiAgentConfig, NodeKind, NodeSpec};
use async_trait::async_trait;
use klikkflow_ai::{LlmBackend, LlmRequest};
use klikkflow_core::ExecutionId;
use klikkflow_expression::truthy;
use klikkflow_integration::CredentialBundle;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Port carrying items whose condition held.
pub const TRUE_PORT: &str = "true";
/// Port carrying items whose condition did not hold.
pub const FALSE_PORT: &str = "false";

/// Everything a node needs to run once.
#[derive(Debug, Clone)]
pub struct NodeInvocation<'a> {
    pub execution_id: ExecutionId,
    pub node: &'a NodeSpec,
    /// Input items, concatenated across incoming edges.
    pub items: Vec<DataItem>,
    /// Parameters resolved against each input item. Holds a single entry,
    /// resolved against an empty item, when there is no input.
    pub parameters: Vec<Map<String, JsonValue>>,
    pub credentials: CredentialBundle,
    /// Workflow variables as of the start of this node.
    pub variables: Map<String, JsonValue>,
}

impl NodeInvocation<'_> {
    /// Resolved parameters for input item `index`.
    #[must_use]
    pub fn params(&self, index: usize) -> Option<&Map<String, JsonValue>> {
        self.parameters.get(index).or_else(|| self.parameters.first())
    }

    /// A resolved parameter for input item `index`.
    #[must_use]
    pub fn param(&self, index: usize, name: &str) -> Option<&JsonValue> {
        self.params(index).and_then(|params| params.get(name))
    }
}

/// What a node produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    /// Main-port items.
    pub items: Vec<DataItem>,
    /// Items on named ports other than `main`.
    pub ports: BTreeMap<String, Vec<DataItem>>,
    /// Variables to write into the run.
    pub variables: Map<String, JsonValue>,
}

impl NodeOutput {
    #[must_use]
    pub fn items(items: Vec<DataItem>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: impl Into<String>, items: Vec<DataItem>) -> Self {
        let port = port.into();
        if port == MAIN_PORT {
            self.items = items;
        } else {
            self.ports.insert(port, items);
        }
        self
    }

    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

/// Logic behind one `action` operation.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Executes the node.
    ///
    /// # Errors
    ///
    /// Returns a [`NodeExecutionError`] when the node fails; the scheduler
    /// applies the node's retry and error policy.
    async fn execute(&self, invocation: &NodeInvocation<'_>)
    -> Result<NodeOutput, NodeExecutionError>;
}

/// Errors from node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeExecutionError {
    /// Input or parameters are unusable.
    InvalidInput { message: String },
    /// Execution failed.
    ExecutionFailed { message: String },
    /// No executor is registered for the operation.
    UnsupportedOperation { operation: String },
    /// External service error.
    ExternalServiceError { service: String, message: String },
    /// Timeout.
    Timeout,
}

impl std::fmt::Display for NodeExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::ExecutionFailed { message } => write!(f, "execution failed: {message}"),
            Self::UnsupportedOperation { operation } => {
                write!(f, "unsupported operation: {operation}")
            }
            Self::ExternalServiceError { service, message } => {
                write!(f, "external service error ({service}): {message}")
            }
            Self::Timeout => write!(f, "execution timed out"),
        }
    }
}

impl std::error::Error for NodeExecutionError {}

/// Dispatches leaf nodes to their logic.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    actions: HashMap<String, Arc<dyn NodeExecutor>>,
    llm: Option<Arc<dyn LlmBackend>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut operations: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        operations.sort_unstable();
        f.debug_struct("ExecutorRegistry")
            .field("operations", &operations)
            .field("llm", &self.llm.as_ref().map(|llm| llm.model().to_string()))
            .finish()
    }
}

impl ExecutorRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in operations: `noop`, `set`, `sum`,
    /// `set-variable`, `stop-and-error` and `wait`.
    #[must_use]
    pub fn with_builtins() -> Self {
        builtin::register(Self::new())
    }

    /// Registers (or replaces) the executor of an operation.
    #[must_use]
    pub fn register(mut self, operation: impl Into<String>, executor: impl NodeExecutor + 'static) -> Self {
        self.actions.insert(operation.into(), Arc::new(executor));
        self
    }

    /// Sets the backend used by `ai-agent` nodes.
    #[must_use]
    pub fn with_llm(mut self, backend: Arc<dyn LlmBackend>) -> Self {
        self.llm = Some(backend);
        self
    }

    #[must_use]
    pub fn has_operation(&self, operation: &str) -> bool {
        self.actions.contains_key(operation)
    }

    /// Executes a leaf node.
    ///
    /// # Errors
    ///
    /// Returns the node's failure, [`NodeExecutionError::UnsupportedOperation`]
    /// for unknown operations, or [`NodeExecutionError::InvalidInput`] when
    /// handed a container.
    pub async fn execute(
        &self,
        invocation: &NodeInvocation<'_>,
    ) -> Result<NodeOutput, NodeExecutionError> {
        match &invocation.node.kind {
            NodeKind::Trigger(_) => Ok(NodeOutput::items(invocation.items.clone())),
            NodeKind::Action(config) => {
                let executor = self.actions.get(&config.operation).ok_or_else(|| {
                    NodeExecutionError::UnsupportedOperation {
                        operation: config.operation.clone(),
                    }
                })?;
                debug!(node_id = %invocation.node.id, operation = %config.operation, "dispatching action");
                executor.execute(invocation).await
            }
            NodeKind::Condition(_) => Ok(route(invocation)),
            NodeKind::AiAgent(config) => self.generate(config, invocation).await,
            NodeKind::LoopContainer(_)
            | NodeKind::ParallelContainer(_)
            | NodeKind::ConditionalContainer(_)
            | NodeKind::TryCatchContainer(_)
            | NodeKind::BatchContainer(_) => Err(NodeExecutionError::InvalidInput {
                message: format!(
                    "{} nodes are run by the container runtime",
                    invocation.node.kind.type_name()
                ),
            }),
        }
    }

    async fn generate(
        &self,
        config: &AiAgentConfig,
        invocation: &NodeInvocation<'_>,
    ) -> Result<NodeOutput, NodeExecutionError> {
        let backend = self
            .llm
            .as_ref()
            .ok_or_else(|| NodeExecutionError::ExternalServiceError {
                service: "llm".to_string(),
                message: "no LLM backend configured".to_string(),
            })?;

        let mut items = Vec::with_capacity(invocation.items.len());
        for (index, _) in invocation.items.iter().enumerate() {
            let prompt = invocation
                .param(index, "prompt")
                .map(klikkflow_expression::display)
                .unwrap_or_else(|| config.prompt.clone());
            let mut request = LlmRequest::new(prompt);
            let system = invocation
                .param(index, "system")
                .map(klikkflow_expression::display)
                .or_else(|| config.system.clone());
            if let Some(system) = system {
                request = request.with_system(system);
            }
            if let Some(model) = &config.model {
                request = request.with_model(model.clone());
            }
            if let Some(schema) = invocation.param(index, "outputSchema") {
                request = request.with_output_schema(schema.clone());
            }
            if let Some(temperature) = invocation.param(index, "temperature") {
                let temperature = temperature.as_f64().ok_or_else(|| {
                    NodeExecutionError::InvalidInput {
                        message: format!("temperature must be a number, got {temperature}"),
                    }
                })?;
                #[allow(clippy::cast_possible_truncation)]
                let temperature = temperature as f32;
                request = request.with_temperature(temperature);
            }
            if let Some(max_tokens) = invocation.param(index, "maxTokens") {
                let max_tokens = max_tokens
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| NodeExecutionError::InvalidInput {
                        message: format!("maxTokens must be a positive integer, got {max_tokens}"),
                    })?;
                request = request.with_max_tokens(max_tokens);
            }

            let response = backend.generate(&request).await.map_err(|e| {
                NodeExecutionError::ExternalServiceError {
                    service: provider_name(backend.as_ref()),
                    message: e.to_string(),
                }
            })?;

            let mut json = json!({
                "response": response.content,
                "model": response.model,
                "usage": {
                    "inputTokens": response.usage.input_tokens,
                    "outputTokens": response.usage.output_tokens,
                },
            });
            if let Some(structured) = response.structured_output {
                json["output"] = structured;
            }
            items.push(DataItem::new(json).with_paired_item(index));
        }
        Ok(NodeOutput::items(items))
    }
}

fn provider_name(backend: &dyn LlmBackend) -> String {
    serde_json::to_value(backend.provider())
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "llm".to_string())
}

/// Executor with scripted behaviour.
///
/// Counts its calls; clones share the count.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    /// Calls that fail before the executor starts succeeding.
    fail_first: u32,
    fail_with: Option<NodeExecutionError>,
    /// Json of every output item; the input passes through when absent.
    output: Option<JsonValue>,
    calls: Arc<Mutex<u32>>,
}

impl MockExecutor {
    /// Passes its input through.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Emits `output` once per input item.
    #[must_use]
    pub fn succeeding(output: JsonValue) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    /// Fails every call.
    #[must_use]
    pub fn failing(error: NodeExecutionError) -> Self {
        Self::flaky(u32::MAX, error)
    }

    /// Fails the first `times` calls, then passes its input through.
    #[must_use]
    pub fn flaky(times: u32, error: NodeExecutionError) -> Self {
        Self {
            fail_first: times,
            fail_with: Some(error),
            ..Self::default()
        }
    }

    /// Calls made so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.lock().map_or(0, |calls| *calls)
    }
}

#[async_trait]
impl NodeExecutor for MockExecutor {
    async fn execute(
        &self,
        invocation: &NodeInvocation<'_>,
    ) -> Result<NodeOutput, NodeExecutionError> {
        let call = match self.calls.lock() {
            Ok(mut calls) => {
                *calls += 1;
                *calls
            }
            Err(_) => 0,
        };
        match &self.fail_with {
            Some(error) if call <= self.fail_first => return Err(error.clone()),
            _ => {}
        }
        let items = match &self.output {
            Some(output) => {
                let count = invocation.items.len().max(1);
                (0..count).map(|_| DataItem::new(output.clone())).collect()
            }
            None => invocation.items.clone(),
        };
        Ok(NodeOutput::items(items))
    }
}

/// Splits items by the per-item `condition` parameter the scheduler
/// resolved. Matching items also leave on the main port.
fn route(invocation: &NodeInvocation<'_>) -> NodeOutput {
    let (mut matched, mut rest) = (Vec::new(), Vec::new());
    for (index, item) in invocation.items.iter().enumerate() {
        let holds = invocation
            .param(index, "condition")
            .is_some_and(truthy);
        let item = item.clone().with_paired_item(index);
        if holds {
            matched.push(item);
        } else {
            rest.push(item);
        }
    }
    NodeOutput::items(matched.clone())
        .with_port(TRUE_PORT, matched)
        .with_port(FALSE_PORT, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{AiAgentConfig, ConditionConfig};
    use klikkflow_ai::ScriptedBackend;

    fn invocation<'a>(node: &'a NodeSpec, items: Vec<JsonValue>, params: Vec<JsonValue>) -> NodeInvocation<'a> {
        NodeInvocation {
            execution_id: ExecutionId::new(),
            node,
            items: items.into_iter().map(DataItem::new).collect(),
            parameters: params
                .into_iter()
                .map(|p| p.as_object().cloned().unwrap_or_default())
                .collect(),
            credentials: CredentialBundle::new(),
            variables: Map::new(),
        }
    }

    #[tokio::test]
    async fn trigger_passes_items_through() {
        let node = NodeSpec::trigger("start");
        let inv = invocation(&node, vec![json!({"a": 1})], vec![json!({})]);
        let output = ExecutorRegistry::new().execute(&inv).await.expect("trigger");
        assert_eq!(output.items, inv.items);
    }

    #[tokio::test]
    async fn unknown_operation_is_reported() {
        let node = NodeSpec::action("x", "teleport");
        let inv = invocation(&node, vec![json!({})], vec![json!({})]);
        let err = ExecutorRegistry::with_builtins()
            .execute(&inv)
            .await
            .expect_err("unknown");
        assert_eq!(
            err,
            NodeExecutionError::UnsupportedOperation {
                operation: "teleport".to_string()
            }
        );
    }

    #[tokio::test]
    async fn condition_routes_to_ports() {
        let node = NodeSpec::new(
            "check",
            NodeKind::Condition(ConditionConfig {
                condition: "{{ $json.n > 1 }}".to_string(),
            }),
        );
        let inv = invocation(
            &node,
            vec![json!({"n": 1}), json!({"n": 2})],
            vec![json!({"condition": false}), json!({"condition": true})],
        );
        let output = ExecutorRegistry::new().execute(&inv).await.expect("route");

        assert_eq!(output.items.len(), 1);
        assert_eq!(output.ports[TRUE_PORT][0].json, json!({"n": 2}));
        assert_eq!(output.ports[TRUE_PORT][0].paired_item_index, Some(1));
        assert_eq!(output.ports[FALSE_PORT][0].json, json!({"n": 1}));
    }

    #[tokio::test]
    async fn ai_agent_calls_backend_per_item() {
        let node = NodeSpec::new(
            "summarize",
            NodeKind::AiAgent(AiAgentConfig {
                model: Some("small".to_string()),
                prompt: "unused".to_string(),
                system: None,
            }),
        );
        let registry = ExecutorRegistry::new()
            .with_llm(Arc::new(ScriptedBackend::new().respond("first").respond("second")));
        let inv = invocation(
            &node,
            vec![json!({}), json!({})],
            vec![json!({"prompt": "one"}), json!({"prompt": "two"})],
        );
        let output = registry.execute(&inv).await.expect("generate");

        assert_eq!(output.items[0].json["response"], "first");
        assert_eq!(output.items[1].json["response"], "second");
        assert_eq!(output.items[1].paired_item_index, Some(1));
    }

    #[tokio::test]
    async fn ai_agent_without_backend_fails() {
        let node = NodeSpec::new(
            "summarize",
            NodeKind::AiAgent(AiAgentConfig {
                model: None,
                prompt: "hi".to_string(),
                system: None,
            }),
        );
        let inv = invocation(&node, vec![json!({})], vec![json!({"prompt": "hi"})]);
        let err = ExecutorRegistry::new().execute(&inv).await.expect_err("no backend");
        assert!(matches!(err, NodeExecutionError::ExternalServiceError { .. }));
    }

    #[tokio::test]
    async fn flaky_mock_recovers_after_failures() {
        let node = NodeSpec::action("x", "flaky");
        let mock = MockExecutor::flaky(2, NodeExecutionError::Timeout);
        let registry = ExecutorRegistry::new().register("flaky", mock.clone());
        let inv = invocation(&node, vec![json!({"a": 1})], vec![json!({})]);

        assert_eq!(registry.execute(&inv).await, Err(NodeExecutionError::Timeout));
        assert_eq!(registry.execute(&inv).await, Err(NodeExecutionError::Timeout));
        let output = registry.execute(&inv).await.expect("third call");
        assert_eq!(output.items, inv.items);
        assert_eq!(mock.calls(), 3);
    }

    #[test]
    fn params_fall_back_to_the_first_entry() {
        let node = NodeSpec::action("x", "noop");
        let inv = invocation(&node, Vec::new(), vec![json!({"a": 1})]);
        assert_eq!(inv.param(3, "a"), Some(&json!(1)));
        assert_eq!(inv.param(0, "b"), None);
    }
}
