//! Dependency-order execution of one scope.
//!
//! A scope (the top level, or one container slot) is walked by repeatedly
//! picking the first ready node in declaration order: a node is ready once
//! the sources of all its non-feedback incoming edges have run in this pass.
//! Containers are atomic to the scope they sit in; the container runtime
//! runs their slots as nested scopes over the same [`ExecutionContext`].

use crate::bindings::ItemBindings;
use crate::cancel::CancellationFlag;
use crate::config::EngineConfig;
use crate::error::ExecutionError;
use crate::event::EventSink;
use crate::execution::{ExecutionContext, ExecutionEvent, NodeStatus};
use crate::executor::{ExecutorRegistry, NodeInvocation, NodeOutput};
use crate::graph::{Scope, WorkflowGraph};
use crate::item::DataItem;
use crate::node::{ErrorPolicy, NodeId, NodeKind, NodeSpec};
use crate::persistence::ExecutionRepository;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use klikkflow_expression::{ExpressionError, evaluate, evaluate_condition, resolve_value};
use klikkflow_integration::CredentialResolver;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Everything a run needs besides its context. Cheap to clone; parallel
/// branches each take a clone into their task.
#[derive(Clone)]
pub(crate) struct Scheduler {
    pub(crate) graph: Arc<WorkflowGraph>,
    pub(crate) executors: Arc<ExecutorRegistry>,
    pub(crate) credentials: Arc<dyn CredentialResolver>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) repository: Arc<dyn ExecutionRepository>,
    pub(crate) config: EngineConfig,
    pub(crate) cancel: CancellationFlag,
}

impl Scheduler {
    /// Runs the top-level scope. Nodes already completed in `ctx` are
    /// skipped, which is what makes resume work.
    #[instrument(skip_all, fields(execution_id = %ctx.execution_id, workflow_id = %ctx.workflow_id))]
    pub(crate) async fn run_root(&self, ctx: &mut ExecutionContext) -> Result<(), ExecutionError> {
        let graph = Arc::clone(&self.graph);
        let scope = graph.root();
        let mut done: HashSet<usize> = scope
            .nodes()
            .iter()
            .copied()
            .filter(|&node| ctx.node_status(&graph.node(node).id) == NodeStatus::Completed)
            .collect();
        if !done.is_empty() {
            debug!(skipped = done.len(), "resuming past completed nodes");
        }

        while let Some(node) = self.next_ready(scope, &done) {
            self.check_cancelled()?;
            let input = self.gather_input(scope, node, ctx, None);
            self.run_node(node, ctx, input, None).await?;
            done.insert(node);
            if self.config.checkpoint_each_node {
                self.checkpoint(ctx).await;
            }
        }
        Ok(())
    }

    /// Runs a nested scope once, feeding `entry` to its entry nodes, and
    /// returns the concatenated output of its sinks. An empty scope passes
    /// `entry` through.
    pub(crate) fn run_scope<'a>(
        &'a self,
        scope: &'a Scope,
        ctx: &'a mut ExecutionContext,
        entry: &'a [DataItem],
        iteration: Option<usize>,
    ) -> BoxFuture<'a, Result<Vec<DataItem>, ExecutionError>> {
        async move {
            if scope.is_empty() {
                return Ok(entry.to_vec());
            }
            let mut done = HashSet::new();
            while let Some(node) = self.next_ready(scope, &done) {
                self.check_cancelled()?;
                let input = self.gather_input(scope, node, ctx, Some(entry));
                self.run_node(node, ctx, input, iteration).await?;
                done.insert(node);
            }
            Ok(self.scope_output(scope, ctx))
        }
        .boxed()
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            return Err(ExecutionError::CancellationRequested);
        }
        Ok(())
    }

    /// Saves the context. A failing repository is logged, not fatal.
    pub(crate) async fn checkpoint(&self, ctx: &ExecutionContext) {
        if let Err(e) = self.repository.save_execution_state(ctx).await {
            warn!(execution_id = %ctx.execution_id, error = %e, "failed to save checkpoint");
        }
    }

    pub(crate) async fn publish(&self, event: ExecutionEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "failed to publish execution event");
        }
    }

    fn next_ready(&self, scope: &Scope, done: &HashSet<usize>) -> Option<usize> {
        scope.nodes().iter().copied().find(|node| {
            !done.contains(node)
                && scope
                    .incoming(*node)
                    .iter()
                    .all(|&edge| done.contains(&self.graph.endpoints(edge).0))
        })
    }

    /// Input of a node: the concatenated outputs of its upstream edges. Entry
    /// nodes get the container input when nested; at the top level triggers
    /// get the trigger data and every other entry node gets nothing.
    fn gather_input(
        &self,
        scope: &Scope,
        node: usize,
        ctx: &ExecutionContext,
        entry: Option<&[DataItem]>,
    ) -> Vec<DataItem> {
        if scope.is_entry(node) {
            return match (entry, &self.graph.node(node).kind) {
                (Some(entry), _) => entry.to_vec(),
                (None, NodeKind::Trigger(_)) => DataItem::from_trigger(ctx.trigger_data.clone()),
                (None, _) => Vec::new(),
            };
        }
        scope
            .incoming(node)
            .iter()
            .flat_map(|&edge| {
                let spec = self.graph.edge(edge);
                ctx.port_output(&spec.source, &spec.source_port)
                    .unwrap_or_default()
                    .iter()
                    .cloned()
            })
            .collect()
    }

    fn scope_output(&self, scope: &Scope, ctx: &ExecutionContext) -> Vec<DataItem> {
        scope
            .sinks()
            .iter()
            .flat_map(|&sink| {
                ctx.output(&self.graph.node(sink).id)
                    .unwrap_or_default()
                    .iter()
                    .cloned()
            })
            .collect()
    }

    async fn set_status(&self, ctx: &mut ExecutionContext, node_id: &NodeId, status: NodeStatus) {
        let record = ctx.record_mut(node_id);
        record.status = status;
        match status {
            NodeStatus::Running => {
                record.started_at = Some(Utc::now());
                record.finished_at = None;
                record.attempts = 0;
                record.error = None;
                record.container_state = None;
            }
            NodeStatus::Completed | NodeStatus::Failed => record.finished_at = Some(Utc::now()),
            NodeStatus::Idle | NodeStatus::Pending => {}
        }
        self.publish(ExecutionEvent::NodeStatusChanged {
            execution_id: ctx.execution_id,
            node_id: node_id.clone(),
            status,
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Runs one node and applies its failure policy.
    #[instrument(skip_all, fields(node_id = %self.graph.node(node).id, node_type = self.graph.node(node).kind.type_name()))]
    async fn run_node(
        &self,
        node: usize,
        ctx: &mut ExecutionContext,
        input: Vec<DataItem>,
        iteration: Option<usize>,
    ) -> Result<(), ExecutionError> {
        let graph = Arc::clone(&self.graph);
        let spec = graph.node(node);
        ctx.current_node = Some(spec.id.clone());
        self.set_status(ctx, &spec.id, NodeStatus::Pending).await;
        self.set_status(ctx, &spec.id, NodeStatus::Running).await;

        if spec.settings.disabled {
            debug!("node disabled, passing input through");
            self.complete(ctx, spec, NodeOutput::items(input)).await;
            return Ok(());
        }

        let result = if spec.kind.is_container() {
            self.run_container(node, ctx, input, iteration)
                .await
                .map(|outcome| {
                    debug!(state = ?outcome.state, items = outcome.items.len(), "container finished");
                    ctx.record_mut(&spec.id).container_state = Some(outcome.state);
                    NodeOutput::items(outcome.items)
                })
        } else {
            self.run_leaf(spec, ctx, input, iteration).await
        };

        match result {
            Ok(output) => {
                self.complete(ctx, spec, output).await;
                Ok(())
            }
            Err(err) if err.is_recoverable() && spec.settings.on_error == ErrorPolicy::Continue => {
                warn!(error = %err, "node failed, continuing with an error item");
                let message = err.to_string();
                ctx.record_mut(&spec.id).error = Some(message.clone());
                let item = DataItem::error(message, spec.id.as_str());
                self.complete(ctx, spec, NodeOutput::items(vec![item])).await;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "node failed");
                ctx.record_mut(&spec.id).error = Some(err.to_string());
                self.set_status(ctx, &spec.id, NodeStatus::Failed).await;
                Err(err)
            }
        }
    }

    async fn complete(&self, ctx: &mut ExecutionContext, spec: &NodeSpec, output: NodeOutput) {
        let NodeOutput {
            mut items,
            ports,
            variables,
        } = output;
        if items.is_empty() && spec.settings.always_output {
            items.push(DataItem::empty());
        }
        ctx.node_outputs.insert(spec.id.clone(), items);
        if ports.is_empty() {
            ctx.port_outputs.remove(&spec.id);
        } else {
            ctx.port_outputs.insert(spec.id.clone(), ports);
        }
        ctx.variables.extend(variables);
        self.set_status(ctx, &spec.id, NodeStatus::Completed).await;
    }

    /// Resolves parameters and credentials, then calls the executor under
    /// the node's retry policy.
    async fn run_leaf(
        &self,
        spec: &NodeSpec,
        ctx: &mut ExecutionContext,
        input: Vec<DataItem>,
        iteration: Option<usize>,
    ) -> Result<NodeOutput, ExecutionError> {
        let parameters = self
            .resolve_parameters(spec, ctx, &input, iteration, Utc::now())
            .map_err(|e| ExecutionError::node_failed(spec.id.clone(), e))?;
        let credentials = self
            .credentials
            .resolve_credentials(spec.id.as_str())
            .await
            .map_err(|e| ExecutionError::node_failed(spec.id.clone(), e))?;

        let input_count = input.len();
        let invocation = NodeInvocation {
            execution_id: ctx.execution_id,
            node: spec,
            items: input,
            parameters,
            credentials,
            variables: ctx.variables.clone(),
        };
        let policy = spec.settings.retry_policy().unwrap_or_default();

        let mut attempt = 0;
        loop {
            attempt += 1;
            ctx.record_mut(&spec.id).attempts = attempt;
            match self.executors.execute(&invocation).await {
                Ok(output) => return Ok(with_paired_defaults(output, input_count)),
                Err(err) if attempt < policy.attempts() => {
                    let delay = policy.delay_for(attempt);
                    warn!(attempt, ?delay, error = %err, "node attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    self.check_cancelled()?;
                }
                Err(err) => return Err(ExecutionError::node_failed(spec.id.clone(), err)),
            }
        }
    }

    /// One parameter map per input item, or a single map resolved against
    /// an empty item when there is no input. Condition and AI agent nodes
    /// also get their configured expressions resolved into `condition`,
    /// `prompt` and `system`.
    fn resolve_parameters(
        &self,
        spec: &NodeSpec,
        ctx: &ExecutionContext,
        input: &[DataItem],
        iteration: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Map<String, JsonValue>>, ExpressionError> {
        let empty = JsonValue::Object(Map::new());
        let subjects: Vec<&JsonValue> = if input.is_empty() {
            vec![&empty]
        } else {
            input.iter().map(|item| &item.json).collect()
        };

        subjects
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let bindings = ItemBindings::new(item, index, ctx, &self.graph, now)
                    .with_iteration(iteration);
                let mut params = Map::new();
                for (name, raw) in &spec.parameters {
                    params.insert(name.clone(), resolve_value(raw, name, &bindings)?);
                }
                match &spec.kind {
                    NodeKind::Condition(config) => {
                        let holds = evaluate_condition(&config.condition, &bindings)
                            .map_err(|e| e.with_field("condition"))?;
                        params.insert("condition".to_string(), JsonValue::Bool(holds));
                    }
                    NodeKind::AiAgent(config) => {
                        if !params.contains_key("prompt") {
                            let prompt = evaluate(&config.prompt, &bindings)
                                .map_err(|e| e.with_field("prompt"))?;
                            params.insert("prompt".to_string(), prompt);
                        }
                        if let (false, Some(system)) =
                            (params.contains_key("system"), &config.system)
                        {
                            let system =
                                evaluate(system, &bindings).map_err(|e| e.with_field("system"))?;
                            params.insert("system".to_string(), system);
                        }
                    }
                    _ => {}
                }
                Ok(params)
            })
            .collect()
    }
}

/// Links outputs to inputs when the executor left `pairedItemIndex` unset:
/// everything pairs with a single input, and equal-length outputs pair
/// position by position.
fn with_paired_defaults(mut output: NodeOutput, input_count: usize) -> NodeOutput {
    let same_length = output.items.len() == input_count;
    for (position, item) in output.items.iter_mut().enumerate() {
        if item.paired_item_index.is_none() {
            if input_count == 1 {
                item.paired_item_index = Some(0);
            } else if same_length {
                item.paired_item_index = Some(position);
            }
        }
    }
    output
}
