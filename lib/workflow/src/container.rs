//! Container runtime: loop, parallel, conditional, try-catch and batch.
//!
//! Each container runs its slots as nested scopes. Outputs of the nodes
//! nested inside a container are cleared before every pass (iteration,
//! branch, item or batch), gathered after it, and written back accumulated
//! once the container is done, so the context keeps the full trace while a
//! pass only ever reads its own upstream outputs.

use crate::bindings::ItemBindings;
use crate::error::{ContainerFrame, ExecutionError, FrameStep};
use crate::execution::{ExecutionContext, NodeRunRecord};
use crate::executor::NodeExecutionError;
use crate::graph::Scope;
use crate::item::DataItem;
use crate::node::{
    BatchConfig, ConditionalConfig, ContainerKind, FailureStrategy, LoopConfig, LoopMode, NodeId,
    NodeKind, ParallelConfig, Slot, TryCatchConfig,
};
use crate::scheduler::Scheduler;
use chrono::Utc;
use klikkflow_expression::{evaluate_condition, resolve_value};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

/// Bookkeeping of one container invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerState {
    /// Last loop iteration started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_index: Option<usize>,
    /// Parallel partitions dispatched.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub active_branches: Vec<usize>,
    /// Branch taken by the last routed item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_branch: Option<String>,
    /// Failure handed to the catch subgraph.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caught_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_batch: Option<usize>,
}

/// A container's output together with its final state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerOutcome {
    pub items: Vec<DataItem>,
    pub state: ContainerState,
}

/// Outputs of nested nodes, accumulated across passes.
#[derive(Debug, Default)]
struct Trace {
    nodes: Vec<NodeId>,
    outputs: BTreeMap<NodeId, Vec<DataItem>>,
    ports: BTreeMap<NodeId, BTreeMap<String, Vec<DataItem>>>,
}

impl Trace {
    fn new(nodes: Vec<NodeId>) -> Self {
        Self {
            nodes,
            ..Self::default()
        }
    }

    /// Clears the nested outputs before a pass.
    fn begin(&self, ctx: &mut ExecutionContext) {
        for id in &self.nodes {
            ctx.node_outputs.remove(id);
            ctx.port_outputs.remove(id);
        }
    }

    /// Gathers what the last pass produced.
    fn collect(&mut self, ctx: &ExecutionContext) {
        for id in &self.nodes {
            if let Some(items) = ctx.node_outputs.get(id) {
                self.outputs
                    .entry(id.clone())
                    .or_default()
                    .extend(items.iter().cloned());
            }
            if let Some(ports) = ctx.port_outputs.get(id) {
                let target = self.ports.entry(id.clone()).or_default();
                for (port, items) in ports {
                    target
                        .entry(port.clone())
                        .or_default()
                        .extend(items.iter().cloned());
                }
            }
        }
    }

    fn states(&self, ctx: &ExecutionContext) -> Vec<(NodeId, NodeRunRecord)> {
        self.nodes
            .iter()
            .filter_map(|id| ctx.node_states.get(id).map(|r| (id.clone(), r.clone())))
            .collect()
    }

    /// Writes the accumulated outputs back.
    fn finish(self, ctx: &mut ExecutionContext) {
        self.begin(ctx);
        ctx.node_outputs.extend(self.outputs);
        ctx.port_outputs.extend(self.ports);
    }
}

/// Pairs each item of a pass input with its position in that input.
fn local(items: Vec<DataItem>) -> Vec<DataItem> {
    items
        .into_iter()
        .enumerate()
        .map(|(position, item)| item.with_paired_item(position))
        .collect()
}

/// Points every item at `start` plus its position within the pass input,
/// clamped to the pass length.
fn rebase(items: Vec<DataItem>, start: usize, len: usize) -> Vec<DataItem> {
    let last = len.saturating_sub(1);
    items
        .into_iter()
        .map(|item| {
            let offset = item.paired_item_index.unwrap_or(0).min(last);
            item.with_paired_item(start + offset)
        })
        .collect()
}

/// The item json with an `error` field describing `err`. Non-object items
/// are wrapped as `{"value": ..., "error": ...}`.
fn with_error(json: &JsonValue, err: &ExecutionError) -> JsonValue {
    let error = json!({
        "message": err.to_string(),
        "nodeId": err.node_id().map(NodeId::as_str),
    });
    match json {
        JsonValue::Object(fields) => {
            let mut fields = fields.clone();
            fields.insert("error".to_string(), error);
            JsonValue::Object(fields)
        }
        other => json!({ "value": other, "error": error }),
    }
}

impl Scheduler {
    /// Runs a container node over its input.
    #[instrument(skip_all, fields(container_id = %self.graph.node(node).id, input = input.len()))]
    pub(crate) async fn run_container(
        &self,
        node: usize,
        ctx: &mut ExecutionContext,
        input: Vec<DataItem>,
        iteration: Option<usize>,
    ) -> Result<ContainerOutcome, ExecutionError> {
        let graph = Arc::clone(&self.graph);
        let spec = graph.node(node);
        let mut trace = Trace::new(
            graph
                .nested(node)
                .into_iter()
                .map(|child| graph.node(child).id.clone())
                .collect(),
        );

        let result = match &spec.kind {
            NodeKind::LoopContainer(config) => {
                self.run_loop(node, config, ctx, input, &mut trace).await
            }
            NodeKind::ParallelContainer(config) => {
                self.run_parallel(node, config, ctx, input, iteration, &mut trace)
                    .await
            }
            NodeKind::ConditionalContainer(config) => {
                self.run_conditional(node, config, ctx, input, iteration, &mut trace)
                    .await
            }
            NodeKind::TryCatchContainer(config) => {
                self.run_try_catch(node, config, ctx, input, iteration, &mut trace)
                    .await
            }
            NodeKind::BatchContainer(config) => {
                self.run_batch(node, config, ctx, input, iteration, &mut trace)
                    .await
            }
            NodeKind::Trigger(_)
            | NodeKind::Action(_)
            | NodeKind::Condition(_)
            | NodeKind::AiAgent(_) => Err(ExecutionError::node_failed(
                spec.id.clone(),
                NodeExecutionError::InvalidInput {
                    message: format!("{} is not a container", spec.kind.type_name()),
                },
            )),
        };
        trace.finish(ctx);
        result
    }

    fn frame(&self, node: usize, kind: ContainerKind, step: FrameStep) -> ContainerFrame {
        ContainerFrame::new(self.graph.node(node).id.clone(), kind, step)
    }

    async fn run_loop(
        &self,
        node: usize,
        config: &LoopConfig,
        ctx: &mut ExecutionContext,
        input: Vec<DataItem>,
        trace: &mut Trace,
    ) -> Result<ContainerOutcome, ExecutionError> {
        let graph = Arc::clone(&self.graph);
        let id = &graph.node(node).id;
        let body = graph.slot(node, Slot::Body);
        let max_iterations = config
            .max_iterations
            .unwrap_or(self.config.default_max_iterations);
        let limit_reached = || ExecutionError::IterationLimitExceeded {
            container_id: id.clone(),
            max_iterations,
            frames: Vec::new(),
        };
        let mut state = ContainerState::default();
        let mut items = Vec::new();

        match config.mode {
            LoopMode::Foreach => {
                let collection = self.loop_collection(node, config, ctx, input)?;
                for (index, element) in collection.into_iter().enumerate() {
                    self.check_cancelled()?;
                    if index >= max_iterations as usize {
                        return Err(limit_reached());
                    }
                    if index > 0 && config.iteration_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(config.iteration_delay_ms)).await;
                    }
                    state.iteration_index = Some(index);
                    let output = self
                        .run_pass(body, ctx, vec![element], Some(index), trace)
                        .await
                        .map_err(|e| {
                            e.within(self.frame(node, ContainerKind::Loop, FrameStep::Iteration { index }))
                        })?;
                    items.extend(output.into_iter().map(|item| item.with_paired_item(index)));
                }
            }
            LoopMode::While => {
                let condition = config.condition.as_deref().unwrap_or("false");
                let mut current = input;
                let mut index = 0;
                loop {
                    self.check_cancelled()?;
                    let empty = JsonValue::Object(Map::new());
                    let subject = current.first().map_or(&empty, |item| &item.json);
                    let bindings = ItemBindings::new(subject, 0, ctx, &graph, Utc::now())
                        .with_iteration(Some(index));
                    let holds = evaluate_condition(condition, &bindings)
                        .map_err(|e| ExecutionError::node_failed(id.clone(), e.with_field("condition")))?;
                    if !holds {
                        break;
                    }
                    if index >= max_iterations as usize {
                        return Err(limit_reached());
                    }
                    if index > 0 && config.iteration_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(config.iteration_delay_ms)).await;
                    }
                    state.iteration_index = Some(index);
                    let output = self
                        .run_pass(body, ctx, current, Some(index), trace)
                        .await
                        .map_err(|e| {
                            e.within(self.frame(node, ContainerKind::Loop, FrameStep::Iteration { index }))
                        })?;
                    items.extend(output.iter().cloned().map(|item| item.with_paired_item(index)));
                    current = output;
                    index += 1;
                }
            }
        }

        debug!(iterations = state.iteration_index.map_or(0, |i| i + 1), "loop finished");
        Ok(ContainerOutcome { items, state })
    }

    /// The elements a foreach loop walks: the `items` setting (an array, or
    /// an expression resolved against the first input item), else the input.
    fn loop_collection(
        &self,
        node: usize,
        config: &LoopConfig,
        ctx: &ExecutionContext,
        input: Vec<DataItem>,
    ) -> Result<Vec<DataItem>, ExecutionError> {
        let Some(items) = &config.items else {
            return Ok(input);
        };
        let id = &self.graph.node(node).id;
        let empty = JsonValue::Object(Map::new());
        let subject = input.first().map_or(&empty, |item| &item.json);
        let bindings = ItemBindings::new(subject, 0, ctx, &self.graph, Utc::now());
        let resolved = resolve_value(items, "items", &bindings)
            .map_err(|e| ExecutionError::node_failed(id.clone(), e))?;
        match resolved {
            JsonValue::Array(elements) => Ok(elements.into_iter().map(DataItem::new).collect()),
            other => Err(ExecutionError::node_failed(
                id.clone(),
                NodeExecutionError::InvalidInput {
                    message: format!("loop items must be an array, got {other}"),
                },
            )),
        }
    }

    /// One sequential pass over a slot, traced.
    async fn run_pass(
        &self,
        scope: Option<&Scope>,
        ctx: &mut ExecutionContext,
        entry: Vec<DataItem>,
        iteration: Option<usize>,
        trace: &mut Trace,
    ) -> Result<Vec<DataItem>, ExecutionError> {
        let entry = local(entry);
        let Some(scope) = scope else {
            return Ok(entry);
        };
        trace.begin(ctx);
        let result = self.run_scope(scope, ctx, &entry, iteration).await;
        trace.collect(ctx);
        result
    }

    async fn run_parallel(
        &self,
        node: usize,
        config: &ParallelConfig,
        ctx: &mut ExecutionContext,
        input: Vec<DataItem>,
        iteration: Option<usize>,
        trace: &mut Trace,
    ) -> Result<ContainerOutcome, ExecutionError> {
        let id = self.graph.node(node).id.clone();
        let per_branch = config.items_per_branch.max(1);
        let partitions: Vec<Vec<DataItem>> =
            input.chunks(per_branch).map(|chunk| local(chunk.to_vec())).collect();
        let starts: Vec<usize> = (0..partitions.len()).map(|i| i * per_branch).collect();
        let lens: Vec<usize> = partitions.iter().map(Vec::len).collect();
        let semaphore = config
            .concurrency
            .or(self.config.default_concurrency)
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        let mut base = ctx.clone();
        trace.begin(&mut base);
        let mut state = ContainerState::default();
        let mut tasks: JoinSet<(usize, Result<(Vec<DataItem>, ExecutionContext), ExecutionError>)> =
            JoinSet::new();

        for (index, partition) in partitions.into_iter().enumerate() {
            self.check_cancelled()?;
            let scheduler = self.clone();
            let semaphore = semaphore.clone();
            let mut fork = base.clone();
            tasks.spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                if let Err(err) = scheduler.check_cancelled() {
                    return (index, Err(err));
                }
                let graph = Arc::clone(&scheduler.graph);
                let result = match graph.slot(node, Slot::Body) {
                    Some(scope) => {
                        let output = scheduler
                            .run_scope(scope, &mut fork, &partition, iteration)
                            .await;
                        output.map(|items| (items, fork))
                    }
                    None => Ok((partition, fork)),
                };
                (index, result)
            });
            state.active_branches.push(index);
        }

        let mut slots: Vec<Option<Result<(Vec<DataItem>, ExecutionContext), ExecutionError>>> =
            vec![None; starts.len()];
        let mut failure: Option<(usize, ExecutionError)> = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(joined) => joined,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    tasks.abort_all();
                    return Err(ExecutionError::node_failed(
                        id,
                        NodeExecutionError::ExecutionFailed {
                            message: format!("parallel branch task failed: {e}"),
                        },
                    ));
                }
            };
            match result {
                Err(err)
                    if config.failure_strategy == FailureStrategy::FailFast
                        || !err.is_recoverable() =>
                {
                    if failure.as_ref().is_none_or(|(seen, _)| index < *seen) {
                        failure = Some((index, err));
                    }
                    tasks.abort_all();
                }
                other => slots[index] = Some(other),
            }
        }
        if let Some((index, err)) = failure {
            return Err(err.within(self.frame(node, ContainerKind::Parallel, FrameStep::Branch { index })));
        }

        let mut items = Vec::new();
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(Ok((output, fork))) => {
                    items.extend(rebase(output, starts[index], lens[index]));
                    trace.collect(&fork);
                    ctx.node_states.extend(trace.states(&fork));
                    for (name, value) in fork.variables {
                        if base.variables.get(&name) != Some(&value) {
                            ctx.variables.insert(name, value);
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(branch = index, error = %err, "parallel branch failed, collecting error");
                    items.push(DataItem::error(err.to_string(), id.as_str()).with_paired_item(starts[index]));
                }
                None => {}
            }
        }
        Ok(ContainerOutcome { items, state })
    }

    async fn run_conditional(
        &self,
        node: usize,
        config: &ConditionalConfig,
        ctx: &mut ExecutionContext,
        input: Vec<DataItem>,
        iteration: Option<usize>,
        trace: &mut Trace,
    ) -> Result<ContainerOutcome, ExecutionError> {
        let graph = Arc::clone(&self.graph);
        let id = &graph.node(node).id;
        let mut state = ContainerState::default();
        let mut items = Vec::new();

        for (index, item) in input.into_iter().enumerate() {
            self.check_cancelled()?;
            let bindings = ItemBindings::new(&item.json, index, ctx, &graph, Utc::now())
                .with_iteration(iteration);
            let mut selected = None;
            for (branch_index, branch) in config.branches.iter().enumerate() {
                let holds = evaluate_condition(&branch.condition, &bindings).map_err(|e| {
                    ExecutionError::node_failed(
                        id.clone(),
                        e.with_field(format!("branches[{branch_index}].condition")),
                    )
                })?;
                if holds {
                    selected = Some((Slot::Branch(branch_index), branch.name.clone()));
                    break;
                }
            }
            if selected.is_none() && config.default.is_some() {
                selected = Some((Slot::Default, "default".to_string()));
            }
            let Some((slot, name)) = selected else {
                warn!(item = index, "no branch matched, dropping item");
                continue;
            };

            debug!(item = index, branch = %name, "routing item");
            state.selected_branch = Some(name.clone());
            let output = self
                .run_pass(graph.slot(node, slot), ctx, vec![item], iteration, trace)
                .await
                .map_err(|e| {
                    e.within(self.frame(
                        node,
                        ContainerKind::Conditional,
                        FrameStep::Route {
                            branch: name,
                            item: index,
                        },
                    ))
                })?;
            items.extend(output.into_iter().map(|item| item.with_paired_item(index)));
        }
        Ok(ContainerOutcome { items, state })
    }

    async fn run_try_catch(
        &self,
        node: usize,
        config: &TryCatchConfig,
        ctx: &mut ExecutionContext,
        input: Vec<DataItem>,
        iteration: Option<usize>,
        trace: &mut Trace,
    ) -> Result<ContainerOutcome, ExecutionError> {
        let graph = Arc::clone(&self.graph);
        let policy = config.retry_policy.clone().unwrap_or_default();
        let mut state = ContainerState::default();
        let mut items = Vec::new();

        for (index, item) in input.into_iter().enumerate() {
            let mut attempt = 0;
            let caught = loop {
                self.check_cancelled()?;
                attempt += 1;
                match self
                    .run_pass(graph.slot(node, Slot::Try), ctx, vec![item.clone()], iteration, trace)
                    .await
                {
                    Ok(output) => {
                        items.extend(output.into_iter().map(|item| item.with_paired_item(index)));
                        break None;
                    }
                    Err(err) if !err.is_recoverable() => {
                        return Err(err.within(self.frame(
                            node,
                            ContainerKind::TryCatch,
                            FrameStep::Try { item: index },
                        )));
                    }
                    Err(err) if attempt < policy.attempts() => {
                        let delay = policy.delay_for(attempt);
                        warn!(item = index, attempt, ?delay, error = %err, "try failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => break Some(err),
                }
            };
            let Some(err) = caught else {
                continue;
            };

            warn!(item = index, error = %err, "try failed, running catch");
            state.caught_error = Some(err.to_string());
            let recovered = DataItem {
                json: with_error(&item.json, &err),
                ..item
            };
            let output = self
                .run_pass(graph.slot(node, Slot::Catch), ctx, vec![recovered], iteration, trace)
                .await
                .map_err(|e| {
                    e.within(self.frame(node, ContainerKind::TryCatch, FrameStep::Catch { item: index }))
                })?;
            items.extend(output.into_iter().map(|item| item.with_paired_item(index)));
        }
        Ok(ContainerOutcome { items, state })
    }

    async fn run_batch(
        &self,
        node: usize,
        config: &BatchConfig,
        ctx: &mut ExecutionContext,
        input: Vec<DataItem>,
        iteration: Option<usize>,
        trace: &mut Trace,
    ) -> Result<ContainerOutcome, ExecutionError> {
        let graph = Arc::clone(&self.graph);
        let size = config.batch_size.max(1);
        let mut state = ContainerState::default();
        let mut items = Vec::new();

        for (index, chunk) in input.chunks(size).enumerate() {
            self.check_cancelled()?;
            if index > 0 && config.inter_batch_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(config.inter_batch_delay_ms)).await;
            }
            state.current_batch = Some(index);
            let output = self
                .run_pass(graph.slot(node, Slot::Body), ctx, chunk.to_vec(), iteration, trace)
                .await
                .map_err(|e| e.within(self.frame(node, ContainerKind::Batch, FrameStep::Batch { index })))?;
            items.extend(rebase(output, index * size, chunk.len()));
        }
        Ok(ContainerOutcome { items, state })
    }
}
