//! The workflow engine.
//!
//! [`Engine`] validates definitions, runs them, and resumes or retries runs
//! from a checkpoint. Failures that happen before a run exists (invalid
//! graph, repository errors) come back as a rootcause `Report`; failures
//! during a run settle into the returned [`ExecutionContext`].

use crate::cancel::CancellationFlag;
use crate::config::EngineConfig;
use crate::definition::WorkflowDefinition;
use crate::error::{ExecutionError, WorkflowError};
use crate::event::{EventSink, NoopSink};
use crate::execution::{ExecutionContext, ExecutionEvent, ExecutionMode, ExecutionStatus, NodeStatus, RunError};
use crate::executor::ExecutorRegistry;
use crate::graph::WorkflowGraph;
use crate::node::NodeId;
use crate::persistence::{ExecutionRepository, InMemoryRepository, PersistenceError};
use crate::scheduler::Scheduler;
use chrono::Utc;
use klikkflow_core::WorkflowId;
use klikkflow_integration::{CredentialResolver, NoCredentials};
use rootcause::Report;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Runs workflows against injected collaborators.
#[derive(Clone)]
pub struct Engine {
    executors: Arc<ExecutorRegistry>,
    credentials: Arc<dyn CredentialResolver>,
    events: Arc<dyn EventSink>,
    repository: Arc<dyn ExecutionRepository>,
    config: EngineConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("executors", &self.executors)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for Engine {
    /// Built-in operations, no credentials, no events, in-memory storage.
    fn default() -> Self {
        Self {
            executors: Arc::new(ExecutorRegistry::with_builtins()),
            credentials: Arc::new(NoCredentials),
            events: Arc::new(NoopSink),
            repository: Arc::new(InMemoryRepository::new()),
            config: EngineConfig::default(),
        }
    }
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Arc::new(executors);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn ExecutionRepository>) -> Self {
        self.repository = repository;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    /// Validates a definition.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::InvalidGraph`] describing the first
    /// structural problem, cycles included.
    pub fn validate(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowGraph, Report<WorkflowError>> {
        let graph = WorkflowGraph::build(definition.clone()).map_err(|error| {
            WorkflowError::InvalidGraph {
                workflow_id: definition.id,
                error,
            }
        })?;
        Ok(graph)
    }

    /// Runs a workflow manually.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is invalid or the final checkpoint
    /// cannot be saved. Node failures are reported in the context.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        trigger_data: JsonValue,
    ) -> Result<ExecutionContext, Report<WorkflowError>> {
        self.run_with(definition, trigger_data, ExecutionMode::Manual, CancellationFlag::new())
            .await
    }

    /// Runs a workflow with an explicit mode and cancellation flag.
    ///
    /// # Errors
    ///
    /// See [`Engine::run`].
    #[instrument(skip_all, fields(workflow_id = %definition.id, ?mode))]
    pub async fn run_with(
        &self,
        definition: &WorkflowDefinition,
        trigger_data: JsonValue,
        mode: ExecutionMode,
        cancel: CancellationFlag,
    ) -> Result<ExecutionContext, Report<WorkflowError>> {
        let graph = self.validate(definition)?;
        let context = ExecutionContext::new(definition.id, mode, trigger_data);
        self.execute(graph, context, cancel).await
    }

    /// Loads a stored definition and runs it as a triggered run.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::NotFound`] for unknown workflows, plus the
    /// errors of [`Engine::run`].
    pub async fn run_by_id(
        &self,
        workflow_id: WorkflowId,
        trigger_data: JsonValue,
    ) -> Result<ExecutionContext, Report<WorkflowError>> {
        let definition = match self.repository.load_workflow_definition(workflow_id).await {
            Ok(definition) => definition,
            Err(PersistenceError::NotFound { .. }) => {
                return Err(WorkflowError::NotFound { workflow_id }.into());
            }
            Err(e) => return Err(WorkflowError::from(e).into()),
        };
        self.run_with(&definition, trigger_data, ExecutionMode::Trigger, CancellationFlag::new())
            .await
    }

    /// Continues a run from a checkpoint. Completed nodes keep their
    /// outputs and are not executed again; everything else starts over.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::WorkflowMismatch`] if the checkpoint belongs
    /// to another workflow and [`WorkflowError::NotResumable`] if it already
    /// succeeded, plus the errors of [`Engine::run`].
    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        checkpoint: ExecutionContext,
    ) -> Result<ExecutionContext, Report<WorkflowError>> {
        self.resume_with(definition, checkpoint, CancellationFlag::new())
            .await
    }

    /// [`Engine::resume`] with an explicit cancellation flag.
    ///
    /// # Errors
    ///
    /// See [`Engine::resume`].
    #[instrument(skip_all, fields(workflow_id = %definition.id, execution_id = %checkpoint.execution_id))]
    pub async fn resume_with(
        &self,
        definition: &WorkflowDefinition,
        mut checkpoint: ExecutionContext,
        cancel: CancellationFlag,
    ) -> Result<ExecutionContext, Report<WorkflowError>> {
        let graph = self.validate(definition)?;
        check_owner(definition, &checkpoint)?;
        if checkpoint.status == ExecutionStatus::Success {
            return Err(WorkflowError::NotResumable {
                execution_id: checkpoint.execution_id,
                status: checkpoint.status,
            }
            .into());
        }
        reset_unfinished(&graph, &mut checkpoint);
        self.execute(graph, checkpoint, cancel).await
    }

    /// Re-runs `node_id` and everything downstream of it, keeping the rest
    /// of the checkpoint. A node inside a container re-runs its top-level
    /// container.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::UnknownNode`] if the node does not exist,
    /// plus the errors of [`Engine::resume`] except `NotResumable`.
    #[instrument(skip_all, fields(workflow_id = %definition.id, execution_id = %checkpoint.execution_id, %node_id))]
    pub async fn retry_from(
        &self,
        definition: &WorkflowDefinition,
        mut checkpoint: ExecutionContext,
        node_id: &NodeId,
    ) -> Result<ExecutionContext, Report<WorkflowError>> {
        let graph = self.validate(definition)?;
        check_owner(definition, &checkpoint)?;
        let node = graph
            .index_of(node_id)
            .ok_or_else(|| WorkflowError::UnknownNode {
                node_id: node_id.clone(),
            })?;

        let reset = graph.downstream_of(graph.top_level_ancestor(node));
        info!(nodes = reset.len(), "resetting nodes for retry");
        for index in reset {
            checkpoint.reset_node(&graph.node(index).id);
        }
        checkpoint.mode = ExecutionMode::Retry;
        reset_unfinished(&graph, &mut checkpoint);
        self.execute(graph, checkpoint, CancellationFlag::new()).await
    }

    async fn execute(
        &self,
        graph: WorkflowGraph,
        mut context: ExecutionContext,
        cancel: CancellationFlag,
    ) -> Result<ExecutionContext, Report<WorkflowError>> {
        let scheduler = Scheduler {
            graph: Arc::new(graph),
            executors: Arc::clone(&self.executors),
            credentials: Arc::clone(&self.credentials),
            events: Arc::clone(&self.events),
            repository: Arc::clone(&self.repository),
            config: self.config.clone(),
            cancel,
        };

        context.start();
        info!(execution_id = %context.execution_id, mode = ?context.mode, "execution started");
        scheduler
            .publish(ExecutionEvent::ExecutionStarted {
                execution_id: context.execution_id,
                workflow_id: context.workflow_id,
                mode: context.mode,
                timestamp: Utc::now(),
            })
            .await;

        match scheduler.run_root(&mut context).await {
            Ok(()) => context.finish(ExecutionStatus::Success, None),
            Err(err @ ExecutionError::CancellationRequested) => {
                warn!(execution_id = %context.execution_id, "execution cancelled");
                context.finish(ExecutionStatus::Cancelled, Some(RunError::from_execution(&err, None)));
            }
            Err(err) => {
                let node_type = err
                    .node_id()
                    .and_then(|id| scheduler.graph.index_of(id))
                    .map(|index| scheduler.graph.node(index).kind.type_name());
                warn!(execution_id = %context.execution_id, error = %err, "execution failed");
                context.finish(
                    ExecutionStatus::Error,
                    Some(RunError::from_execution(&err, node_type)),
                );
            }
        }

        scheduler
            .publish(ExecutionEvent::ExecutionFinished {
                execution_id: context.execution_id,
                status: context.status,
                error: context.error.as_ref().map(|e| e.message.clone()),
                timestamp: Utc::now(),
            })
            .await;
        self.repository
            .save_execution_state(&context)
            .await
            .map_err(WorkflowError::from)?;

        info!(
            execution_id = %context.execution_id,
            status = %context.status,
            duration_ms = ?context.duration().map(|d| d.num_milliseconds()),
            "execution finished"
        );
        Ok(context)
    }
}

fn check_owner(
    definition: &WorkflowDefinition,
    checkpoint: &ExecutionContext,
) -> Result<(), Report<WorkflowError>> {
    if checkpoint.workflow_id != definition.id {
        return Err(WorkflowError::WorkflowMismatch {
            expected: definition.id,
            actual: checkpoint.workflow_id,
        }
        .into());
    }
    Ok(())
}

/// Returns every top-level node that did not complete, and everything
/// nested in it, to idle.
fn reset_unfinished(graph: &WorkflowGraph, checkpoint: &mut ExecutionContext) {
    for &node in graph.root().nodes() {
        let id = &graph.node(node).id;
        if checkpoint.node_status(id) == NodeStatus::Completed {
            continue;
        }
        checkpoint.reset_node(id);
        for nested in graph.nested(node) {
            checkpoint.reset_node(&graph.node(nested).id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FrameStep, GraphError};
    use crate::event::ChannelSink;
    use crate::executor::{MockExecutor, NodeExecutionError, NodeExecutor, NodeInvocation, NodeOutput};
    use crate::item::jsons;
    use crate::node::{
        AiAgentConfig, BatchConfig, BranchSpec, ConditionalConfig, ErrorPolicy, FailureStrategy,
        LoopConfig, LoopMode, NodeKind, NodeSettings, NodeSpec, ParallelConfig, TryCatchConfig,
    };
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use klikkflow_ai::{LlmBackend, LlmError, LlmProvider, LlmRequest, LlmResponse, TokenUsage};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn id(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn outputs(ctx: &ExecutionContext, node: &str) -> Vec<JsonValue> {
        jsons(ctx.output(&id(node)).unwrap_or_default())
    }

    fn foreach(items: Option<JsonValue>, nodes: &[&str]) -> NodeKind {
        NodeKind::LoopContainer(LoopConfig {
            mode: LoopMode::Foreach,
            items,
            condition: None,
            max_iterations: None,
            iteration_delay_ms: 0,
            nodes: nodes.iter().map(|n| id(n)).collect(),
        })
    }

    fn parallel(strategy: FailureStrategy, nodes: &[&str]) -> NodeKind {
        NodeKind::ParallelContainer(ParallelConfig {
            concurrency: None,
            items_per_branch: 1,
            failure_strategy: strategy,
            nodes: nodes.iter().map(|n| id(n)).collect(),
        })
    }

    fn engine_with(registry: ExecutorRegistry) -> (Engine, InMemoryRepository) {
        let repository = InMemoryRepository::with_history();
        let engine = Engine::new()
            .with_executors(registry)
            .with_repository(Arc::new(repository.clone()));
        (engine, repository)
    }

    #[tokio::test]
    async fn loop_doubles_then_sums() {
        let definition = WorkflowDefinition::new("double and sum")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new("each", foreach(Some(json!([1, 2, 3])), &["double"])))
            .with_node(
                NodeSpec::action("double", "set")
                    .with_parameter("value", json!("{{ $json * 2 }}"))
                    .with_parent("each"),
            )
            .with_node(NodeSpec::action("total", "sum"))
            .with_edge("start", "each")
            .with_edge("each", "total");

        let ctx = Engine::new().run(&definition, json!({})).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        assert_eq!(outputs(&ctx, "each"), vec![json!(2), json!(4), json!(6)]);
        assert_eq!(outputs(&ctx, "total"), vec![json!({"sum": 12})]);
        assert_eq!(outputs(&ctx, "double"), vec![json!(2), json!(4), json!(6)]);
        let paired: Vec<_> = ctx.output(&id("each")).unwrap_or_default().iter().map(|i| i.paired_item_index).collect();
        assert_eq!(paired, vec![Some(0), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn try_catch_recovers() {
        let definition = WorkflowDefinition::new("recover")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new(
                "guard",
                NodeKind::TryCatchContainer(TryCatchConfig {
                    try_nodes: vec![id("risky")],
                    catch_nodes: vec![id("recover")],
                    retry_policy: None,
                }),
            ))
            .with_node(
                NodeSpec::action("risky", "stop-and-error")
                    .with_parameter("message", json!("boom"))
                    .with_parent("guard"),
            )
            .with_node(
                NodeSpec::action("recover", "set")
                    .with_parameter("value", json!({"recovered": true}))
                    .with_parent("guard"),
            )
            .with_edge("start", "guard");

        let ctx = Engine::new().run(&definition, json!({})).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        assert_eq!(outputs(&ctx, "guard"), vec![json!({"recovered": true})]);
        let state = ctx.node_states[&id("guard")]
            .container_state
            .clone()
            .expect("container state");
        assert!(state.caught_error.is_some_and(|e| e.contains("boom")));
        assert_eq!(ctx.node_status(&id("risky")), NodeStatus::Failed);
    }

    #[tokio::test]
    async fn try_catch_without_catch_nodes_emits_the_error_item() {
        let definition = WorkflowDefinition::new("swallow")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new(
                "guard",
                NodeKind::TryCatchContainer(TryCatchConfig {
                    try_nodes: vec![id("risky")],
                    catch_nodes: Vec::new(),
                    retry_policy: Some(RetryPolicy::fixed(2, 0)),
                }),
            ))
            .with_node(NodeSpec::action("risky", "flaky").with_parent("guard"))
            .with_edge("start", "guard");
        let flaky = MockExecutor::failing(NodeExecutionError::Timeout);
        let (engine, _) = engine_with(ExecutorRegistry::new().register("flaky", flaky.clone()));

        let ctx = engine.run(&definition, json!({"id": 7})).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        assert_eq!(flaky.calls(), 2);
        let output = outputs(&ctx, "guard");
        assert_eq!(output[0]["id"], 7);
        assert_eq!(output[0]["error"]["nodeId"], "risky");
    }

    #[tokio::test]
    async fn conditional_runs_only_the_matching_branch() {
        let definition = WorkflowDefinition::new("route")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new(
                "route",
                NodeKind::ConditionalContainer(ConditionalConfig {
                    branches: vec![
                        BranchSpec {
                            name: "active".to_string(),
                            condition: "{{ $json.flag }}".to_string(),
                            nodes: vec![id("hit")],
                        },
                        BranchSpec {
                            name: "inactive".to_string(),
                            condition: "{{ !$json.flag }}".to_string(),
                            nodes: vec![id("miss")],
                        },
                    ],
                    default: None,
                }),
            ))
            .with_node(NodeSpec::action("hit", "hit").with_parent("route"))
            .with_node(NodeSpec::action("miss", "miss").with_parent("route"))
            .with_edge("start", "route");
        let (hit, miss) = (MockExecutor::passthrough(), MockExecutor::passthrough());
        let (engine, _) = engine_with(
            ExecutorRegistry::new()
                .register("hit", hit.clone())
                .register("miss", miss.clone()),
        );

        let ctx = engine.run(&definition, json!({"flag": true})).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        assert_eq!(hit.calls(), 1);
        assert_eq!(miss.calls(), 0);
        assert_eq!(ctx.node_status(&id("miss")), NodeStatus::Idle);
        let state = ctx.node_states[&id("route")].container_state.clone().expect("state");
        assert_eq!(state.selected_branch.as_deref(), Some("active"));
    }

    #[tokio::test]
    async fn conditional_sends_items_missing_the_field_to_default() {
        let definition = WorkflowDefinition::new("route by amount")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new(
                "route",
                NodeKind::ConditionalContainer(ConditionalConfig {
                    branches: vec![BranchSpec {
                        name: "large".to_string(),
                        condition: "{{ $json.amount > 100 }}".to_string(),
                        nodes: vec![id("review")],
                    }],
                    default: Some(vec![id("approve")]),
                }),
            ))
            .with_node(NodeSpec::action("review", "review").with_parent("route"))
            .with_node(NodeSpec::action("approve", "approve").with_parent("route"))
            .with_edge("start", "route");
        let (review, approve) = (MockExecutor::passthrough(), MockExecutor::passthrough());
        let (engine, _) = engine_with(
            ExecutorRegistry::new()
                .register("review", review.clone())
                .register("approve", approve.clone()),
        );

        let trigger = json!([{"status": "active"}, {"amount": 500}, {"amount": 20}]);
        let ctx = engine.run(&definition, trigger).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        assert_eq!(review.calls(), 1);
        assert_eq!(approve.calls(), 2);
        assert_eq!(
            outputs(&ctx, "route"),
            vec![json!({"status": "active"}), json!({"amount": 500}), json!({"amount": 20})]
        );
        assert_eq!(outputs(&ctx, "approve"), vec![json!({"status": "active"}), json!({"amount": 20})]);
    }

    #[tokio::test]
    async fn parallel_keeps_input_order() {
        let definition = WorkflowDefinition::new("fan out")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new("fan", parallel(FailureStrategy::FailFast, &["pause"])))
            .with_node(
                NodeSpec::action("pause", "wait")
                    .with_parameter("ms", json!("{{ $json.delay }}"))
                    .with_parent("fan"),
            )
            .with_edge("start", "fan");
        let trigger = json!([
            {"n": 0, "delay": 0},
            {"n": 1, "delay": 50},
            {"n": 2, "delay": 0},
        ]);

        let ctx = Engine::new().run(&definition, trigger).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        let order: Vec<_> = outputs(&ctx, "fan").iter().map(|item| item["n"].clone()).collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
        let paired: Vec<_> = ctx.output(&id("fan")).unwrap_or_default().iter().map(|i| i.paired_item_index).collect();
        assert_eq!(paired, vec![Some(0), Some(1), Some(2)]);
    }

    fn dividing_fan(strategy: FailureStrategy) -> WorkflowDefinition {
        WorkflowDefinition::new("divide")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new("fan", parallel(strategy, &["divide"])))
            .with_node(
                NodeSpec::action("divide", "set")
                    .with_parameter("value", json!("{{ $json.n / $json.d }}"))
                    .with_parent("fan"),
            )
            .with_edge("start", "fan")
    }

    #[tokio::test]
    async fn parallel_collects_errors_in_their_slots() {
        let trigger = json!([{"n": 1, "d": 1}, {"n": 1, "d": 0}, {"n": 4, "d": 2}]);
        let ctx = Engine::new()
            .run(&dividing_fan(FailureStrategy::CollectErrors), trigger)
            .await
            .expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        let items = ctx.output(&id("fan")).unwrap_or_default();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].json, json!(1));
        assert!(items[1].is_error());
        assert_eq!(items[2].json, json!(2));
    }

    #[tokio::test]
    async fn parallel_fail_fast_reports_the_failing_branch() {
        let trigger = json!([{"n": 1, "d": 1}, {"n": 1, "d": 0}, {"n": 4, "d": 2}]);
        let ctx = Engine::new()
            .run(&dividing_fan(FailureStrategy::FailFast), trigger)
            .await
            .expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Error);
        let error = ctx.error.expect("run error");
        assert_eq!(error.node_id, Some(id("divide")));
        assert_eq!(error.frames[0].step, FrameStep::Branch { index: 1 });
        assert!(error.message.contains("division by zero"));
    }

    #[tokio::test]
    async fn while_loop_stops_at_the_iteration_limit() {
        let definition = WorkflowDefinition::new("forever")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new(
                "poll",
                NodeKind::LoopContainer(LoopConfig {
                    mode: LoopMode::While,
                    items: None,
                    condition: Some("true".to_string()),
                    max_iterations: Some(3),
                    iteration_delay_ms: 0,
                    nodes: vec![id("tick")],
                }),
            ))
            .with_node(NodeSpec::action("tick", "tick").with_parent("poll"))
            .with_edge("start", "poll");
        let tick = MockExecutor::passthrough();
        let (engine, _) = engine_with(ExecutorRegistry::new().register("tick", tick.clone()));

        let ctx = engine.run(&definition, json!({})).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Error);
        assert_eq!(tick.calls(), 3);
        let error = ctx.error.expect("run error");
        assert_eq!(error.node_id, Some(id("poll")));
        assert_eq!(error.node_type.as_deref(), Some("loop-container"));
    }

    #[tokio::test]
    async fn while_loop_feeds_output_into_the_next_iteration() {
        let definition = WorkflowDefinition::new("count up")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new(
                "count",
                NodeKind::LoopContainer(LoopConfig {
                    mode: LoopMode::While,
                    items: None,
                    condition: Some("{{ $json.n < 3 }}".to_string()),
                    max_iterations: None,
                    iteration_delay_ms: 0,
                    nodes: vec![id("inc")],
                }),
            ))
            .with_node(
                NodeSpec::action("inc", "set")
                    .with_parameter("fields", json!({"n": "{{ n + 1 }}"}))
                    .with_parent("count"),
            )
            .with_edge("start", "count");

        let ctx = Engine::new().run(&definition, json!({"n": 0})).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        assert_eq!(
            outputs(&ctx, "count"),
            vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]
        );
    }

    #[tokio::test]
    async fn batch_runs_once_per_chunk() {
        let definition = WorkflowDefinition::new("chunks")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new(
                "chunks",
                NodeKind::BatchContainer(BatchConfig {
                    batch_size: 2,
                    inter_batch_delay_ms: 0,
                    nodes: vec![id("work")],
                }),
            ))
            .with_node(NodeSpec::action("work", "work").with_parent("chunks"))
            .with_edge("start", "chunks");
        let work = MockExecutor::passthrough();
        let (engine, _) = engine_with(ExecutorRegistry::new().register("work", work.clone()));

        let ctx = engine.run(&definition, json!([1, 2, 3, 4, 5])).await.expect("run");

        assert_eq!(work.calls(), 3);
        assert_eq!(outputs(&ctx, "chunks"), vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
        let paired: Vec<_> = ctx.output(&id("chunks")).unwrap_or_default().iter().map(|i| i.paired_item_index).collect();
        assert_eq!(paired, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
    }

    fn three_steps() -> WorkflowDefinition {
        WorkflowDefinition::new("three steps")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::action("a", "mark-a"))
            .with_node(NodeSpec::action("b", "set").with_parameter("fields", json!({"b": "{{ $node.a.json.a + 1 }}"})))
            .with_node(
                NodeSpec::action("c", "set-variable")
                    .with_parameter("name", json!("done"))
                    .with_parameter("value", json!(true)),
            )
            .with_edge("start", "a")
            .with_edge("a", "b")
            .with_edge("b", "c")
    }

    #[tokio::test]
    async fn resuming_a_checkpoint_matches_an_uninterrupted_run() {
        let definition = three_steps();
        let mark = MockExecutor::succeeding(json!({"a": 1}));
        let (engine, repository) = engine_with(
            ExecutorRegistry::with_builtins().register("mark-a", mark.clone()),
        );

        let full = engine.run(&definition, json!({})).await.expect("run");
        assert_eq!(full.status, ExecutionStatus::Success);

        let checkpoint = repository
            .checkpoints(full.execution_id)
            .await
            .into_iter()
            .find(|c| {
                c.node_status(&id("a")) == NodeStatus::Completed
                    && c.node_status(&id("b")) == NodeStatus::Idle
            })
            .expect("checkpoint after a");
        let encoded = serde_json::to_string(&checkpoint).expect("encode");
        let decoded: ExecutionContext = serde_json::from_str(&encoded).expect("decode");

        let resumed = engine.resume(&definition, decoded).await.expect("resume");

        assert_eq!(mark.calls(), 1);
        assert_eq!(resumed.status, ExecutionStatus::Success);
        assert_eq!(resumed.execution_id, full.execution_id);
        assert_eq!(resumed.node_outputs, full.node_outputs);
        assert_eq!(resumed.variables, full.variables);
        assert_eq!(outputs(&resumed, "b"), vec![json!({"a": 1, "b": 2})]);
    }

    #[tokio::test]
    async fn successful_runs_cannot_be_resumed() {
        let definition = WorkflowDefinition::new("done").with_node(NodeSpec::trigger("start"));
        let engine = Engine::new();
        let ctx = engine.run(&definition, json!({})).await.expect("run");

        let err = engine.resume(&definition, ctx.clone()).await.expect_err("resume");
        assert!(matches!(err.current_context(), WorkflowError::NotResumable { .. }));

        let other = WorkflowDefinition::new("other").with_node(NodeSpec::trigger("start"));
        let err = engine.resume(&other, ctx).await.expect_err("mismatch");
        assert!(matches!(err.current_context(), WorkflowError::WorkflowMismatch { .. }));
    }

    #[tokio::test]
    async fn retry_from_reruns_only_downstream_nodes() {
        let definition = WorkflowDefinition::new("branches")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::action("a", "a"))
            .with_node(NodeSpec::action("b", "b"))
            .with_node(NodeSpec::action("c", "c"))
            .with_edge("start", "a")
            .with_edge("a", "b")
            .with_edge("start", "c");
        let (a, b, c) = (
            MockExecutor::passthrough(),
            MockExecutor::passthrough(),
            MockExecutor::passthrough(),
        );
        let (engine, _) = engine_with(
            ExecutorRegistry::new()
                .register("a", a.clone())
                .register("b", b.clone())
                .register("c", c.clone()),
        );

        let ctx = engine.run(&definition, json!({})).await.expect("run");
        let retried = engine.retry_from(&definition, ctx, &id("a")).await.expect("retry");

        assert_eq!(retried.status, ExecutionStatus::Success);
        assert_eq!(retried.mode, ExecutionMode::Retry);
        assert_eq!((a.calls(), b.calls(), c.calls()), (2, 2, 1));

        let err = engine
            .retry_from(&definition, retried, &id("ghost"))
            .await
            .expect_err("unknown node");
        assert!(matches!(err.current_context(), WorkflowError::UnknownNode { .. }));
    }

    #[tokio::test]
    async fn node_retry_policy_absorbs_transient_failures() {
        let flaky = MockExecutor::flaky(
            2,
            NodeExecutionError::ExternalServiceError {
                service: "api".to_string(),
                message: "503".to_string(),
            },
        );
        let settings = NodeSettings {
            retry: Some(RetryPolicy::fixed(3, 0)),
            ..NodeSettings::default()
        };
        let definition = WorkflowDefinition::new("flaky")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::action("call", "flaky").with_settings(settings))
            .with_edge("start", "call");
        let (engine, _) = engine_with(ExecutorRegistry::new().register("flaky", flaky.clone()));

        let ctx = engine.run(&definition, json!({})).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        assert_eq!(flaky.calls(), 3);
        assert_eq!(ctx.node_states[&id("call")].attempts, 3);
    }

    #[tokio::test]
    async fn continue_on_error_emits_an_error_item() {
        let settings = NodeSettings {
            on_error: ErrorPolicy::Continue,
            ..NodeSettings::default()
        };
        let definition = WorkflowDefinition::new("keep going")
            .with_node(NodeSpec::trigger("start"))
            .with_node(
                NodeSpec::action("broken", "stop-and-error")
                    .with_parameter("message", json!("nope"))
                    .with_settings(settings),
            )
            .with_node(NodeSpec::action("after", "noop"))
            .with_edge("start", "broken")
            .with_edge("broken", "after");

        let ctx = Engine::new().run(&definition, json!({})).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        let items = ctx.output(&id("after")).unwrap_or_default();
        assert!(items[0].is_error());
        assert_eq!(items[0].json["error"]["nodeId"], "broken");
        let record = &ctx.node_states[&id("broken")];
        assert_eq!(record.status, NodeStatus::Completed);
        assert!(record.error.as_deref().is_some_and(|e| e.contains("nope")));
    }

    #[tokio::test]
    async fn stop_on_error_keeps_earlier_outputs() {
        let definition = WorkflowDefinition::new("halt")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::action("broken", "stop-and-error"))
            .with_node(NodeSpec::action("after", "noop"))
            .with_edge("start", "broken")
            .with_edge("broken", "after");

        let ctx = Engine::new().run(&definition, json!({"x": 1})).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Error);
        assert_eq!(outputs(&ctx, "start"), vec![json!({"x": 1})]);
        assert_eq!(ctx.node_status(&id("after")), NodeStatus::Idle);
        let error = ctx.error.expect("run error");
        assert_eq!(error.node_type.as_deref(), Some("action"));
    }

    #[tokio::test]
    async fn errors_inside_loops_carry_the_iteration() {
        let definition = WorkflowDefinition::new("nested failure")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new("each", foreach(Some(json!([1, 0])), &["invert"])))
            .with_node(
                NodeSpec::action("invert", "set")
                    .with_parameter("value", json!("{{ 1 / $json }}"))
                    .with_parent("each"),
            )
            .with_edge("start", "each");

        let ctx = Engine::new().run(&definition, json!({})).await.expect("run");

        let error = ctx.error.expect("run error");
        assert_eq!(error.node_id, Some(id("invert")));
        assert_eq!(error.frames.len(), 1);
        assert_eq!(error.frames[0].step, FrameStep::Iteration { index: 1 });
    }

    #[tokio::test]
    async fn disabled_nodes_pass_input_through() {
        let settings = NodeSettings {
            disabled: true,
            ..NodeSettings::default()
        };
        let definition = WorkflowDefinition::new("skip")
            .with_node(NodeSpec::trigger("start"))
            .with_node(
                NodeSpec::action("overwrite", "set")
                    .with_parameter("value", json!(99))
                    .with_settings(settings),
            )
            .with_edge("start", "overwrite");

        let ctx = Engine::new().run(&definition, json!({"keep": true})).await.expect("run");

        assert_eq!(outputs(&ctx, "overwrite"), vec![json!({"keep": true})]);
    }

    #[tokio::test]
    async fn cycles_are_rejected_outside_loops() {
        let definition = WorkflowDefinition::new("cycle")
            .with_node(NodeSpec::action("a", "noop"))
            .with_node(NodeSpec::action("b", "noop"))
            .with_edge("a", "b")
            .with_edge("b", "a");
        let engine = Engine::new();

        let err = engine.validate(&definition).expect_err("cycle");
        assert!(matches!(
            err.current_context(),
            WorkflowError::InvalidGraph {
                error: GraphError::CycleDetected { .. },
                ..
            }
        ));
        assert!(engine.run(&definition, json!({})).await.is_err());

        let looped = WorkflowDefinition::new("loop cycle")
            .with_node(NodeSpec::new("each", foreach(None, &["a", "b"])))
            .with_node(NodeSpec::action("a", "noop").with_parent("each"))
            .with_node(NodeSpec::action("b", "noop").with_parent("each"))
            .with_edge("a", "b")
            .with_edge("b", "a");
        assert!(engine.validate(&looped).is_ok());
    }

    struct CancelOnRun(CancellationFlag);

    #[async_trait]
    impl NodeExecutor for CancelOnRun {
        async fn execute(
            &self,
            invocation: &NodeInvocation<'_>,
        ) -> Result<NodeOutput, NodeExecutionError> {
            self.0.cancel();
            Ok(NodeOutput::items(invocation.items.clone()))
        }
    }

    #[tokio::test]
    async fn cancellation_stops_between_nodes() {
        let cancel = CancellationFlag::new();
        let after = MockExecutor::passthrough();
        let (engine, repository) = engine_with(
            ExecutorRegistry::new()
                .register("cancel", CancelOnRun(cancel.clone()))
                .register("after", after.clone()),
        );
        let definition = WorkflowDefinition::new("cancel")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::action("stop", "cancel"))
            .with_node(NodeSpec::action("after", "after"))
            .with_edge("start", "stop")
            .with_edge("stop", "after");

        let ctx = engine
            .run_with(&definition, json!({}), ExecutionMode::Manual, cancel)
            .await
            .expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Cancelled);
        assert_eq!(after.calls(), 0);
        assert_eq!(ctx.node_status(&id("stop")), NodeStatus::Completed);
        let saved = repository
            .load_execution_state(ctx.execution_id)
            .await
            .expect("saved");
        assert_eq!(saved.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn events_bracket_the_run() {
        let (sink, mut receiver) = ChannelSink::channel();
        let engine = Engine::new().with_events(Arc::new(sink));
        let definition = WorkflowDefinition::new("events").with_node(NodeSpec::trigger("start"));

        let ctx = engine.run(&definition, json!({})).await.expect("run");

        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(ExecutionEvent::ExecutionStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::ExecutionFinished {
                status: ExecutionStatus::Success,
                ..
            })
        ));
        assert!(events.iter().any(|event| matches!(
            event,
            ExecutionEvent::NodeStatusChanged { node_id, status: NodeStatus::Completed, .. }
                if node_id == &id("start")
        )));
        assert!(events.iter().all(|event| event.execution_id() == ctx.execution_id));
    }

    #[tokio::test]
    async fn run_by_id_loads_the_stored_definition() {
        let (engine, repository) = engine_with(ExecutorRegistry::with_builtins());
        let definition = WorkflowDefinition::new("stored").with_node(NodeSpec::trigger("start"));
        repository
            .save_workflow_definition(&definition)
            .await
            .expect("save");

        let ctx = engine.run_by_id(definition.id, json!({"a": 1})).await.expect("run");
        assert_eq!(ctx.mode, ExecutionMode::Trigger);
        assert_eq!(outputs(&ctx, "start"), vec![json!({"a": 1})]);

        let err = engine
            .run_by_id(WorkflowId::new(), json!({}))
            .await
            .expect_err("missing");
        assert!(matches!(err.current_context(), WorkflowError::NotFound { .. }));
    }

    #[derive(Default)]
    struct InFlight {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    struct Tracking(Arc<InFlight>);

    #[async_trait]
    impl NodeExecutor for Tracking {
        async fn execute(
            &self,
            invocation: &NodeInvocation<'_>,
        ) -> Result<NodeOutput, NodeExecutionError> {
            let now = self.0.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.current.fetch_sub(1, Ordering::SeqCst);
            Ok(NodeOutput::items(invocation.items.clone()))
        }
    }

    #[tokio::test]
    async fn parallel_concurrency_bounds_branches_in_flight() {
        let in_flight = Arc::new(InFlight::default());
        let (engine, _) = engine_with(
            ExecutorRegistry::new().register("track", Tracking(Arc::clone(&in_flight))),
        );
        let definition = WorkflowDefinition::new("bounded")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new(
                "fan",
                NodeKind::ParallelContainer(ParallelConfig {
                    concurrency: Some(2),
                    items_per_branch: 1,
                    failure_strategy: FailureStrategy::FailFast,
                    nodes: vec![id("track")],
                }),
            ))
            .with_node(NodeSpec::action("track", "track").with_parent("fan"))
            .with_edge("start", "fan");

        let ctx = engine
            .run(&definition, json!([0, 1, 2, 3, 4, 5]))
            .await
            .expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        assert_eq!(outputs(&ctx, "fan"), vec![json!(0), json!(1), json!(2), json!(3), json!(4), json!(5)]);
        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 2);
    }

    /// A container whose body counts, then raises the cancellation flag.
    fn cancelling_body(container: NodeKind) -> WorkflowDefinition {
        WorkflowDefinition::new("cancel inside")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new("outer", container))
            .with_node(NodeSpec::action("count", "count").with_parent("outer"))
            .with_node(NodeSpec::action("stop", "cancel").with_parent("outer"))
            .with_node(NodeSpec::action("after", "count"))
            .with_edge("start", "outer")
            .with_edge("count", "stop")
            .with_edge("outer", "after")
    }

    async fn run_until_cancelled(
        definition: &WorkflowDefinition,
        trigger: JsonValue,
    ) -> (ExecutionContext, MockExecutor) {
        let cancel = CancellationFlag::new();
        let count = MockExecutor::passthrough();
        let (engine, _) = engine_with(
            ExecutorRegistry::new()
                .register("count", count.clone())
                .register("cancel", CancelOnRun(cancel.clone())),
        );
        let ctx = engine
            .run_with(definition, trigger, ExecutionMode::Manual, cancel)
            .await
            .expect("run");
        (ctx, count)
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_loop_iteration() {
        let definition = cancelling_body(foreach(None, &["count", "stop"]));

        let (ctx, count) = run_until_cancelled(&definition, json!([1, 2, 3])).await;

        assert_eq!(ctx.status, ExecutionStatus::Cancelled);
        assert_eq!(count.calls(), 1);
        assert_eq!(ctx.node_status(&id("after")), NodeStatus::Idle);
    }

    #[tokio::test]
    async fn cancellation_stops_queued_parallel_branches() {
        let definition = cancelling_body(NodeKind::ParallelContainer(ParallelConfig {
            concurrency: Some(1),
            items_per_branch: 1,
            failure_strategy: FailureStrategy::CollectErrors,
            nodes: vec![id("count"), id("stop")],
        }));

        let (ctx, count) = run_until_cancelled(&definition, json!([1, 2, 3])).await;

        assert_eq!(ctx.status, ExecutionStatus::Cancelled);
        assert_eq!(count.calls(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_batch() {
        let definition = cancelling_body(NodeKind::BatchContainer(BatchConfig {
            batch_size: 2,
            inter_batch_delay_ms: 0,
            nodes: vec![id("count"), id("stop")],
        }));

        let (ctx, count) = run_until_cancelled(&definition, json!([1, 2, 3, 4, 5])).await;

        assert_eq!(ctx.status, ExecutionStatus::Cancelled);
        assert_eq!(count.calls(), 1);
    }

    #[tokio::test]
    async fn iteration_delay_spaces_loop_iterations() {
        let definition = WorkflowDefinition::new("paced loop")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new(
                "each",
                NodeKind::LoopContainer(LoopConfig {
                    mode: LoopMode::Foreach,
                    items: None,
                    condition: None,
                    max_iterations: None,
                    iteration_delay_ms: 25,
                    nodes: vec![id("pass")],
                }),
            ))
            .with_node(NodeSpec::action("pass", "noop").with_parent("each"))
            .with_edge("start", "each");

        let started = Instant::now();
        let ctx = Engine::new().run(&definition, json!([1, 2, 3])).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        assert_eq!(outputs(&ctx, "each"), vec![json!(1), json!(2), json!(3)]);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn inter_batch_delay_spaces_batches() {
        let definition = WorkflowDefinition::new("paced batches")
            .with_node(NodeSpec::trigger("start"))
            .with_node(NodeSpec::new(
                "chunks",
                NodeKind::BatchContainer(BatchConfig {
                    batch_size: 1,
                    inter_batch_delay_ms: 25,
                    nodes: vec![id("pass")],
                }),
            ))
            .with_node(NodeSpec::action("pass", "noop").with_parent("chunks"))
            .with_edge("start", "chunks");

        let started = Instant::now();
        let ctx = Engine::new().run(&definition, json!([1, 2, 3])).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        assert_eq!(outputs(&ctx, "chunks"), vec![json!(1), json!(2), json!(3)]);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    /// Echoes the prompt and keeps every request it saw.
    #[derive(Clone, Default)]
    struct RecordingBackend {
        requests: Arc<Mutex<Vec<LlmRequest>>>,
    }

    impl RecordingBackend {
        fn requests(&self) -> Vec<LlmRequest> {
            self.requests.lock().expect("requests").clone()
        }
    }

    #[async_trait]
    impl LlmBackend for RecordingBackend {
        async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            self.requests.lock().expect("requests").push(request.clone());
            Ok(LlmResponse {
                content: request.prompt.clone(),
                structured_output: None,
                usage: TokenUsage::default(),
                model: "recording".to_string(),
            })
        }

        fn provider(&self) -> LlmProvider {
            LlmProvider::Scripted
        }

        fn model(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test]
    async fn ai_agent_resolves_prompts_per_item() {
        let backend = RecordingBackend::default();
        let (engine, _) = engine_with(
            ExecutorRegistry::with_builtins().with_llm(Arc::new(backend.clone())),
        );
        let definition = WorkflowDefinition::new("summaries")
            .with_node(NodeSpec::trigger("start"))
            .with_node(
                NodeSpec::new(
                    "summarize",
                    NodeKind::AiAgent(AiAgentConfig {
                        model: Some("small".to_string()),
                        prompt: "Summarize {{ $json.title }}".to_string(),
                        system: Some("Answer in {{ $json.lang }}".to_string()),
                    }),
                )
                .with_parameter("temperature", json!(0.5))
                .with_parameter("maxTokens", json!("{{ $json.budget }}")),
            )
            .with_edge("start", "summarize");
        let trigger = json!([
            {"title": "Q3 report", "lang": "Norwegian", "budget": 64},
            {"title": "roadmap", "lang": "English", "budget": 32},
        ]);

        let ctx = engine.run(&definition, trigger).await.expect("run");

        assert_eq!(ctx.status, ExecutionStatus::Success);
        let responses: Vec<_> = outputs(&ctx, "summarize")
            .iter()
            .map(|item| item["response"].clone())
            .collect();
        assert_eq!(responses, vec![json!("Summarize Q3 report"), json!("Summarize roadmap")]);

        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].system.as_deref(), Some("Answer in Norwegian"));
        assert_eq!(requests[1].system.as_deref(), Some("Answer in English"));
        assert_eq!(requests[0].model.as_deref(), Some("small"));
        assert_eq!(requests[0].temperature, Some(0.5));
        assert_eq!(requests[0].max_tokens, Some(64));
        assert_eq!(requests[1].max_tokens, Some(32));
    }
}
