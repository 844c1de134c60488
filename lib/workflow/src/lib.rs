//! Workflow execution engine for klikkflow.
//!
//! This crate runs workflow definitions end to end:
//!
//! - **Data model**: JSON items with optional binary attachments and item pairing
//! - **Graph**: validated node graphs with nested container scopes
//! - **Executors**: pluggable node operations behind [`NodeExecutor`]
//! - **Containers**: loop, parallel, conditional, try-catch and batch sub-graphs
//! - **Execution**: per-run state that doubles as a resumable checkpoint
//! - **Persistence and events**: repository and sink traits with in-memory,
//!   file and channel implementations

pub mod bindings;
pub mod builtin;
pub mod cancel;
pub mod config;
pub mod container;
pub mod definition;
pub mod edge;
pub mod engine;
pub mod error;
pub mod event;
pub mod execution;
pub mod executor;
pub mod graph;
pub mod item;
pub mod node;
pub mod persistence;
pub mod retry;
mod scheduler;

pub use cancel::CancellationFlag;
pub use config::EngineConfig;
pub use container::ContainerState;
pub use definition::{WorkflowDefinition, WorkflowSummary};
pub use edge::EdgeSpec;
pub use engine::Engine;
pub use error::{ContainerFrame, ExecutionError, FrameStep, GraphError, NodeFailure, WorkflowError};
pub use event::{ChannelSink, EventSink, EventSinkError, LogSink, NoopSink};
pub use execution::{
    ExecutionContext, ExecutionEvent, ExecutionMode, ExecutionStatus, NodeRunRecord, NodeStatus,
    RunError,
};
pub use executor::{
    ExecutorRegistry, MockExecutor, NodeExecutionError, NodeExecutor, NodeInvocation, NodeOutput,
};
pub use graph::WorkflowGraph;
pub use item::{BinaryData, DataItem};
pub use node::{ErrorPolicy, NodeId, NodeKind, NodeSettings, NodeSpec};
pub use persistence::{ExecutionRepository, FileRepository, InMemoryRepository, PersistenceError};
pub use retry::{Backoff, RetryPolicy};
