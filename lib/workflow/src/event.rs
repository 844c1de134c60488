//! Where execution events go.
//!
//! The engine publishes [`ExecutionEvent`]s to an [`EventSink`] as a run
//! progresses. A failing sink never fails the run; the engine logs and
//! carries on.

use crate::execution::ExecutionEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

/// Errors from publishing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSinkError {
    /// The receiving side is gone.
    Closed,
    /// Publishing failed.
    PublishFailed { message: String },
}

impl std::fmt::Display for EventSinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "event sink closed"),
            Self::PublishFailed { message } => write!(f, "failed to publish event: {message}"),
        }
    }
}

impl std::error::Error for EventSinkError {}

/// Receives execution events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes one event.
    async fn publish(&self, event: ExecutionEvent) -> Result<(), EventSinkError>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn publish(&self, _event: ExecutionEvent) -> Result<(), EventSinkError> {
        Ok(())
    }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiver its events arrive on.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, event: ExecutionEvent) -> Result<(), EventSinkError> {
        self.sender.send(event).map_err(|_| EventSinkError::Closed)
    }
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: ExecutionEvent) -> Result<(), EventSinkError> {
        match &event {
            ExecutionEvent::ExecutionStarted {
                execution_id,
                workflow_id,
                mode,
                ..
            } => info!(%execution_id, %workflow_id, ?mode, "execution started"),
            ExecutionEvent::NodeStatusChanged {
                execution_id,
                node_id,
                status,
                ..
            } => info!(%execution_id, %node_id, ?status, "node status changed"),
            ExecutionEvent::ExecutionFinished {
                execution_id,
                status,
                error,
                ..
            } => info!(%execution_id, %status, error = error.as_deref(), "execution finished"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionMode, ExecutionStatus};
    use chrono::Utc;
    use klikkflow_core::{ExecutionId, WorkflowId};

    fn started() -> ExecutionEvent {
        ExecutionEvent::ExecutionStarted {
            execution_id: ExecutionId::new(),
            workflow_id: WorkflowId::new(),
            mode: ExecutionMode::Manual,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn channel_sink_forwards_in_order() {
        let (sink, mut receiver) = ChannelSink::channel();
        let first = started();
        let second = ExecutionEvent::ExecutionFinished {
            execution_id: first.execution_id(),
            status: ExecutionStatus::Success,
            error: None,
            timestamp: Utc::now(),
        };
        sink.publish(first.clone()).await.expect("publish");
        sink.publish(second.clone()).await.expect("publish");

        assert_eq!(receiver.recv().await, Some(first));
        assert_eq!(receiver.recv().await, Some(second));
    }

    #[tokio::test]
    async fn channel_sink_reports_closed_receiver() {
        let (sink, receiver) = ChannelSink::channel();
        drop(receiver);
        assert_eq!(sink.publish(started()).await, Err(EventSinkError::Closed));
    }

    #[tokio::test]
    async fn noop_and_log_sinks_accept_everything() {
        assert!(NoopSink.publish(started()).await.is_ok());
        assert!(LogSink.publish(started()).await.is_ok());
    }
}
