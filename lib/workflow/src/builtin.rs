//! Built-in action operations.

use crate::executor::{ExecutorRegistry, NodeExecutionError, NodeExecutor, NodeInvocation, NodeOutput};
use crate::item::DataItem;
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;

pub(crate) fn register(registry: ExecutorRegistry) -> ExecutorRegistry {
    registry
        .register("noop", NoOp)
        .register("set", SetFields)
        .register("sum", Sum)
        .register("set-variable", SetVariable)
        .register("stop-and-error", StopAndError)
        .register("wait", Wait)
}

/// Passes its input through.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOp;

#[async_trait]
impl NodeExecutor for NoOp {
    async fn execute(
        &self,
        invocation: &NodeInvocation<'_>,
    ) -> Result<NodeOutput, NodeExecutionError> {
        Ok(NodeOutput::items(invocation.items.clone()))
    }
}

/// Rewrites each item.
///
/// With a `value` parameter the item's json is replaced by it; otherwise the
/// entries of the `fields` object are merged into the item.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetFields;

#[async_trait]
impl NodeExecutor for SetFields {
    async fn execute(
        &self,
        invocation: &NodeInvocation<'_>,
    ) -> Result<NodeOutput, NodeExecutionError> {
        let mut items = Vec::with_capacity(invocation.items.len());
        for (index, item) in invocation.items.iter().enumerate() {
            let mut item = item.clone();
            if let Some(value) = invocation.param(index, "value") {
                item.json = value.clone();
            } else if let Some(fields) = invocation.param(index, "fields") {
                let fields = fields
                    .as_object()
                    .ok_or_else(|| NodeExecutionError::InvalidInput {
                        message: "'fields' must be an object".to_string(),
                    })?;
                if !item.json.is_object() {
                    item.json = json!({});
                }
                if let Some(target) = item.json.as_object_mut() {
                    for (key, value) in fields {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
            items.push(item);
        }
        Ok(NodeOutput::items(items))
    }
}

/// Adds up the items (or one `field` of each) into a single `{"sum": n}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

#[async_trait]
impl NodeExecutor for Sum {
    async fn execute(
        &self,
        invocation: &NodeInvocation<'_>,
    ) -> Result<NodeOutput, NodeExecutionError> {
        let field = invocation
            .param(0, "field")
            .and_then(JsonValue::as_str)
            .map(str::to_string);

        let mut total = 0.0;
        for item in &invocation.items {
            let value = match &field {
                Some(field) => item.json.get(field).unwrap_or(&JsonValue::Null),
                None => &item.json,
            };
            total += value.as_f64().ok_or_else(|| NodeExecutionError::InvalidInput {
                message: format!("cannot sum non-numeric value {value}"),
            })?;
        }

        Ok(NodeOutput::items(vec![DataItem::new(json!({ "sum": number(total) }))]))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn number(value: f64) -> JsonValue {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

/// Writes the `value` parameter into workflow variable `name`, passing the
/// items through.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetVariable;

#[async_trait]
impl NodeExecutor for SetVariable {
    async fn execute(
        &self,
        invocation: &NodeInvocation<'_>,
    ) -> Result<NodeOutput, NodeExecutionError> {
        let name = invocation
            .param(0, "name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| NodeExecutionError::InvalidInput {
                message: "'name' parameter is required".to_string(),
            })?;
        let value = invocation
            .param(0, "value")
            .cloned()
            .unwrap_or(JsonValue::Null);
        Ok(NodeOutput::items(invocation.items.clone()).with_variable(name, value))
    }
}

/// Always fails with the `message` parameter.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopAndError;

#[async_trait]
impl NodeExecutor for StopAndError {
    async fn execute(
        &self,
        invocation: &NodeInvocation<'_>,
    ) -> Result<NodeOutput, NodeExecutionError> {
        let message = invocation
            .param(0, "message")
            .map(klikkflow_expression::display)
            .unwrap_or_else(|| "workflow stopped".to_string());
        Err(NodeExecutionError::ExecutionFailed { message })
    }
}

/// Sleeps for the `ms` parameter of each item, then passes it through.
#[derive(Debug, Clone, Copy, Default)]
pub struct Wait;

#[async_trait]
impl NodeExecutor for Wait {
    async fn execute(
        &self,
        invocation: &NodeInvocation<'_>,
    ) -> Result<NodeOutput, NodeExecutionError> {
        for index in 0..invocation.items.len() {
            let ms = invocation
                .param(index, "ms")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0);
            if ms > 0 {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
        Ok(NodeOutput::items(invocation.items.clone()))
    }
}
