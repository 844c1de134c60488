//! Expression bindings over a running execution.

use crate::execution::ExecutionContext;
use crate::graph::WorkflowGraph;
use crate::item::jsons;
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use klikkflow_expression::Bindings;
use serde_json::{Map, Value as JsonValue};

/// What an expression sees while a node processes one item.
///
/// `$node[...]` accepts a node id or a display name. The clock is captured
/// once per node execution.
#[derive(Debug, Clone, Copy)]
pub struct ItemBindings<'a> {
    item: &'a JsonValue,
    index: usize,
    context: &'a ExecutionContext,
    graph: &'a WorkflowGraph,
    iteration: Option<usize>,
    now: DateTime<Utc>,
}

impl<'a> ItemBindings<'a> {
    #[must_use]
    pub fn new(
        item: &'a JsonValue,
        index: usize,
        context: &'a ExecutionContext,
        graph: &'a WorkflowGraph,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            item,
            index,
            context,
            graph,
            iteration: None,
            now,
        }
    }

    #[must_use]
    pub fn with_iteration(mut self, iteration: Option<usize>) -> Self {
        self.iteration = iteration;
        self
    }
}

impl Bindings for ItemBindings<'_> {
    fn item(&self) -> &JsonValue {
        self.item
    }

    fn item_index(&self) -> usize {
        self.index
    }

    fn node_output(&self, node: &str) -> Option<Vec<JsonValue>> {
        let id = NodeId::new(node);
        if let Some(items) = self.context.output(&id) {
            return Some(jsons(items));
        }
        self.graph
            .definition()
            .nodes
            .iter()
            .find(|spec| spec.name.as_deref() == Some(node))
            .and_then(|spec| self.context.output(&spec.id))
            .map(jsons)
    }

    fn variables(&self) -> &Map<String, JsonValue> {
        &self.context.variables
    }

    fn iteration(&self) -> Option<usize> {
        self.iteration
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;
    use crate::execution::ExecutionMode;
    use crate::item::DataItem;
    use crate::node::NodeSpec;
    use klikkflow_expression::evaluate;
    use serde_json::json;

    #[test]
    fn resolves_nodes_by_id_and_name() {
        let definition = WorkflowDefinition::new("bindings")
            .with_node(NodeSpec::trigger("start").with_name("Start Here"));
        let graph = WorkflowGraph::build(definition.clone()).expect("graph");
        let mut ctx = ExecutionContext::new(definition.id, ExecutionMode::Manual, json!(null));
        ctx.node_outputs
            .insert(NodeId::new("start"), vec![DataItem::new(json!({"n": 5}))]);
        ctx.variables.insert("limit".to_string(), json!(10));

        let item = json!({"n": 1});
        let bindings = ItemBindings::new(&item, 0, &ctx, &graph, Utc::now()).with_iteration(Some(2));

        let value = evaluate(
            r#"{{ $node["start"].json.n + $node["Start Here"].items[0].n + $vars.limit + $iteration + n }}"#,
            &bindings,
        )
        .expect("evaluate");
        assert_eq!(value, json!(23));
    }

    #[test]
    fn missing_node_has_no_output() {
        let definition = WorkflowDefinition::new("bindings").with_node(NodeSpec::trigger("start"));
        let graph = WorkflowGraph::build(definition.clone()).expect("graph");
        let ctx = ExecutionContext::new(definition.id, ExecutionMode::Manual, json!(null));
        let item = json!({});
        let bindings = ItemBindings::new(&item, 0, &ctx, &graph, Utc::now());
        assert!(bindings.node_output("start").is_none());
        assert!(bindings.node_output("nowhere").is_none());
    }
}
