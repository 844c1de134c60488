//! What an expression can see.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The data an expression is evaluated against.
///
/// The clock is part of the bindings: evaluating the same expression against
/// the same bindings always yields the same value.
pub trait Bindings {
    /// The current item's json (`$json`, bare identifiers).
    fn item(&self) -> &Value;

    /// Index of the current item within the node's input (`$item`).
    fn item_index(&self) -> usize;

    /// The json payloads of a named node's output (`$node["id"]`), or
    /// `None` if the node has not produced output.
    fn node_output(&self, node: &str) -> Option<Vec<Value>>;

    /// Workflow variables (`$vars`).
    fn variables(&self) -> &Map<String, Value>;

    /// Current loop iteration (`$iteration`), when inside a loop.
    fn iteration(&self) -> Option<usize> {
        None
    }

    /// Reference time for `now()` and `today()`.
    fn now(&self) -> DateTime<Utc>;
}

/// Owned bindings, for tests and one-off evaluation.
#[derive(Debug, Clone)]
pub struct StaticBindings {
    pub item: Value,
    pub item_index: usize,
    pub nodes: BTreeMap<String, Vec<Value>>,
    pub variables: Map<String, Value>,
    pub iteration: Option<usize>,
    pub now: DateTime<Utc>,
}

impl StaticBindings {
    /// Bindings over a single item, with the clock fixed at creation.
    #[must_use]
    pub fn new(item: Value) -> Self {
        Self {
            item,
            item_index: 0,
            nodes: BTreeMap::new(),
            variables: Map::new(),
            iteration: None,
            now: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>, items: Vec<Value>) -> Self {
        self.nodes.insert(node.into(), items);
        self
    }

    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

impl Bindings for StaticBindings {
    fn item(&self) -> &Value {
        &self.item
    }

    fn item_index(&self) -> usize {
        self.item_index
    }

    fn node_output(&self, node: &str) -> Option<Vec<Value>> {
        self.nodes.get(node).cloned()
    }

    fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    fn iteration(&self) -> Option<usize> {
        self.iteration
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}
