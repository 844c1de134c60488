//! Validated workflow graph.
//!
//! A [`WorkflowGraph`] is built once from a [`WorkflowDefinition`] and is
//! read-only afterwards. Nodes live in an arena indexed by declaration
//! order. Each container slot, plus the top level, forms a [`Scope`]: the
//! node set one scheduler instance walks, with its edges pre-indexed.
//!
//! Edges inside a loop body may form cycles. Those are iteration feedback:
//! a depth-first pass in declaration order marks the back edges, which are
//! then ignored for readiness. Anywhere else a cycle is an error.

use crate::definition::WorkflowDefinition;
use crate::edge::EdgeSpec;
use crate::error::{GraphError, slot_owner};
use crate::node::{LoopMode, NodeId, NodeKind, NodeSpec, Slot};
use klikkflow_expression::Expression;
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{DfsEvent, depth_first_search};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Identifies a scope within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ScopeId(usize);

impl ScopeId {
    /// The top-level scope.
    pub const ROOT: Self = Self(0);
}

/// The nodes of one scheduling scope and the edges between them.
#[derive(Debug, Clone)]
pub struct Scope {
    owner: Option<(usize, Slot)>,
    nodes: Vec<usize>,
    incoming: HashMap<usize, Vec<usize>>,
    sinks: Vec<usize>,
    feedback: BTreeSet<usize>,
}

impl Scope {
    fn new(owner: Option<(usize, Slot)>) -> Self {
        Self {
            owner,
            nodes: Vec::new(),
            incoming: HashMap::new(),
            sinks: Vec::new(),
            feedback: BTreeSet::new(),
        }
    }

    /// The container and slot owning this scope; `None` at top level.
    #[must_use]
    pub fn owner(&self) -> Option<(usize, Slot)> {
        self.owner
    }

    /// Member nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    /// Edges that must deliver before `node` is ready, in edge order.
    /// Loop feedback edges are excluded.
    #[must_use]
    pub fn incoming(&self, node: usize) -> &[usize] {
        self.incoming.get(&node).map_or(&[], Vec::as_slice)
    }

    /// Whether `node` has no upstream edge in this scope.
    #[must_use]
    pub fn is_entry(&self, node: usize) -> bool {
        self.incoming(node).is_empty()
    }

    /// Nodes without a downstream edge, in declaration order. Their outputs
    /// form the scope's output.
    #[must_use]
    pub fn sinks(&self) -> &[usize] {
        &self.sinks
    }

    /// Edges ignored as loop iteration feedback.
    #[must_use]
    pub fn feedback_edges(&self) -> &BTreeSet<usize> {
        &self.feedback
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A workflow definition that passed structural validation.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    definition: WorkflowDefinition,
    index: HashMap<NodeId, usize>,
    parent: Vec<Option<(usize, Slot)>>,
    scopes: Vec<Scope>,
    slots: HashMap<(usize, Slot), ScopeId>,
    endpoints: Vec<(usize, usize)>,
    outgoing: Vec<Vec<usize>>,
}

impl WorkflowGraph {
    /// Validates a definition and indexes it for execution.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] describing the first structural problem:
    /// duplicate or unknown ids, broken container ownership, edges across
    /// scopes, unusable container configuration, or a cycle outside a loop.
    pub fn build(definition: WorkflowDefinition) -> Result<Self, GraphError> {
        let nodes = &definition.nodes;
        let count = nodes.len();

        let mut index = HashMap::with_capacity(count);
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
        }

        let parent = ownership(nodes, &index)?;
        check_parent_declarations(nodes, &parent)?;
        for node in nodes {
            check_config(node)?;
        }

        // Scopes: the top level first, then every container slot in
        // declaration order.
        let mut scopes = vec![Scope::new(None)];
        let mut slots = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            for (slot, _) in node.kind.child_slots() {
                let id = ScopeId(scopes.len());
                scopes.push(Scope::new(Some((i, slot))));
                slots.insert((i, slot), id);
            }
        }
        let scope_of: Vec<ScopeId> = parent
            .iter()
            .map(|owner| owner.and_then(|key| slots.get(&key).copied()).unwrap_or(ScopeId::ROOT))
            .collect();
        for (i, scope) in scope_of.iter().enumerate() {
            scopes[scope.0].nodes.push(i);
        }

        let mut endpoints = Vec::with_capacity(definition.edges.len());
        for edge in &definition.edges {
            let resolve = |id: &NodeId| {
                index.get(id).copied().ok_or_else(|| GraphError::UnknownNode {
                    node_id: id.clone(),
                    referenced_by: format!("edge {edge}"),
                })
            };
            let (source, target) = (resolve(&edge.source)?, resolve(&edge.target)?);
            if scope_of[source] != scope_of[target] {
                return Err(GraphError::CrossScopeEdge {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                });
            }
            endpoints.push((source, target));
        }

        let loop_body: Vec<bool> = scopes
            .iter()
            .map(|scope| {
                scope.owner.is_some_and(|(container, _)| {
                    matches!(nodes[container].kind, NodeKind::LoopContainer(_))
                })
            })
            .collect();
        check_acyclic(nodes, &endpoints, |source| loop_body[scope_of[source].0])?;

        let mut outgoing = vec![Vec::new(); count];
        for scope_index in 0..scopes.len() {
            let scope_id = ScopeId(scope_index);
            let members: Vec<(usize, usize, usize)> = endpoints
                .iter()
                .enumerate()
                .filter(|(_, (source, _))| scope_of[*source] == scope_id)
                .map(|(edge, (source, target))| (*source, *target, edge))
                .collect();
            let feedback = if loop_body[scope_index] {
                back_edges(&scopes[scope_index].nodes, &members)
            } else {
                BTreeSet::new()
            };

            let scope = &mut scopes[scope_index];
            let mut has_downstream = HashSet::new();
            for &(source, target, edge) in &members {
                if feedback.contains(&edge) {
                    continue;
                }
                scope.incoming.entry(target).or_default().push(edge);
                outgoing[source].push(edge);
                has_downstream.insert(source);
            }
            scope.sinks = scope
                .nodes
                .iter()
                .copied()
                .filter(|node| !has_downstream.contains(node))
                .collect();
            scope.feedback = feedback;
        }

        Ok(Self {
            definition,
            index,
            parent,
            scopes,
            slots,
            endpoints,
            outgoing,
        })
    }

    #[must_use]
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Returns a node by arena index.
    ///
    /// # Panics
    ///
    /// Panics if `index` did not come from this graph.
    #[must_use]
    pub fn node(&self, index: usize) -> &NodeSpec {
        &self.definition.nodes[index]
    }

    #[must_use]
    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Returns an edge by index.
    ///
    /// # Panics
    ///
    /// Panics if `index` did not come from this graph.
    #[must_use]
    pub fn edge(&self, index: usize) -> &EdgeSpec {
        &self.definition.edges[index]
    }

    /// The top-level scope.
    #[must_use]
    pub fn root(&self) -> &Scope {
        &self.scopes[ScopeId::ROOT.0]
    }

    /// The scope of a container slot, if the container has that slot.
    #[must_use]
    pub fn slot(&self, container: usize, slot: Slot) -> Option<&Scope> {
        self.slots
            .get(&(container, slot))
            .map(|id| &self.scopes[id.0])
    }

    /// The top-level node that is `node` or encloses it.
    #[must_use]
    pub fn top_level_ancestor(&self, node: usize) -> usize {
        let mut current = node;
        while let Some((container, _)) = self.parent[current] {
            current = container;
        }
        current
    }

    /// Every node nested inside `container`, at any depth.
    #[must_use]
    pub fn nested(&self, container: usize) -> BTreeSet<usize> {
        let mut found = BTreeSet::new();
        let mut stack = vec![container];
        while let Some(current) = stack.pop() {
            for (slot, _) in self.node(current).kind.child_slots() {
                if let Some(scope) = self.slot(current, slot) {
                    for &child in scope.nodes() {
                        if found.insert(child) {
                            stack.push(child);
                        }
                    }
                }
            }
        }
        found
    }

    /// `node`, everything downstream of it in its scope, and everything
    /// nested inside any of those.
    #[must_use]
    pub fn downstream_of(&self, node: usize) -> BTreeSet<usize> {
        let mut reached = BTreeSet::from([node]);
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            for &edge in &self.outgoing[current] {
                let (_, target) = self.endpoints[edge];
                if reached.insert(target) {
                    stack.push(target);
                }
            }
        }
        let nested: Vec<usize> = reached.iter().flat_map(|&n| self.nested(n)).collect();
        reached.extend(nested);
        reached
    }

    /// Arena indices of an edge's source and target.
    ///
    /// # Panics
    ///
    /// Panics if `edge` did not come from this graph.
    #[must_use]
    pub fn endpoints(&self, edge: usize) -> (usize, usize) {
        self.endpoints[edge]
    }
}

/// Maps every child to the container slot listing it.
fn ownership(
    nodes: &[NodeSpec],
    index: &HashMap<NodeId, usize>,
) -> Result<Vec<Option<(usize, Slot)>>, GraphError> {
    let mut parent: Vec<Option<(usize, Slot)>> = vec![None; nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for (slot, children) in node.kind.child_slots() {
            for child in children {
                let c = *index.get(child).ok_or_else(|| GraphError::UnknownNode {
                    node_id: child.clone(),
                    referenced_by: slot_owner(&node.id, slot),
                })?;
                if c == i {
                    return Err(GraphError::ContainmentCycle {
                        node_id: node.id.clone(),
                    });
                }
                if parent[c].is_some() {
                    return Err(GraphError::MultipleParents {
                        node_id: child.clone(),
                    });
                }
                parent[c] = Some((i, slot));
            }
        }
    }

    // Each node has at most one parent, so a walk upwards either reaches the
    // top level or comes back to where it started.
    for start in 0..nodes.len() {
        let mut current = start;
        for _ in 0..nodes.len() {
            match parent[current] {
                Some((container, _)) if container == start => {
                    return Err(GraphError::ContainmentCycle {
                        node_id: nodes[start].id.clone(),
                    });
                }
                Some((container, _)) => current = container,
                None => break,
            }
        }
    }
    Ok(parent)
}

fn check_parent_declarations(
    nodes: &[NodeSpec],
    parent: &[Option<(usize, Slot)>],
) -> Result<(), GraphError> {
    for (i, node) in nodes.iter().enumerate() {
        let Some(declared) = &node.parent_container_id else {
            continue;
        };
        let actual = parent[i].map(|(container, _)| nodes[container].id.clone());
        if actual.as_ref() != Some(declared) {
            return Err(GraphError::ParentMismatch {
                node_id: node.id.clone(),
                declared: declared.clone(),
                actual,
            });
        }
    }
    Ok(())
}

fn check_config(node: &NodeSpec) -> Result<(), GraphError> {
    let invalid = |reason: String| GraphError::InvalidConfig {
        node_id: node.id.clone(),
        reason,
    };
    let parses = |source: &str| {
        Expression::parse(source)
            .map(|_| ())
            .map_err(|err| invalid(err.to_string()))
    };

    if node.kind.is_container() && node.settings.retry_policy().is_some() {
        return Err(invalid(
            "retry applies to leaf nodes; retry a container's work with a try-catch retryPolicy"
                .to_string(),
        ));
    }

    match &node.kind {
        NodeKind::Trigger(_) | NodeKind::Action(_) | NodeKind::AiAgent(_) => {}
        NodeKind::Condition(config) => parses(&config.condition)?,
        NodeKind::LoopContainer(config) => match (&config.mode, &config.condition) {
            (LoopMode::While, None) => {
                return Err(invalid("while loop requires a condition".to_string()));
            }
            (_, Some(condition)) => parses(condition)?,
            (LoopMode::Foreach, None) => {}
        },
        NodeKind::ParallelContainer(config) => {
            if config.concurrency == Some(0) {
                return Err(invalid("concurrency must be at least 1".to_string()));
            }
            if config.items_per_branch == 0 {
                return Err(invalid("itemsPerBranch must be at least 1".to_string()));
            }
        }
        NodeKind::ConditionalContainer(config) => {
            for branch in &config.branches {
                parses(&branch.condition)?;
            }
        }
        NodeKind::TryCatchContainer(_) => {}
        NodeKind::BatchContainer(config) => {
            if config.batch_size == 0 {
                return Err(invalid("batchSize must be at least 1".to_string()));
            }
        }
    }
    Ok(())
}

/// Fails if the edges outside loop bodies form a cycle.
fn check_acyclic(
    nodes: &[NodeSpec],
    endpoints: &[(usize, usize)],
    exempt: impl Fn(usize) -> bool,
) -> Result<(), GraphError> {
    let mut graph = DiGraph::<usize, ()>::with_capacity(nodes.len(), endpoints.len());
    let indices: Vec<NodeIndex> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();
    for &(source, target) in endpoints {
        if !exempt(source) {
            graph.add_edge(indices[source], indices[target], ());
        }
    }
    if !is_cyclic_directed(&graph) {
        return Ok(());
    }

    let mut cycle: Vec<usize> = tarjan_scc(&graph)
        .into_iter()
        .find(|component| {
            component.len() > 1 || graph.contains_edge(component[0], component[0])
        })
        .map(|component| component.into_iter().map(|ix| graph[ix]).collect())
        .unwrap_or_default();
    cycle.sort_unstable();
    Err(GraphError::CycleDetected {
        nodes: cycle.into_iter().map(|i| nodes[i].id.clone()).collect(),
    })
}

/// Marks the back edges of a loop body found by a depth-first search that
/// starts from members in declaration order.
fn back_edges(members: &[usize], edges: &[(usize, usize, usize)]) -> BTreeSet<usize> {
    let mut graph = DiGraph::<usize, ()>::with_capacity(members.len(), edges.len());
    let local: HashMap<usize, NodeIndex> = members
        .iter()
        .map(|&node| (node, graph.add_node(node)))
        .collect();
    for (source, target, _) in edges {
        if let (Some(&s), Some(&t)) = (local.get(source), local.get(target)) {
            graph.add_edge(s, t, ());
        }
    }

    let mut back = HashSet::new();
    depth_first_search(&graph, graph.node_indices(), |event| {
        if let DfsEvent::BackEdge(u, v) = event {
            back.insert((graph[u], graph[v]));
        }
    });

    edges
        .iter()
        .filter(|(source, target, _)| back.contains(&(*source, *target)))
        .map(|(_, _, edge)| *edge)
        .collect()
}
