//! Compiled dependency graph.
//!
//! Nodes are function invocations on a target. An edge runs from the node
//! producing a value to every node consuming it, so `Outgoing` neighbours are
//! dependents and `Incoming` neighbours are dependencies.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use quiver_traits::{
    ComputationTarget, FunctionDefinition, FunctionId, ValueRequirement, ValueSpecification,
};

use super::filter::NodeFilter;
use crate::error::{EngineError, EngineResult};

pub use petgraph::graph::NodeIndex;

// =============================================================================
// NODES
// =============================================================================

/// One function invocation on one target.
///
/// Identity is (function, target, resolved input specifications); the builder
/// never creates two nodes with the same identity.
#[derive(Clone)]
pub struct DependencyNode {
    /// Function to invoke.
    pub function: Arc<dyn FunctionDefinition>,
    /// Target to invoke it on.
    pub target: ComputationTarget,
    /// Resolved inputs, in the order the function declared them.
    pub inputs: Vec<ValueSpecification>,
    /// Everything the invocation produces.
    pub outputs: Vec<ValueSpecification>,
}

impl DependencyNode {
    /// Function ID.
    pub fn function_id(&self) -> &FunctionId {
        self.function.id()
    }

    /// Returns true if the node produces the specification.
    pub fn produces(&self, specification: &ValueSpecification) -> bool {
        self.outputs.contains(specification)
    }
}

impl fmt::Debug for DependencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyNode")
            .field("function", self.function.id())
            .field("target", &self.target)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

impl fmt::Display for DependencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.function.id(), self.target)
    }
}

/// A requested value and where it comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootBinding {
    /// The requested value.
    pub requirement: ValueRequirement,
    /// Specification that satisfies it.
    pub specification: ValueSpecification,
    /// Producing node, or `None` when the value is externally available.
    pub node: Option<NodeIndex>,
}

/// Size summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    /// Function invocations.
    pub nodes: usize,
    /// Producer to consumer links.
    pub edges: usize,
    /// Pre-satisfied input specifications.
    pub external_inputs: usize,
    /// Requested values.
    pub roots: usize,
    /// Nodes with no in-graph dependencies.
    pub leaves: usize,
}

// =============================================================================
// GRAPH
// =============================================================================

/// The DAG of function invocations plus the requested-value bindings.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<DependencyNode, ()>,
    producers: HashMap<ValueSpecification, NodeIndex>,
    external: BTreeSet<ValueSpecification>,
    roots: Vec<RootBinding>,
    resolution_time: DateTime<Utc>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new(resolution_time: DateTime<Utc>) -> Self {
        Self {
            graph: DiGraph::new(),
            producers: HashMap::new(),
            external: BTreeSet::new(),
            roots: Vec::new(),
            resolution_time,
        }
    }

    pub(crate) fn add_node(&mut self, node: DependencyNode) -> NodeIndex {
        let outputs = node.outputs.clone();
        let idx = self.graph.add_node(node);
        for spec in outputs {
            self.producers.insert(spec, idx);
        }
        idx
    }

    pub(crate) fn add_edge(&mut self, producer: NodeIndex, consumer: NodeIndex) {
        self.graph.update_edge(producer, consumer, ());
    }

    pub(crate) fn mark_external(&mut self, specification: ValueSpecification) {
        self.external.insert(specification);
    }

    pub(crate) fn add_root(&mut self, root: RootBinding) {
        if !self.roots.iter().any(|r| r.requirement == root.requirement) {
            self.roots.push(root);
        }
    }

    /// Instant the graph was resolved at.
    pub fn resolution_time(&self) -> DateTime<Utc> {
        self.resolution_time
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Node by index.
    pub fn node(&self, idx: NodeIndex) -> Option<&DependencyNode> {
        self.graph.node_weight(idx)
    }

    /// All nodes with their indices.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &DependencyNode)> {
        self.graph
            .node_indices()
            .filter_map(move |idx| self.graph.node_weight(idx).map(|n| (idx, n)))
    }

    /// Node producing a specification.
    pub fn producer_of(&self, specification: &ValueSpecification) -> Option<NodeIndex> {
        self.producers.get(specification).copied()
    }

    /// Returns true if the specification is pre-satisfied.
    pub fn is_external(&self, specification: &ValueSpecification) -> bool {
        self.external.contains(specification)
    }

    /// Pre-satisfied input specifications.
    pub fn external_inputs(&self) -> impl Iterator<Item = &ValueSpecification> {
        self.external.iter()
    }

    /// Requested value bindings.
    pub fn roots(&self) -> &[RootBinding] {
        &self.roots
    }

    /// Binding for a requested value.
    pub fn root_for(&self, requirement: &ValueRequirement) -> Option<&RootBinding> {
        self.roots.iter().find(|r| &r.requirement == requirement)
    }

    /// Nodes a node consumes from.
    pub fn dependencies(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Incoming)
    }

    /// Nodes consuming from a node.
    pub fn dependents(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Outgoing)
    }

    /// Nodes that consume any of `changed`, directly or through another node.
    ///
    /// A changed specification produced inside the graph marks its
    /// producer's dependents, not the producer itself.
    pub fn downstream_of(&self, changed: &HashSet<ValueSpecification>) -> HashSet<NodeIndex> {
        let mut affected = HashSet::new();
        let mut work: Vec<NodeIndex> = self
            .nodes()
            .filter(|(_, node)| node.inputs.iter().any(|input| changed.contains(input)))
            .map(|(idx, _)| idx)
            .collect();

        while let Some(idx) = work.pop() {
            if affected.insert(idx) {
                work.extend(self.dependents(idx));
            }
        }
        affected
    }

    /// Nodes ordered so that every dependency precedes its dependents.
    pub fn topological_order(&self) -> EngineResult<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|cycle| {
            let node = self
                .graph
                .node_weight(cycle.node_id())
                .map(ToString::to_string)
                .unwrap_or_default();
            EngineError::MalformedGraph(format!("cycle through {}", node))
        })
    }

    /// Check the structural invariants.
    ///
    /// The graph must be acyclic, every node input must be produced by a
    /// linked node in the graph or be pre-satisfied, and every root must point
    /// at a node producing its specification (or at a pre-satisfied value).
    pub fn validate(&self) -> EngineResult<()> {
        self.topological_order()?;

        for (idx, node) in self.nodes() {
            for input in &node.inputs {
                match self.producers.get(input) {
                    Some(&producer) => {
                        if self.graph.find_edge(producer, idx).is_none() {
                            return Err(EngineError::MalformedGraph(format!(
                                "{} consumes {} without an edge from its producer",
                                node, input
                            )));
                        }
                    }
                    None if self.external.contains(input) => {}
                    None => {
                        return Err(EngineError::MalformedGraph(format!(
                            "{} consumes {} which is neither produced nor external",
                            node, input
                        )));
                    }
                }
            }
        }

        for root in &self.roots {
            match root.node {
                Some(idx) => {
                    let produces = self
                        .node(idx)
                        .map(|n| n.produces(&root.specification))
                        .unwrap_or(false);
                    if !produces {
                        return Err(EngineError::MalformedGraph(format!(
                            "root {} is not produced by its node",
                            root.requirement
                        )));
                    }
                }
                None if self.external.contains(&root.specification) => {}
                None => {
                    return Err(EngineError::MalformedGraph(format!(
                        "root {} has no producer",
                        root.requirement
                    )));
                }
            }
        }

        Ok(())
    }

    /// Graph restricted to the nodes a filter accepts.
    ///
    /// Inputs whose producers are filtered out become pre-satisfied; the
    /// caller is expected to have their values in the cache. Roots whose
    /// producer is filtered out are dropped.
    pub fn subgraph(&self, filter: &impl NodeFilter) -> DependencyGraph {
        let mut sub = DependencyGraph::new(self.resolution_time);
        let mut mapping: HashMap<NodeIndex, NodeIndex> = HashMap::new();

        for (idx, node) in self.nodes() {
            if filter.accept(node) {
                mapping.insert(idx, sub.add_node(node.clone()));
            }
        }

        for (&old, &new) in &mapping {
            let Some(node) = self.node(old) else { continue };
            for input in &node.inputs {
                match self.producers.get(input).and_then(|p| mapping.get(p)) {
                    Some(&producer) => sub.add_edge(producer, new),
                    None => sub.mark_external(input.clone()),
                }
            }
        }

        for root in &self.roots {
            match root.node {
                Some(old) => {
                    if let Some(&new) = mapping.get(&old) {
                        sub.add_root(RootBinding {
                            node: Some(new),
                            ..root.clone()
                        });
                    }
                }
                None => {
                    sub.mark_external(root.specification.clone());
                    sub.add_root(root.clone());
                }
            }
        }

        sub
    }

    /// Size summary.
    pub fn stats(&self) -> GraphStats {
        let leaves = self
            .graph
            .node_indices()
            .filter(|&idx| self.dependencies(idx).next().is_none())
            .count();
        GraphStats {
            nodes: self.graph.node_count(),
            edges: self.graph.edge_count(),
            external_inputs: self.external.len(),
            roots: self.roots.len(),
            leaves,
        }
    }

    /// Distinct functions used by the graph.
    pub fn functions(&self) -> HashSet<&FunctionId> {
        self.graph
            .node_weights()
            .map(|n| n.function.id())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_traits::{ComputeFunction, TargetType, Value, ValueProperties};

    fn node(id: &str, inputs: Vec<ValueSpecification>) -> DependencyNode {
        let target = ComputationTarget::security(TargetType::Bond, "B1");
        let function: Arc<dyn FunctionDefinition> = Arc::new(ComputeFunction::new(
            id,
            TargetType::Bond,
            id,
            |_, _| Ok(Value::Double(0.0)),
        ));
        let output = ValueSpecification::new(
            id,
            target.clone(),
            ValueProperties::new(),
            FunctionId::new(id),
        );
        DependencyNode {
            function,
            target,
            inputs,
            outputs: vec![output],
        }
    }

    fn chain() -> (DependencyGraph, NodeIndex, NodeIndex) {
        let mut graph = DependencyGraph::new(Utc::now());
        let external = ValueSpecification::external(&ValueRequirement::new(
            "Quote",
            ComputationTarget::security(TargetType::Bond, "B1"),
        ));
        let a = node("A", vec![external.clone()]);
        let a_out = a.outputs[0].clone();
        let b = node("B", vec![a_out]);
        let b_out = b.outputs[0].clone();

        let ia = graph.add_node(a);
        let ib = graph.add_node(b);
        graph.add_edge(ia, ib);
        graph.mark_external(external);
        graph.add_root(RootBinding {
            requirement: ValueRequirement::new("B", ComputationTarget::security(TargetType::Bond, "B1")),
            specification: b_out,
            node: Some(ib),
        });
        (graph, ia, ib)
    }

    #[test]
    fn test_valid_chain() {
        let (graph, ia, ib) = chain();
        graph.validate().unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec![ia, ib]);
        assert_eq!(graph.dependents(ia).collect::<Vec<_>>(), vec![ib]);

        let stats = graph.stats();
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.edges, 1);
        assert_eq!(stats.external_inputs, 1);
        assert_eq!(stats.leaves, 1);
    }

    #[test]
    fn test_downstream_of_changed_input() {
        let (graph, ia, ib) = chain();
        let quote = graph.external_inputs().next().unwrap().clone();
        let a_out = graph.node(ia).unwrap().outputs[0].clone();

        let from_quote = graph.downstream_of(&HashSet::from([quote]));
        assert_eq!(from_quote, HashSet::from([ia, ib]));

        let from_a = graph.downstream_of(&HashSet::from([a_out]));
        assert_eq!(from_a, HashSet::from([ib]));

        assert!(graph.downstream_of(&HashSet::new()).is_empty());
    }

    #[test]
    fn test_missing_producer_is_malformed() {
        let mut graph = DependencyGraph::new(Utc::now());
        let dangling = ValueSpecification::external(&ValueRequirement::new(
            "Nowhere",
            ComputationTarget::primitive("X"),
        ));
        graph.add_node(node("A", vec![dangling]));
        assert!(matches!(graph.validate(), Err(EngineError::MalformedGraph(_))));
    }

    #[test]
    fn test_cycle_is_malformed() {
        let (mut graph, ia, ib) = chain();
        graph.add_edge(ib, ia);
        assert!(matches!(
            graph.topological_order(),
            Err(EngineError::MalformedGraph(_))
        ));
    }

    #[test]
    fn test_subgraph_marks_cut_inputs_external() {
        let (graph, ia, _) = chain();
        let a_out = graph.node(ia).unwrap().outputs[0].clone();

        let sub = graph.subgraph(&|n: &DependencyNode| n.function_id().as_str() == "B");
        assert_eq!(sub.node_count(), 1);
        assert!(sub.is_external(&a_out));
        assert_eq!(sub.roots().len(), 1);
        sub.validate().unwrap();
    }
}
