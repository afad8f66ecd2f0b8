//! Node filters.

use std::collections::HashSet;

use quiver_traits::{FunctionId, TargetType};

use super::graph::DependencyNode;

/// Predicate selecting nodes for a subgraph.
pub trait NodeFilter {
    /// Returns true if the node is kept.
    fn accept(&self, node: &DependencyNode) -> bool;
}

impl<F> NodeFilter for F
where
    F: Fn(&DependencyNode) -> bool,
{
    fn accept(&self, node: &DependencyNode) -> bool {
        self(node)
    }
}

/// Keeps nodes whose target is assignable to a type.
#[derive(Debug, Clone, Copy)]
pub struct TargetTypeFilter(pub TargetType);

impl NodeFilter for TargetTypeFilter {
    fn accept(&self, node: &DependencyNode) -> bool {
        self.0.is_assignable_from(node.target.target_type)
    }
}

/// Keeps nodes invoking one of a set of functions.
#[derive(Debug, Clone, Default)]
pub struct FunctionFilter(HashSet<FunctionId>);

impl FunctionFilter {
    /// Create a filter accepting the given functions.
    pub fn new(ids: impl IntoIterator<Item = FunctionId>) -> Self {
        Self(ids.into_iter().collect())
    }
}

impl NodeFilter for FunctionFilter {
    fn accept(&self, node: &DependencyNode) -> bool {
        self.0.contains(node.function_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use quiver_traits::{
        ComputationTarget, ComputeFunction, FunctionDefinition, Value, ValueProperties,
        ValueRequirement, ValueSpecification,
    };

    use crate::depgraph::{DependencyGraph, RootBinding};

    fn node(id: &str, target: ComputationTarget, inputs: Vec<ValueSpecification>) -> DependencyNode {
        let function: Arc<dyn FunctionDefinition> = Arc::new(ComputeFunction::new(
            id,
            target.target_type,
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

    /// YIELD on a government bond feeding BETA on an equity.
    fn mixed_graph() -> (DependencyGraph, ValueSpecification) {
        let gilt = ComputationTarget::security(TargetType::GovernmentBond, "G1");
        let equity = ComputationTarget::security(TargetType::Equity, "E1");
        let quote = ValueSpecification::external(&ValueRequirement::new("Quote", gilt.clone()));

        let yield_node = node("YIELD", gilt, vec![quote.clone()]);
        let yield_out = yield_node.outputs[0].clone();
        let beta_node = node("BETA", equity.clone(), vec![yield_out.clone()]);
        let beta_out = beta_node.outputs[0].clone();

        let mut graph = DependencyGraph::new(Utc::now());
        let y = graph.add_node(yield_node);
        let b = graph.add_node(beta_node);
        graph.add_edge(y, b);
        graph.mark_external(quote);
        graph.add_root(RootBinding {
            requirement: ValueRequirement::new("BETA", equity),
            specification: beta_out,
            node: Some(b),
        });
        (graph, yield_out)
    }

    #[test]
    fn test_target_type_filter_keeps_subtypes() {
        let (graph, _) = mixed_graph();

        let bonds = graph.subgraph(&TargetTypeFilter(TargetType::Bond));
        assert_eq!(bonds.node_count(), 1);
        assert_eq!(
            bonds.nodes().next().map(|(_, n)| n.function_id().as_str()),
            Some("YIELD")
        );
        assert!(bonds.roots().is_empty());
        bonds.validate().unwrap();

        let securities = graph.subgraph(&TargetTypeFilter(TargetType::Security));
        assert_eq!(securities.node_count(), 2);
        assert_eq!(securities.edge_count(), 1);
        assert_eq!(securities.roots().len(), 1);
    }

    #[test]
    fn test_function_filter_cuts_upstream() {
        let (graph, yield_out) = mixed_graph();

        let sub = graph.subgraph(&FunctionFilter::new([FunctionId::new("BETA")]));
        assert_eq!(sub.node_count(), 1);
        assert_eq!(sub.edge_count(), 0);
        assert!(sub.is_external(&yield_out));
        assert_eq!(sub.roots().len(), 1);
        sub.validate().unwrap();

        let none = graph.subgraph(&FunctionFilter::default());
        assert!(none.is_empty());
    }
}
