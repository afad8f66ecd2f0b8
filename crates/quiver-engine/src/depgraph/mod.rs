//! Dependency graph model and construction.
//!
//! - [`DependencyGraph`]: the compiled DAG of function invocations
//! - [`DependencyGraphBuilder`]: recursive requirement resolution
//! - [`NodeFilter`]: node predicates used to carve subgraphs

mod builder;
mod filter;
mod graph;

pub use builder::{BuildOutcome, DependencyGraphBuilder, ResolutionFailure, UnsatisfiedRequirement};
pub use filter::{FunctionFilter, NodeFilter, TargetTypeFilter};
pub use graph::{DependencyGraph, DependencyNode, GraphStats, NodeIndex, RootBinding};
