//! Dependency graph builder.
//!
//! Resolves each requested value recursively against a bound resolver and an
//! availability source. The recursion runs on an explicit work stack so deep
//! graphs cannot overflow the thread stack; a path set gives O(1) cycle
//! detection and two memo tables collapse structurally identical
//! requirements and nodes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use quiver_traits::{
    BuildMode, ComputationTarget, DataAvailabilityProvider, FunctionDefinition, FunctionId,
    ValueRequirement, ValueSpecification,
};

use super::graph::{DependencyGraph, DependencyNode, NodeIndex, RootBinding};
use crate::error::{format_path, EngineError, EngineResult};
use crate::resolver::{Candidate, CompiledFunctionResolver};

// =============================================================================
// OUTCOME TYPES
// =============================================================================

/// Why a requirement could not be resolved.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionFailure {
    /// No function produces the value and it is not externally available.
    #[error("no function produces the value")]
    NoCandidates,

    /// Every candidate had an unsatisfiable input.
    #[error("{candidates} candidate(s) exhausted, last unsatisfied input {unsatisfied}")]
    CandidatesExhausted {
        /// Number of candidates tried.
        candidates: usize,
        /// Input that failed for the last candidate.
        unsatisfied: ValueRequirement,
    },

    /// The requirement re-entered its own resolution path.
    #[error("cyclic dependency: {}", format_path(.path))]
    CyclicDependency {
        /// Resolution path, closing on the repeated requirement.
        path: Vec<ValueRequirement>,
    },
}

/// A requested value dropped by a best-effort build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsatisfiedRequirement {
    /// The requested value.
    pub requirement: ValueRequirement,
    /// Why it failed.
    pub reason: ResolutionFailure,
}

/// Result of a build: the graph plus the requested values that were dropped.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// The compiled graph.
    pub graph: Arc<DependencyGraph>,
    /// Requested values that could not be resolved (best-effort only).
    pub failures: Vec<UnsatisfiedRequirement>,
}

impl BuildOutcome {
    /// Returns true if every requested value resolved.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

// =============================================================================
// WORKING STATE
// =============================================================================

/// How a requirement was satisfied.
#[derive(Debug, Clone)]
enum Resolved {
    External(ValueSpecification),
    Node {
        node: usize,
        specification: ValueSpecification,
    },
}

impl Resolved {
    fn specification(&self) -> &ValueSpecification {
        match self {
            Resolved::External(spec) => spec,
            Resolved::Node { specification, .. } => specification,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct NodeKey {
    function: FunctionId,
    target: ComputationTarget,
    inputs: BTreeSet<ValueSpecification>,
}

struct PendingNode {
    function: Arc<dyn FunctionDefinition>,
    target: ComputationTarget,
    inputs: Vec<Resolved>,
    outputs: Vec<ValueSpecification>,
}

/// One requirement under resolution.
struct Frame {
    requirement: ValueRequirement,
    candidates: Vec<Candidate>,
    current: usize,
    inputs: Vec<ValueRequirement>,
    resolved: Vec<Resolved>,
}

impl Frame {
    fn new(requirement: ValueRequirement, candidates: Vec<Candidate>) -> Self {
        let mut frame = Self {
            requirement,
            candidates,
            current: 0,
            inputs: Vec::new(),
            resolved: Vec::new(),
        };
        frame.load_candidate();
        frame
    }

    fn load_candidate(&mut self) {
        self.resolved.clear();
        self.inputs = self.candidates[self.current]
            .function
            .requirements(&self.requirement.target);
    }

    /// Move to the next candidate; false once all are exhausted.
    fn advance(&mut self) -> bool {
        self.current += 1;
        if self.current < self.candidates.len() {
            self.load_candidate();
            true
        } else {
            false
        }
    }
}

enum Step {
    Done(Result<Resolved, ResolutionFailure>),
    Pushed,
}

// =============================================================================
// BUILDER
// =============================================================================

/// Compiles requested values into a [`DependencyGraph`].
pub struct DependencyGraphBuilder {
    resolver: CompiledFunctionResolver,
    availability: Arc<dyn DataAvailabilityProvider>,
    mode: BuildMode,
    memo: HashMap<ValueRequirement, Result<Resolved, ResolutionFailure>>,
    node_keys: HashMap<NodeKey, usize>,
    nodes: Vec<PendingNode>,
}

impl DependencyGraphBuilder {
    /// Create a strict builder.
    pub fn new(
        resolver: CompiledFunctionResolver,
        availability: Arc<dyn DataAvailabilityProvider>,
    ) -> Self {
        Self {
            resolver,
            availability,
            mode: BuildMode::Strict,
            memo: HashMap::new(),
            node_keys: HashMap::new(),
            nodes: Vec::new(),
        }
    }

    /// Set the build mode.
    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    /// Resolve the requested values and assemble the graph.
    ///
    /// In strict mode the first unsatisfied requested value aborts the build.
    /// In best-effort mode it is dropped and reported in the outcome.
    pub fn build(mut self, requirements: &[ValueRequirement]) -> EngineResult<BuildOutcome> {
        let mut roots: Vec<(ValueRequirement, Resolved)> = Vec::new();
        let mut failures = Vec::new();

        for requirement in requirements {
            match self.resolve_root(requirement) {
                Ok(resolved) => roots.push((requirement.clone(), resolved)),
                Err(reason) => {
                    if self.mode == BuildMode::Strict {
                        return Err(match reason {
                            ResolutionFailure::CyclicDependency { path } => {
                                EngineError::CyclicDependency { path }
                            }
                            reason => EngineError::UnsatisfiedRequirement {
                                requirement: requirement.clone(),
                                reason,
                            },
                        });
                    }
                    warn!(requirement = %requirement, reason = %reason, "Dropping unsatisfied requirement");
                    if !failures
                        .iter()
                        .any(|f: &UnsatisfiedRequirement| &f.requirement == requirement)
                    {
                        failures.push(UnsatisfiedRequirement {
                            requirement: requirement.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        let graph = self.assemble(roots);
        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            roots = graph.roots().len(),
            failures = failures.len(),
            "Dependency graph built"
        );

        Ok(BuildOutcome {
            graph: Arc::new(graph),
            failures,
        })
    }

    fn resolve_root(
        &mut self,
        requirement: &ValueRequirement,
    ) -> Result<Resolved, ResolutionFailure> {
        let mut stack: Vec<Frame> = Vec::new();
        let mut on_path: HashSet<ValueRequirement> = HashSet::new();

        let mut outcome = match self.enter(requirement, &mut stack, &mut on_path) {
            Step::Done(result) => return result,
            Step::Pushed => None,
        };

        loop {
            if let Some(result) = outcome.take() {
                let Some(frame) = stack.last_mut() else {
                    return Err(ResolutionFailure::NoCandidates);
                };
                match result {
                    Ok(resolved) => frame.resolved.push(resolved),
                    Err(cycle @ ResolutionFailure::CyclicDependency { .. }) => {
                        return Err(cycle);
                    }
                    Err(_) => {
                        let unsatisfied = frame.inputs[frame.resolved.len()].clone();
                        trace!(
                            requirement = %frame.requirement,
                            function = %frame.candidates[frame.current].function_id(),
                            unsatisfied = %unsatisfied,
                            "Candidate rejected, backtracking"
                        );
                        if !frame.advance() {
                            let failure = ResolutionFailure::CandidatesExhausted {
                                candidates: frame.candidates.len(),
                                unsatisfied,
                            };
                            let requirement = frame.requirement.clone();
                            stack.pop();
                            on_path.remove(&requirement);
                            self.memo.insert(requirement, Err(failure.clone()));
                            if stack.is_empty() {
                                return Err(failure);
                            }
                            outcome = Some(Err(failure));
                        }
                        continue;
                    }
                }
            }

            let Some(frame) = stack.last() else {
                return Err(ResolutionFailure::NoCandidates);
            };

            if frame.resolved.len() < frame.inputs.len() {
                let child = frame.inputs[frame.resolved.len()].clone();
                if let Step::Done(result) = self.enter(&child, &mut stack, &mut on_path) {
                    outcome = Some(result);
                }
                continue;
            }

            let Some(frame) = stack.pop() else {
                return Err(ResolutionFailure::NoCandidates);
            };
            on_path.remove(&frame.requirement);
            let resolved = self.intern_node(&frame);
            self.memo
                .insert(frame.requirement.clone(), Ok(resolved.clone()));
            if stack.is_empty() {
                return Ok(resolved);
            }
            outcome = Some(Ok(resolved));
        }
    }

    /// Start resolving a requirement: answer from the memo, the path set or
    /// the availability source, or push a frame for its candidates.
    fn enter(
        &mut self,
        requirement: &ValueRequirement,
        stack: &mut Vec<Frame>,
        on_path: &mut HashSet<ValueRequirement>,
    ) -> Step {
        if let Some(result) = self.memo.get(requirement) {
            return Step::Done(result.clone());
        }

        if on_path.contains(requirement) {
            let mut path: Vec<ValueRequirement> =
                stack.iter().map(|f| f.requirement.clone()).collect();
            if let Some(start) = path.iter().position(|r| r == requirement) {
                path.drain(..start);
            }
            path.push(requirement.clone());
            warn!(requirement = %requirement, depth = path.len(), "Cyclic dependency detected");
            return Step::Done(Err(ResolutionFailure::CyclicDependency { path }));
        }

        if self.availability.is_available(requirement) {
            let resolved = Resolved::External(self.availability.specification(requirement));
            trace!(requirement = %requirement, "Satisfied externally");
            self.memo.insert(requirement.clone(), Ok(resolved.clone()));
            return Step::Done(Ok(resolved));
        }

        let candidates = self.resolver.resolve(requirement);
        if candidates.is_empty() {
            self.memo
                .insert(requirement.clone(), Err(ResolutionFailure::NoCandidates));
            return Step::Done(Err(ResolutionFailure::NoCandidates));
        }

        on_path.insert(requirement.clone());
        stack.push(Frame::new(requirement.clone(), candidates));
        Step::Pushed
    }

    /// Create or reuse the node for the frame's current candidate.
    fn intern_node(&mut self, frame: &Frame) -> Resolved {
        let candidate = &frame.candidates[frame.current];
        let target = frame.requirement.target.clone();
        let key = NodeKey {
            function: candidate.function_id().clone(),
            target: target.clone(),
            inputs: frame
                .resolved
                .iter()
                .map(|r| r.specification().clone())
                .collect(),
        };

        let node = match self.node_keys.get(&key) {
            Some(&existing) => existing,
            None => {
                let idx = self.nodes.len();
                trace!(
                    function = %key.function,
                    target = %target,
                    inputs = frame.resolved.len(),
                    "Created dependency node"
                );
                self.nodes.push(PendingNode {
                    function: Arc::clone(&candidate.function),
                    outputs: candidate.function.results(&target),
                    target,
                    inputs: frame.resolved.clone(),
                });
                self.node_keys.insert(key, idx);
                idx
            }
        };

        Resolved::Node {
            node,
            specification: candidate.specification.clone(),
        }
    }

    /// Copy the nodes reachable from the roots into a graph.
    ///
    /// Nodes created for candidates that were later abandoned are left out.
    fn assemble(self, roots: Vec<(ValueRequirement, Resolved)>) -> DependencyGraph {
        let mut graph = DependencyGraph::new(self.resolver.instant());

        let mut reachable = vec![false; self.nodes.len()];
        let mut work: Vec<usize> = roots
            .iter()
            .filter_map(|(_, r)| match r {
                Resolved::Node { node, .. } => Some(*node),
                Resolved::External(_) => None,
            })
            .collect();
        while let Some(idx) = work.pop() {
            if std::mem::replace(&mut reachable[idx], true) {
                continue;
            }
            for input in &self.nodes[idx].inputs {
                if let Resolved::Node { node, .. } = input {
                    work.push(*node);
                }
            }
        }

        // Inputs are always created before their consumers, so arena order
        // is already a topological order.
        let mut mapping: HashMap<usize, NodeIndex> = HashMap::new();
        for (idx, pending) in self.nodes.into_iter().enumerate() {
            if !reachable[idx] {
                continue;
            }
            let inputs: Vec<ValueSpecification> = pending
                .inputs
                .iter()
                .map(|r| r.specification().clone())
                .collect();
            let new_idx = graph.add_node(DependencyNode {
                function: pending.function,
                target: pending.target,
                inputs,
                outputs: pending.outputs,
            });
            for input in pending.inputs {
                match input {
                    Resolved::Node { node, .. } => {
                        if let Some(&producer) = mapping.get(&node) {
                            graph.add_edge(producer, new_idx);
                        }
                    }
                    Resolved::External(spec) => graph.mark_external(spec),
                }
            }
            mapping.insert(idx, new_idx);
        }

        for (requirement, resolved) in roots {
            let binding = match resolved {
                Resolved::External(specification) => {
                    graph.mark_external(specification.clone());
                    RootBinding {
                        requirement,
                        specification,
                        node: None,
                    }
                }
                Resolved::Node {
                    node,
                    specification,
                } => RootBinding {
                    requirement,
                    specification,
                    node: mapping.get(&node).copied(),
                },
            };
            graph.add_root(binding);
        }

        graph
    }
}
