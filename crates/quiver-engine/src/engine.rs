//! Engine facade tying resolution, graph building and execution together.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use quiver_traits::{
    BuildMode, CacheMode, ComputedValue, CycleId, DataAvailabilityProvider, EngineConfig,
    ValueRequirement, ValueSpecification,
};

use crate::cache::ComputationCache;
use crate::delta::{CycleDelta, DeltaDefinition, PreviousResults};
use crate::depgraph::{BuildOutcome, DependencyGraph, DependencyGraphBuilder, UnsatisfiedRequirement};
use crate::dispatcher::JobDispatcher;
use crate::error::EngineResult;
use crate::executor::{DependencyGraphExecutor, ExecutionHandle, ExecutionResult};
use crate::resolver::{FunctionRepository, FunctionResolver, RankingStrategy};
use crate::stats::StatisticsGatherer;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct GraphKey {
    requirements: Vec<ValueRequirement>,
    instant: DateTime<Utc>,
    mode: BuildMode,
}

/// Outcome of [`ComputationEngine::run_cycle`].
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Cycle identifier.
    pub cycle: CycleId,
    /// Requirements pruned by a best-effort build.
    pub unsatisfied: Vec<UnsatisfiedRequirement>,
    /// Execution result for the requirements that resolved.
    pub execution: ExecutionResult,
    /// Movement of every requested value since the previous cycle.
    pub delta: CycleDelta,
}

impl CycleReport {
    /// Returns true if every requirement resolved and produced a value.
    pub fn is_complete(&self) -> bool {
        self.unsatisfied.is_empty() && self.execution.all_succeeded()
    }
}

/// The calculation engine.
///
/// Built with [`EngineBuilder`](crate::EngineBuilder). Owns the function
/// repository, the shared cache and the dispatcher; compiled graphs are
/// memoized per requirement set, resolution instant and build mode.
pub struct ComputationEngine {
    config: EngineConfig,
    repository: Arc<FunctionRepository>,
    resolver: FunctionResolver,
    availability: Arc<dyn DataAvailabilityProvider>,
    cache: Arc<ComputationCache>,
    dispatcher: JobDispatcher,
    executor: DependencyGraphExecutor,
    graphs: Mutex<HashMap<GraphKey, Arc<BuildOutcome>>>,
    cycle: AtomicU64,
    delta: DeltaDefinition,
    previous: Mutex<PreviousResults>,
}

impl ComputationEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        config: EngineConfig,
        repository: Arc<FunctionRepository>,
        ranking: Arc<dyn RankingStrategy>,
        availability: Arc<dyn DataAvailabilityProvider>,
        cache: Arc<ComputationCache>,
        dispatcher: JobDispatcher,
        statistics: Arc<dyn StatisticsGatherer>,
        delta: DeltaDefinition,
    ) -> Self {
        let resolver = FunctionResolver::new(Arc::clone(&repository)).with_ranking(ranking);
        let executor =
            DependencyGraphExecutor::new(dispatcher.clone(), Arc::clone(&cache), config.executor.clone())
                .with_statistics(statistics)
                .with_cycle_name(config.name.clone());

        info!(
            name = %config.name,
            functions = repository.len(),
            invokers = dispatcher.invoker_count(),
            "Computation engine created"
        );

        Self {
            config,
            repository,
            resolver,
            availability,
            cache,
            dispatcher,
            executor,
            graphs: Mutex::new(HashMap::new()),
            cycle: AtomicU64::new(0),
            delta,
            previous: Mutex::new(PreviousResults::default()),
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registered functions.
    pub fn repository(&self) -> &Arc<FunctionRepository> {
        &self.repository
    }

    /// Shared computation cache.
    pub fn cache(&self) -> &Arc<ComputationCache> {
        &self.cache
    }

    /// Job dispatcher.
    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    /// Change rule for cycle deltas.
    pub fn delta_definition(&self) -> &DeltaDefinition {
        &self.delta
    }

    /// Graph executor.
    pub fn executor(&self) -> &DependencyGraphExecutor {
        &self.executor
    }

    /// Number of memoized build outcomes.
    pub fn cached_graphs(&self) -> usize {
        self.graphs.lock().len()
    }

    // =========================================================================
    // GRAPH BUILDING
    // =========================================================================

    /// Build a graph using the configured build mode.
    pub fn build_graph(
        &self,
        requirements: &[ValueRequirement],
        instant: DateTime<Utc>,
    ) -> EngineResult<Arc<BuildOutcome>> {
        self.build_graph_with_mode(requirements, instant, self.config.build.mode)
    }

    /// Build a graph, reusing a memoized outcome for the same requirements,
    /// instant and mode.
    pub fn build_graph_with_mode(
        &self,
        requirements: &[ValueRequirement],
        instant: DateTime<Utc>,
        mode: BuildMode,
    ) -> EngineResult<Arc<BuildOutcome>> {
        let key = GraphKey {
            requirements: requirements.to_vec(),
            instant,
            mode,
        };
        if let Some(outcome) = self.graphs.lock().get(&key) {
            debug!(roots = requirements.len(), "Reusing compiled graph");
            return Ok(Arc::clone(outcome));
        }

        let resolver = self.resolver.bind(instant)?;
        let outcome = Arc::new(
            DependencyGraphBuilder::new(resolver, Arc::clone(&self.availability))
                .with_mode(mode)
                .build(requirements)?,
        );

        let stats = outcome.graph.stats();
        info!(
            nodes = stats.nodes,
            edges = stats.edges,
            external_inputs = stats.external_inputs,
            roots = stats.roots,
            unsatisfied = outcome.failures.len(),
            "Dependency graph compiled"
        );

        self.graphs.lock().insert(key, Arc::clone(&outcome));
        Ok(outcome)
    }

    /// Drop every memoized graph, e.g. after the function repository or
    /// availability changed.
    pub fn invalidate_graphs(&self) {
        let mut graphs = self.graphs.lock();
        debug!(count = graphs.len(), "Invalidating compiled graphs");
        graphs.clear();
    }

    // =========================================================================
    // EXECUTION
    // =========================================================================

    /// Start a new cycle: apply the cache mode and forget finished job states.
    pub fn begin_cycle(&self) -> CycleId {
        self.cache.begin_cycle(self.config.cache.mode);
        self.dispatcher.clear_finished();
        let cycle = CycleId(self.cycle.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(cycle = %cycle, mode = ?self.config.cache.mode, "Cycle started");
        cycle
    }

    /// Write inputs to the cache and return the specifications whose value
    /// moved.
    pub fn put_inputs(
        &self,
        inputs: impl IntoIterator<Item = ComputedValue>,
    ) -> HashSet<ValueSpecification> {
        self.cache.put_changed(inputs)
    }

    /// Evict the cached outputs of every node downstream of `changed`, so the
    /// next execution recomputes them. Returns the number of nodes evicted.
    pub fn invalidate_downstream(
        &self,
        graph: &DependencyGraph,
        changed: &HashSet<ValueSpecification>,
    ) -> usize {
        if changed.is_empty() {
            return 0;
        }
        let stale = graph.downstream_of(changed);
        let mut evicted = 0;
        for idx in &stale {
            let Some(node) = graph.node(*idx) else { continue };
            let mut removed = false;
            for output in &node.outputs {
                removed |= self.cache.remove(output).is_some();
            }
            if removed {
                evicted += 1;
            }
        }
        debug!(
            changed_inputs = changed.len(),
            downstream = stale.len(),
            evicted,
            "Invalidated outputs downstream of changed inputs"
        );
        evicted
    }

    /// Start executing a graph against the current cache contents.
    pub fn execute(&self, graph: Arc<DependencyGraph>, cycle: CycleId) -> EngineResult<ExecutionHandle> {
        let snapshot = self.cache.snapshot();
        self.executor.execute(graph, &snapshot, cycle)
    }

    /// Run a full cycle: begin it, seed the cache with `inputs`, build (or
    /// reuse) the graph, execute it and wait for the result.
    ///
    /// In incremental mode, retained outputs downstream of an input whose
    /// value moved are recomputed.
    pub async fn run_cycle(
        &self,
        requirements: &[ValueRequirement],
        instant: DateTime<Utc>,
        inputs: impl IntoIterator<Item = ComputedValue>,
    ) -> EngineResult<CycleReport> {
        let cycle = self.begin_cycle();
        let changed = self.put_inputs(inputs);

        let outcome = self.build_graph(requirements, instant)?;
        if self.config.cache.mode == CacheMode::Incremental {
            self.invalidate_downstream(&outcome.graph, &changed);
        }
        for failure in &outcome.failures {
            warn!(
                cycle = %cycle,
                requirement = %failure.requirement,
                reason = %failure.reason,
                "Requirement unsatisfied"
            );
        }

        let execution = self.execute(Arc::clone(&outcome.graph), cycle)?.wait().await?;
        let delta = self.previous.lock().advance(&self.delta, &execution);
        debug!(
            cycle = %cycle,
            changed = delta.changed().count(),
            "Cycle delta computed"
        );
        Ok(CycleReport {
            cycle,
            unsatisfied: outcome.failures.clone(),
            execution,
            delta,
        })
    }

    /// Stop the dispatcher. Subsequent executions fail their jobs.
    pub async fn shutdown(&self) -> EngineResult<()> {
        info!(name = %self.config.name, "Computation engine shutting down");
        self.dispatcher.shutdown().await
    }
}

impl fmt::Debug for ComputationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationEngine")
            .field("name", &self.config.name)
            .field("functions", &self.repository.len())
            .field("cache_entries", &self.cache.len())
            .field("invokers", &self.dispatcher.invoker_count())
            .finish()
    }
}
