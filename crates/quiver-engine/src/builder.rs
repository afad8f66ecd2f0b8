//! Builder pattern for the computation engine.

use std::sync::Arc;

use quiver_traits::{
    DataAvailabilityProvider, EngineConfig, FunctionDefinition, JobInvoker, NoAvailability,
};

use crate::cache::ComputationCache;
use crate::delta::DeltaDefinition;
use crate::dispatcher::JobDispatcher;
use crate::engine::ComputationEngine;
use crate::error::EngineError;
use crate::local::LocalInvokerSet;
use crate::resolver::{FunctionRepository, RankingStrategy, SpecificityRanking};
use crate::stats::{DiscardingStatistics, StatisticsGatherer};

#[derive(Debug, Clone, Copy)]
enum LocalPool {
    None,
    Count(usize),
    PerCore(usize),
}

/// Builder for constructing a [`ComputationEngine`].
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    functions: Vec<Arc<dyn FunctionDefinition>>,
    availability: Option<Arc<dyn DataAvailabilityProvider>>,
    invokers: Vec<Arc<dyn JobInvoker>>,
    local: LocalPool,
    statistics: Option<Arc<dyn StatisticsGatherer>>,
    ranking: Option<Arc<dyn RankingStrategy>>,
    cache: Option<Arc<ComputationCache>>,
    delta: Option<DeltaDefinition>,
}

impl EngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: None,
            functions: Vec::new(),
            availability: None,
            invokers: Vec::new(),
            local: LocalPool::None,
            statistics: None,
            ranking: None,
            cache: None,
            delta: None,
        }
    }

    /// Set the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register a function.
    pub fn with_function(mut self, function: impl FunctionDefinition + 'static) -> Self {
        self.functions.push(Arc::new(function));
        self
    }

    /// Register a shared function.
    pub fn with_function_arc(mut self, function: Arc<dyn FunctionDefinition>) -> Self {
        self.functions.push(function);
        self
    }

    /// Set the availability provider. Defaults to [`NoAvailability`].
    pub fn with_availability(mut self, provider: impl DataAvailabilityProvider + 'static) -> Self {
        self.availability = Some(Arc::new(provider));
        self
    }

    /// Set a shared availability provider.
    pub fn with_availability_arc(mut self, provider: Arc<dyn DataAvailabilityProvider>) -> Self {
        self.availability = Some(provider);
        self
    }

    /// Add an invoker to the pool.
    pub fn with_invoker(mut self, invoker: Arc<dyn JobInvoker>) -> Self {
        self.invokers.push(invoker);
        self
    }

    /// Add `count` in-process invokers.
    pub fn with_local_invokers(mut self, count: usize) -> Self {
        self.local = LocalPool::Count(count);
        self
    }

    /// Add `nodes_per_core` in-process invokers for every available core.
    pub fn with_local_invokers_per_core(mut self, nodes_per_core: usize) -> Self {
        self.local = LocalPool::PerCore(nodes_per_core);
        self
    }

    /// Set the statistics gatherer. Defaults to [`DiscardingStatistics`].
    pub fn with_statistics(mut self, statistics: Arc<dyn StatisticsGatherer>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    /// Set the candidate ranking. Defaults to [`SpecificityRanking`].
    pub fn with_ranking(mut self, ranking: Arc<dyn RankingStrategy>) -> Self {
        self.ranking = Some(ranking);
        self
    }

    /// Use an existing cache, e.g. one shared with remote invokers.
    pub fn with_cache(mut self, cache: Arc<ComputationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the change rule for cycle deltas. Defaults to the configured
    /// `delta.tolerance`.
    pub fn with_delta(mut self, delta: DeltaDefinition) -> Self {
        self.delta = Some(delta);
        self
    }

    /// Build the engine. Spawns the dispatcher, so it must be called within a
    /// tokio runtime.
    pub fn build(self) -> Result<ComputationEngine, EngineError> {
        let config = self.config.unwrap_or_default();

        if config.executor.max_job_size == 0 {
            return Err(EngineError::ConfigError(
                "executor.max_job_size must be at least 1".into(),
            ));
        }
        if config.dispatch.max_attempts == 0 {
            return Err(EngineError::ConfigError(
                "dispatch.max_attempts must be at least 1".into(),
            ));
        }
        if !config.delta.tolerance.is_finite() || config.delta.tolerance < 0.0 {
            return Err(EngineError::ConfigError(
                "delta.tolerance must be a non-negative number".into(),
            ));
        }
        if self.invokers.is_empty() && matches!(self.local, LocalPool::None) {
            return Err(EngineError::ConfigError("no job invokers configured".into()));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(EngineError::ConfigError(
                "engine must be built within a tokio runtime".into(),
            ));
        }

        let mut repository = FunctionRepository::new();
        for function in self.functions {
            repository.register(function)?;
        }
        let repository = Arc::new(repository);
        let cache = self.cache.unwrap_or_default();

        let dispatcher = JobDispatcher::spawn(config.dispatch.clone());
        for invoker in self.invokers {
            dispatcher.register_invoker(invoker)?;
        }
        let local = match self.local {
            LocalPool::None => None,
            LocalPool::Count(count) => Some(LocalInvokerSet::with_node_count(
                count,
                Arc::clone(&repository),
                Arc::clone(&cache),
            )),
            LocalPool::PerCore(per_core) => Some(LocalInvokerSet::per_core(
                per_core,
                Arc::clone(&repository),
                Arc::clone(&cache),
            )),
        };
        if let Some(local) = local {
            local.register_with(&dispatcher)?;
        }

        let delta = self
            .delta
            .unwrap_or_else(|| DeltaDefinition::with_tolerance(config.delta.tolerance));

        Ok(ComputationEngine::from_parts(
            config,
            repository,
            self.ranking.unwrap_or_else(|| Arc::new(SpecificityRanking)),
            self.availability.unwrap_or_else(|| Arc::new(NoAvailability)),
            cache,
            dispatcher,
            self.statistics
                .unwrap_or_else(|| Arc::new(DiscardingStatistics)),
            delta,
        ))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
