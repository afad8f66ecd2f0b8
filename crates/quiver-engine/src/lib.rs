//! # Quiver Engine
//!
//! Dependency-graph calculation engine.
//!
//! This crate provides:
//! - [`FunctionResolver`]: Ranks the functions able to produce a value
//! - [`DependencyGraphBuilder`]: Compiles requirements into a DAG of function applications
//! - [`DependencyGraphExecutor`]: Runs a graph in dependency-ordered batches
//! - [`JobDispatcher`]: Routes jobs to invokers with retry and timeout handling
//! - [`ComputationCache`]: Shared value store written by completion callbacks
//! - [`DeltaDefinition`]: Change detection of requested values between cycles
//! - [`ComputationEngine`]: Facade owning all of the above
//!
//! ## Architecture
//!
//! ```text
//! Requirements ─> FunctionResolver ─> DependencyGraphBuilder ─> DependencyGraph
//!                                                                    │
//!                                                                    v
//!              ComputationCache <─ CycleReceiver <─ JobDispatcher <─ DependencyGraphExecutor
//!                     │                                  │
//!                     └──────────> LocalJobInvoker <─────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let engine = EngineBuilder::new()
//!     .with_config(config)
//!     .with_function(present_value)
//!     .with_availability(market_data)
//!     .with_local_invokers(4)
//!     .build()?;
//!
//! let report = engine.run_cycle(&requirements, Utc::now(), inputs).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod cache;
pub mod delta;
pub mod depgraph;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod local;
pub mod resolver;
pub mod stats;

// Re-exports
pub use builder::EngineBuilder;
pub use cache::{CacheSnapshot, CacheStats, ComputationCache};
pub use delta::{
    CycleDelta, DeltaComparer, DeltaDefinition, DeltaKind, ExactComparer, RootDelta,
    ToleranceComparer,
};
pub use depgraph::{
    BuildOutcome, DependencyGraph, DependencyGraphBuilder, DependencyNode, FunctionFilter,
    GraphStats, NodeFilter, NodeIndex, ResolutionFailure, RootBinding, TargetTypeFilter,
    UnsatisfiedRequirement,
};
pub use dispatcher::{DispatchStats, JobDispatcher, JobState, DISPATCHER_ID};
pub use engine::{ComputationEngine, CycleReport};
pub use error::{EngineError, EngineResult};
pub use executor::{
    DependencyGraphExecutor, ExecutionHandle, ExecutionResult, FailureCause, FailureChain,
    FailureLink, RootOutcome, RootResult,
};
pub use local::{execute_job, LocalInvokerSet, LocalJobInvoker};
pub use resolver::{
    Candidate, CompiledFunctionResolver, FunctionRepository, FunctionResolver, PriorityRanking,
    RankingStrategy, SpecificityRanking,
};
pub use stats::{DiscardingStatistics, StatisticsGatherer, StatisticsTotals, TotallingStatistics};

pub use quiver_traits as traits;
