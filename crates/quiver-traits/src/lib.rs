//! # Quiver Traits
//!
//! Shared types and trait definitions for the Quiver calculation engine.
//!
//! This crate contains the value model, the collaborator traits and the job
//! protocol. It has no runtime dependencies; the engine lives in
//! `quiver-engine`.
//!
//! ## Module Structure
//!
//! - [`ids`]: Identifier newtypes (functions, targets, invokers, jobs, cycles)
//! - [`target`]: Computation targets and the closed target type hierarchy
//! - [`value`]: Requirements, specifications, properties and computed values
//! - [`function`]: Function definitions consumed by the resolver
//! - [`availability`]: External data availability sources
//! - [`job`]: Calculation job and result messages
//! - [`invoker`]: Job invokers and the invocation receiver callback surface
//! - [`config`]: Engine configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod availability;
pub mod config;
pub mod error;
pub mod function;
pub mod ids;
pub mod invoker;
pub mod job;
pub mod target;
pub mod value;

// Re-export commonly used types
pub use availability::{DataAvailabilityProvider, FixedAvailabilityProvider, NoAvailability};
pub use config::{
    BuildConfig, BuildMode, CacheConfig, CacheMode, DeltaConfig, DispatchConfig, EngineConfig,
    ExecutorConfig, FailurePolicy, SelectionPolicy,
};
pub use error::TraitError;
pub use function::{ComputeFunction, FunctionDefinition, FunctionError, FunctionInputs, Validity};
pub use ids::*;
pub use invoker::{JobInvocationReceiver, JobInvoker};
pub use job::{
    CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
    CalculationJobSpec, ItemStatus, JobFailure,
};
pub use target::{ComputationTarget, TargetType};
pub use value::{
    ComputedValue, ConstraintPattern, Value, ValueConstraints, ValueProperties,
    ValueRequirement, ValueSpecification,
};
