//! Engine error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

use quiver_traits::{TraitError, ValueRequirement};

use crate::depgraph::ResolutionFailure;

/// Engine error type.
///
/// Per-value outcomes (a failed node, an aborted job) are reported as status
/// values on the execution result. These variants cover the calls that fail
/// as a whole.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No registered function is valid at the resolution instant.
    #[error("no functions available at {instant}")]
    NoFunctionsAvailable {
        /// Resolution instant.
        instant: DateTime<Utc>,
    },

    /// A requested value could not be resolved (strict build).
    #[error("unsatisfied requirement {requirement}: {reason}")]
    UnsatisfiedRequirement {
        /// The requested value.
        requirement: ValueRequirement,
        /// Why resolution failed.
        reason: ResolutionFailure,
    },

    /// A requirement re-entered its own resolution path (strict build).
    #[error("cyclic dependency: {}", format_path(.path))]
    CyclicDependency {
        /// Resolution path, closing on the repeated requirement.
        path: Vec<ValueRequirement>,
    },

    /// Graph integrity violation.
    #[error("malformed graph: {0}")]
    MalformedGraph(String),

    /// Function not found in the repository.
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// The dispatcher is no longer accepting jobs.
    #[error("dispatcher shut down")]
    DispatcherShutdown,

    /// The execution was dropped before it completed.
    #[error("execution cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<TraitError> for EngineError {
    fn from(e: TraitError) -> Self {
        EngineError::Internal(e.to_string())
    }
}

pub(crate) fn format_path(path: &[ValueRequirement]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
