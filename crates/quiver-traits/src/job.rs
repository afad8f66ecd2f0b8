//! Job dispatch protocol.
//!
//! These are the two messages exchanged between the engine and a worker:
//! a [`CalculationJob`] going out and a [`CalculationJobResult`] coming back.
//! The protocol is encoding-agnostic; every type derives serde so any codec
//! can carry it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::TraitError;
use crate::ids::{FunctionId, InvokerId, JobId};
use crate::target::ComputationTarget;
use crate::value::{Value, ValueSpecification};

// =============================================================================
// JOB
// =============================================================================

/// Fully qualified job identity: the cycle it belongs to plus its job id.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobSpec {
    /// Name of the calculation (view / cycle name).
    pub cycle_name: String,
    /// Cycle valuation timestamp (Unix epoch millis).
    pub cycle_timestamp: i64,
    /// Job ID, unique within the dispatcher.
    pub job_id: JobId,
}

/// One node invocation inside a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobItem {
    /// Function to invoke.
    pub function_id: FunctionId,
    /// Target to invoke it on.
    pub target: ComputationTarget,
    /// Inputs the invoker reads from the computation cache.
    pub input_specs: Vec<ValueSpecification>,
    /// Outputs the invoker must report on.
    pub output_specs: Vec<ValueSpecification>,
}

/// A batch of independent node invocations dispatched as one unit.
///
/// On the wire the identity fields sit beside `items` and `depends_on`:
/// `{cycle_name, cycle_timestamp, job_id, items, depends_on}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJob {
    /// Job identity.
    #[serde(flatten)]
    pub spec: CalculationJobSpec,
    /// Node invocations, in execution order.
    pub items: Vec<CalculationJobItem>,
    /// Jobs whose outputs this job consumes.
    pub depends_on: Vec<JobId>,
}

impl CalculationJob {
    /// The job ID.
    pub fn job_id(&self) -> JobId {
        self.spec.job_id
    }

    /// Number of node invocations.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the job has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encodes the job as JSON.
    pub fn to_json(&self) -> Result<String, TraitError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a job from JSON.
    pub fn from_json(json: &str) -> Result<Self, TraitError> {
        Ok(serde_json::from_str(json)?)
    }
}

// =============================================================================
// RESULT
// =============================================================================

/// Outcome of one output of one node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    /// Value computed.
    Success,
    /// The function raised an error.
    Failure,
    /// An input was absent from the cache at execution time.
    MissingInput,
}

/// Result for one output specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobResultItem {
    /// Output this item reports on.
    pub output_spec: ValueSpecification,
    /// Outcome.
    pub status: ItemStatus,
    /// Computed value (success only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Error detail (failure or missing input).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CalculationJobResultItem {
    /// A successful output.
    pub fn success(output_spec: ValueSpecification, value: Value) -> Self {
        Self {
            output_spec,
            status: ItemStatus::Success,
            value: Some(value),
            error: None,
        }
    }

    /// A failed output.
    pub fn failure(output_spec: ValueSpecification, error: impl Into<String>) -> Self {
        Self {
            output_spec,
            status: ItemStatus::Failure,
            value: None,
            error: Some(error.into()),
        }
    }

    /// An output not computed because an input was missing.
    pub fn missing_input(output_spec: ValueSpecification, missing: &ValueSpecification) -> Self {
        Self {
            output_spec,
            status: ItemStatus::MissingInput,
            value: None,
            error: Some(missing.to_string()),
        }
    }
}

/// Result message for a whole job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobResult {
    /// Job the result belongs to.
    pub job_id: JobId,
    /// Per-output outcomes.
    pub items: Vec<CalculationJobResultItem>,
    /// Time spent executing the job on the worker.
    pub duration_nanos: u64,
}

impl CalculationJobResult {
    /// Encodes the result as JSON.
    pub fn to_json(&self) -> Result<String, TraitError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a result from JSON.
    pub fn from_json(json: &str) -> Result<Self, TraitError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Number of successful items.
    pub fn success_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Success)
            .count()
    }
}

// =============================================================================
// FAILURES
// =============================================================================

/// Why a job did not produce a result.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum JobFailure {
    /// The invoker reported a failure.
    #[error("invoker {invoker} failed: {message}")]
    InvokerFailed {
        /// Invoker that failed.
        invoker: InvokerId,
        /// Failure detail.
        message: String,
    },

    /// No response within the deadline; the invoker is suspected dead.
    #[error("invoker {invoker} suspected dead: no response within {timeout_ms}ms")]
    InvokerSuspectedDead {
        /// Invoker that timed out.
        invoker: InvokerId,
        /// Deadline that expired.
        timeout_ms: u64,
    },

    /// The job was aborted after the maximum number of attempts.
    #[error("retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        last: Box<JobFailure>,
    },

    /// No invoker capacity and the dispatch queue is full.
    #[error("dispatch queue overflow (capacity {capacity})")]
    DispatchQueueOverflow {
        /// Queue capacity.
        capacity: usize,
    },

    /// The dispatcher stopped before the job finished.
    #[error("dispatcher shut down")]
    DispatcherShutdown,
}

impl JobFailure {
    /// The invoker the failure is attributed to, if any.
    pub fn invoker(&self) -> Option<&InvokerId> {
        match self {
            JobFailure::InvokerFailed { invoker, .. }
            | JobFailure::InvokerSuspectedDead { invoker, .. } => Some(invoker),
            JobFailure::RetryExhausted { last, .. } => last.invoker(),
            JobFailure::DispatchQueueOverflow { .. } | JobFailure::DispatcherShutdown => None,
        }
    }
}
