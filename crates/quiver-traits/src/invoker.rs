//! Job invokers and the invocation receiver.
//!
//! A [`JobInvoker`] is a handle to execution capacity, local or remote.
//! Invokers report back through a [`JobInvocationReceiver`]; both methods may
//! be called from any thread, concurrently, and must not block.

use std::sync::Arc;

use crate::ids::{InvokerId, JobId};
use crate::job::{CalculationJob, CalculationJobResult, JobFailure};

/// Callback surface for job completion and failure.
pub trait JobInvocationReceiver: Send + Sync {
    /// The job finished and produced a result (which may contain item failures).
    fn job_completed(&self, result: CalculationJobResult);

    /// The job could not be executed.
    fn job_failed(&self, invoker: &InvokerId, job_id: JobId, failure: JobFailure);
}

/// Handle to execution capacity.
pub trait JobInvoker: Send + Sync {
    /// Identity used for failure attribution.
    fn id(&self) -> &InvokerId;

    /// Maximum number of jobs the invoker accepts concurrently.
    fn capacity(&self) -> usize;

    /// Availability signal. An unavailable invoker is skipped by selection.
    fn is_available(&self) -> bool {
        true
    }

    /// Offers a job to the invoker.
    ///
    /// Returns `false` if there is no capacity right now; the caller keeps
    /// the job and tries again later. Once `true` is returned the invoker must
    /// eventually call exactly one of the receiver's methods for this job.
    fn try_invoke(&self, job: CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) -> bool;
}
