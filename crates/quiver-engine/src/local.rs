//! In-process job invokers.
//!
//! A [`LocalJobInvoker`] executes jobs on the tokio blocking pool against the
//! function repository, reading inputs from the shared cache. It reports
//! outputs through the receiver and never writes the cache itself.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use quiver_traits::{
    CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
    FunctionInputs, InvokerId, JobFailure, JobInvocationReceiver, JobInvoker,
};

use crate::cache::ComputationCache;
use crate::dispatcher::JobDispatcher;
use crate::error::{EngineError, EngineResult};
use crate::resolver::FunctionRepository;

/// Executes jobs in-process with bounded concurrency.
pub struct LocalJobInvoker {
    id: InvokerId,
    capacity: usize,
    repository: Arc<FunctionRepository>,
    cache: Arc<ComputationCache>,
    in_flight: Arc<AtomicUsize>,
}

impl LocalJobInvoker {
    /// Create an invoker with a random ID and capacity 1.
    pub fn new(repository: Arc<FunctionRepository>, cache: Arc<ComputationCache>) -> Self {
        Self {
            id: InvokerId::new(format!("local-{}", Uuid::new_v4())),
            capacity: 1,
            repository,
            cache,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the invoker ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = InvokerId::new(id);
        self
    }

    /// Set the number of concurrent jobs.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn reserve(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }
}

impl JobInvoker for LocalJobInvoker {
    fn id(&self) -> &InvokerId {
        &self.id
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn try_invoke(&self, job: CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(invoker = %self.id, "No tokio runtime, refusing job");
            return false;
        };
        if !self.reserve() {
            return false;
        }

        let id = self.id.clone();
        let repository = Arc::clone(&self.repository);
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.in_flight);
        let job_id = job.job_id();

        runtime.spawn(async move {
            let outcome =
                tokio::task::spawn_blocking(move || execute_job(&job, &repository, &cache)).await;
            in_flight.fetch_sub(1, Ordering::AcqRel);
            match outcome {
                Ok(result) => receiver.job_completed(result),
                Err(e) => {
                    warn!(invoker = %id, job_id = %job_id, error = %e, "Local job panicked");
                    receiver.job_failed(
                        &id,
                        job_id,
                        JobFailure::InvokerFailed {
                            invoker: id.clone(),
                            message: e.to_string(),
                        },
                    );
                }
            }
        });
        true
    }
}

/// Run every item of a job, in order.
pub fn execute_job(
    job: &CalculationJob,
    repository: &FunctionRepository,
    cache: &ComputationCache,
) -> CalculationJobResult {
    let start = Instant::now();
    let mut items = Vec::with_capacity(job.items.iter().map(|i| i.output_specs.len()).sum());
    for item in &job.items {
        execute_item(item, repository, cache, &mut items);
    }
    let duration_nanos = start.elapsed().as_nanos() as u64;

    debug!(
        job_id = %job.job_id(),
        items = job.items.len(),
        duration_nanos,
        "Local job executed"
    );

    CalculationJobResult {
        job_id: job.job_id(),
        items,
        duration_nanos,
    }
}

fn execute_item(
    item: &CalculationJobItem,
    repository: &FunctionRepository,
    cache: &ComputationCache,
    out: &mut Vec<CalculationJobResultItem>,
) {
    let Some(function) = repository.get(&item.function_id) else {
        let message = EngineError::FunctionNotFound(item.function_id.to_string()).to_string();
        out.extend(
            item.output_specs
                .iter()
                .map(|spec| CalculationJobResultItem::failure(spec.clone(), message.clone())),
        );
        return;
    };

    let mut inputs = FunctionInputs::new();
    for spec in &item.input_specs {
        match cache.get(spec) {
            Some(value) => inputs.insert(spec.clone(), value),
            None => {
                trace!(function = %item.function_id, missing = %spec, "Input missing from cache");
                out.extend(
                    item.output_specs
                        .iter()
                        .map(|output| CalculationJobResultItem::missing_input(output.clone(), spec)),
                );
                return;
            }
        }
    }

    match function.invoke(&item.target, &inputs, &item.output_specs) {
        Ok(computed) => {
            for spec in &item.output_specs {
                let item_result = computed
                    .iter()
                    .find(|c| &c.specification == spec)
                    .map(|c| CalculationJobResultItem::success(spec.clone(), c.value.clone()))
                    .unwrap_or_else(|| {
                        CalculationJobResultItem::failure(spec.clone(), "output not produced")
                    });
                out.push(item_result);
            }
        }
        Err(e) => {
            trace!(function = %item.function_id, target = %item.target, error = %e, "Function failed");
            let message = e.to_string();
            out.extend(
                item.output_specs
                    .iter()
                    .map(|spec| CalculationJobResultItem::failure(spec.clone(), message.clone())),
            );
        }
    }
}

// =============================================================================
// INVOKER SET
// =============================================================================

/// A pool of local invokers sized from a node count or the core count.
pub struct LocalInvokerSet {
    invokers: Vec<Arc<LocalJobInvoker>>,
}

impl LocalInvokerSet {
    /// Create `node_count` invokers.
    pub fn with_node_count(
        node_count: usize,
        repository: Arc<FunctionRepository>,
        cache: Arc<ComputationCache>,
    ) -> Self {
        let invokers = (0..node_count.max(1))
            .map(|i| {
                Arc::new(
                    LocalJobInvoker::new(Arc::clone(&repository), Arc::clone(&cache))
                        .with_id(format!("local-{}", i)),
                )
            })
            .collect();
        Self { invokers }
    }

    /// Create `nodes_per_core` invokers for every available core.
    pub fn per_core(
        nodes_per_core: usize,
        repository: Arc<FunctionRepository>,
        cache: Arc<ComputationCache>,
    ) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_node_count(cores * nodes_per_core.max(1), repository, cache)
    }

    /// The invokers.
    pub fn invokers(&self) -> &[Arc<LocalJobInvoker>] {
        &self.invokers
    }

    /// Number of invokers.
    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }

    /// Register every invoker with a dispatcher.
    pub fn register_with(&self, dispatcher: &JobDispatcher) -> EngineResult<()> {
        for invoker in &self.invokers {
            dispatcher.register_invoker(Arc::clone(invoker) as Arc<dyn JobInvoker>)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_traits::{
        CalculationJobSpec, ComputationTarget, ComputeFunction, FunctionDefinition,
        FunctionError, ItemStatus, JobId, TargetType, Value, ValueRequirement, ValueSpecification,
    };
    use tokio::sync::mpsc;

    fn bond() -> ComputationTarget {
        ComputationTarget::security(TargetType::Bond, "B1")
    }

    fn repository() -> Arc<FunctionRepository> {
        let mut repo = FunctionRepository::new();
        repo.register(Arc::new(
            ComputeFunction::new("DOUBLE", TargetType::Bond, "Doubled", |_, inputs| {
                Ok(Value::Double(inputs.scalar("Price")? * 2.0))
            })
            .requires("Price"),
        ))
        .unwrap();
        repo.register(Arc::new(ComputeFunction::new(
            "BROKEN",
            TargetType::Bond,
            "Broken",
            |_, _| Err(FunctionError::InvocationFailed("no curve".into())),
        )))
        .unwrap();
        Arc::new(repo)
    }

    fn price_spec() -> ValueSpecification {
        ValueSpecification::external(&ValueRequirement::new("Price", bond()))
    }

    fn item(repo: &FunctionRepository, id: &str, inputs: Vec<ValueSpecification>) -> CalculationJobItem {
        let function = repo.get(&id.into()).unwrap();
        CalculationJobItem {
            function_id: function.id().clone(),
            target: bond(),
            input_specs: inputs,
            output_specs: function.results(&bond()),
        }
    }

    fn job(items: Vec<CalculationJobItem>) -> CalculationJob {
        CalculationJob {
            spec: CalculationJobSpec {
                cycle_name: "test".into(),
                cycle_timestamp: 0,
                job_id: JobId::new(1),
            },
            items,
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn test_execute_job_statuses() {
        let repo = repository();
        let cache = ComputationCache::new();
        cache.put(price_spec(), Value::Double(21.0));

        let result = execute_job(
            &job(vec![
                item(&repo, "DOUBLE", vec![price_spec()]),
                item(&repo, "BROKEN", vec![]),
            ]),
            &repo,
            &cache,
        );

        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[0].status, ItemStatus::Success);
        assert_eq!(result.items[0].value, Some(Value::Double(42.0)));
        assert_eq!(result.items[1].status, ItemStatus::Failure);
        assert!(result.items[1].error.as_deref().unwrap().contains("no curve"));
        // Outputs are reported, not cached.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_unknown_function_fails_outputs() {
        let repo = repository();
        let cache = ComputationCache::new();
        let output = ValueSpecification::new(
            "Ghost",
            bond(),
            quiver_traits::ValueProperties::new(),
            "GHOST".into(),
        );
        let unknown = CalculationJobItem {
            function_id: "GHOST".into(),
            target: bond(),
            input_specs: Vec::new(),
            output_specs: vec![output],
        };

        let result = execute_job(&job(vec![unknown]), &repo, &cache);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].status, ItemStatus::Failure);
        assert_eq!(result.items[0].error.as_deref(), Some("function not found: GHOST"));
    }

    #[test]
    fn test_missing_input_reported() {
        let repo = repository();
        let cache = ComputationCache::new();
        let result = execute_job(&job(vec![item(&repo, "DOUBLE", vec![price_spec()])]), &repo, &cache);
        assert_eq!(result.items[0].status, ItemStatus::MissingInput);
    }

    struct Forward(mpsc::UnboundedSender<CalculationJobResult>);

    impl JobInvocationReceiver for Forward {
        fn job_completed(&self, result: CalculationJobResult) {
            let _ = self.0.send(result);
        }

        fn job_failed(&self, _invoker: &InvokerId, _job_id: JobId, _failure: JobFailure) {}
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let repo = repository();
        let cache = Arc::new(ComputationCache::new());
        cache.put(price_spec(), Value::Double(1.0));
        let invoker = LocalJobInvoker::new(repo.clone(), cache).with_capacity(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver: Arc<dyn JobInvocationReceiver> = Arc::new(Forward(tx));

        let first = job(vec![item(&repo, "DOUBLE", vec![price_spec()])]);
        assert!(invoker.try_invoke(first.clone(), Arc::clone(&receiver)));
        let accepted_second = invoker.try_invoke(first, receiver);

        let result = rx.recv().await.unwrap();
        assert_eq!(result.success_count(), 1);
        if accepted_second {
            rx.recv().await.unwrap();
        }
        tokio::task::yield_now().await;
        assert!(invoker.in_flight() <= 1);
    }

    #[test]
    fn test_invoker_set_sizes() {
        let repo = repository();
        let cache = Arc::new(ComputationCache::new());
        let set = LocalInvokerSet::with_node_count(3, repo.clone(), cache.clone());
        assert_eq!(set.len(), 3);
        assert_eq!(set.invokers()[2].id().as_str(), "local-2");
        assert!(LocalInvokerSet::per_core(1, repo, cache).len() >= 1);
    }
}
