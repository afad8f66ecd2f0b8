//! Dependency graph executor.
//!
//! Execution proceeds in batches. Batch k is every unexecuted node whose
//! dependencies are pre-satisfied or were produced by batches before k; it
//! is packed into jobs of at most `max_job_size` items and handed to the
//! dispatcher. Batch k+1 is only formed once every job of batch k has
//! reported and its outputs are in the cache.
//!
//! Failure is a status value: a failed node fails its transitive dependents
//! without dispatching them, and each requested value reports either its
//! value or the chain of failures that reached it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use quiver_traits::{
    CalculationJob, CalculationJobItem, CalculationJobResult, CalculationJobResultItem,
    CalculationJobSpec, ComputationTarget, CycleId, ExecutorConfig, FailurePolicy, FunctionId,
    InvokerId, ItemStatus, JobFailure, JobId, JobInvocationReceiver, Value, ValueRequirement,
    ValueSpecification,
};

use crate::cache::{CacheSnapshot, ComputationCache};
use crate::depgraph::{DependencyGraph, NodeIndex};
use crate::dispatcher::JobDispatcher;
use crate::error::{EngineError, EngineResult};
use crate::stats::{DiscardingStatistics, StatisticsGatherer};

// =============================================================================
// RESULT TYPES
// =============================================================================

/// Why a node did not produce its outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureCause {
    /// The function raised an error.
    FunctionFailed(String),
    /// An input was absent from the cache when the node ran.
    MissingInput(String),
    /// The job carrying the node was aborted.
    JobAborted(JobFailure),
    /// The invoker returned no item for an output.
    OutputNotReported(String),
    /// A dependency failed.
    UpstreamFailed,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::FunctionFailed(e) => write!(f, "function failed: {}", e),
            FailureCause::MissingInput(spec) => write!(f, "missing input {}", spec),
            FailureCause::JobAborted(failure) => write!(f, "job aborted: {}", failure),
            FailureCause::OutputNotReported(spec) => write!(f, "output not reported: {}", spec),
            FailureCause::UpstreamFailed => f.write_str("upstream failed"),
        }
    }
}

/// One failed node (or missing external value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureLink {
    /// Function of the failed node; `None` for an external value.
    pub function_id: Option<FunctionId>,
    /// Target of the failed node.
    pub target: ComputationTarget,
    /// What went wrong.
    pub cause: FailureCause,
}

/// Failures from the originating node up to the requested value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureChain {
    links: Vec<FailureLink>,
}

impl FailureChain {
    fn origin(link: FailureLink) -> Self {
        Self { links: vec![link] }
    }

    fn extended(&self, link: FailureLink) -> Self {
        let mut links = self.links.clone();
        links.push(link);
        Self { links }
    }

    /// Links, originating failure first.
    pub fn links(&self) -> &[FailureLink] {
        &self.links
    }

    /// The originating failure.
    pub fn root_cause(&self) -> Option<&FailureLink> {
        self.links.first()
    }

    /// Number of links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Returns true if the chain has no links.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl fmt::Display for FailureChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, link) in self.links.iter().enumerate() {
            if i > 0 {
                f.write_str(" <- ")?;
            }
            match &link.function_id {
                Some(id) => write!(f, "{}({}): {}", id, link.target, link.cause)?,
                None => write!(f, "external({}): {}", link.target, link.cause)?,
            }
        }
        Ok(())
    }
}

/// Outcome for one requested value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootOutcome {
    /// The computed value.
    Value(Value),
    /// The failure chain that reached it.
    Failed(FailureChain),
    /// Execution stopped before it was computed.
    Cancelled,
}

/// Requested value with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootResult {
    /// The requested value.
    pub requirement: ValueRequirement,
    /// Specification that satisfied it.
    pub specification: ValueSpecification,
    /// Outcome.
    pub outcome: RootOutcome,
}

/// Result of one graph execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Cycle the execution belonged to.
    pub cycle: CycleId,
    /// Per requested value outcomes, in graph root order.
    pub roots: Vec<RootResult>,
    /// Batches formed.
    pub batches: usize,
    /// Jobs dispatched.
    pub jobs: usize,
    /// Nodes that produced their outputs.
    pub nodes_executed: usize,
    /// Nodes that failed, directly or through a dependency.
    pub nodes_failed: usize,
    /// Nodes not run because their outputs were already cached.
    pub nodes_skipped: usize,
    /// Stopped by cancellation or deadline.
    pub cancelled: bool,
    /// Stopped because a failure reached a requested value.
    pub aborted: bool,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl ExecutionResult {
    /// Outcome for a requested value.
    pub fn outcome(&self, requirement: &ValueRequirement) -> Option<&RootOutcome> {
        self.roots
            .iter()
            .find(|r| &r.requirement == requirement)
            .map(|r| &r.outcome)
    }

    /// Value for a requested value, if it succeeded.
    pub fn value(&self, requirement: &ValueRequirement) -> Option<&Value> {
        match self.outcome(requirement) {
            Some(RootOutcome::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// Returns true if every requested value has a value.
    pub fn all_succeeded(&self) -> bool {
        self.roots
            .iter()
            .all(|r| matches!(r.outcome, RootOutcome::Value(_)))
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string(self).map_err(|e| EngineError::Internal(e.to_string()))
    }

    /// Requested values that failed.
    pub fn failures(&self) -> impl Iterator<Item = (&ValueRequirement, &FailureChain)> {
        self.roots.iter().filter_map(|r| match &r.outcome {
            RootOutcome::Failed(chain) => Some((&r.requirement, chain)),
            _ => None,
        })
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Handle to a running execution. Dropping it cancels the execution.
pub struct ExecutionHandle {
    result: oneshot::Receiver<ExecutionResult>,
    cancel: watch::Sender<bool>,
}

impl ExecutionHandle {
    /// Stop forming new batches. Results already in flight still reach the
    /// cache.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for every requested value to reach a terminal status.
    pub async fn wait(self) -> EngineResult<ExecutionResult> {
        let ExecutionHandle { result, cancel } = self;
        let outcome = result.await.map_err(|_| EngineError::Cancelled);
        drop(cancel);
        outcome
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle").finish_non_exhaustive()
    }
}

// =============================================================================
// RECEIVER
// =============================================================================

enum ExecutorEvent {
    Completed(CalculationJobResult),
    Failed { job_id: JobId, failure: JobFailure },
}

/// Writes successful outputs to the cache, then informs the executor.
struct CycleReceiver {
    cache: Arc<ComputationCache>,
    events: mpsc::UnboundedSender<ExecutorEvent>,
}

impl JobInvocationReceiver for CycleReceiver {
    fn job_completed(&self, result: CalculationJobResult) {
        for item in &result.items {
            if let (ItemStatus::Success, Some(value)) = (item.status, &item.value) {
                self.cache.put(item.output_spec.clone(), value.clone());
            }
        }
        let _ = self.events.send(ExecutorEvent::Completed(result));
    }

    fn job_failed(&self, invoker: &InvokerId, job_id: JobId, failure: JobFailure) {
        trace!(job_id = %job_id, invoker = %invoker, "Job failure received");
        let _ = self.events.send(ExecutorEvent::Failed { job_id, failure });
    }
}

// =============================================================================
// EXECUTOR
// =============================================================================

/// Executes dependency graphs through a dispatcher.
#[derive(Clone)]
pub struct DependencyGraphExecutor {
    dispatcher: JobDispatcher,
    cache: Arc<ComputationCache>,
    config: ExecutorConfig,
    statistics: Arc<dyn StatisticsGatherer>,
    cycle_name: String,
}

impl DependencyGraphExecutor {
    /// Create an executor.
    pub fn new(dispatcher: JobDispatcher, cache: Arc<ComputationCache>, config: ExecutorConfig) -> Self {
        Self {
            dispatcher,
            cache,
            config,
            statistics: Arc::new(DiscardingStatistics),
            cycle_name: "quiver".to_string(),
        }
    }

    /// Set the statistics gatherer.
    pub fn with_statistics(mut self, statistics: Arc<dyn StatisticsGatherer>) -> Self {
        self.statistics = statistics;
        self
    }

    /// Set the name stamped on every job.
    pub fn with_cycle_name(mut self, name: impl Into<String>) -> Self {
        self.cycle_name = name.into();
        self
    }

    /// Executor configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start executing a graph and return immediately.
    ///
    /// Nodes whose outputs are all present in `snapshot` are not run, and
    /// neither are their dependencies unless something else needs them.
    /// Must be called within a tokio runtime.
    pub fn execute(
        &self,
        graph: Arc<DependencyGraph>,
        snapshot: &CacheSnapshot,
        cycle: CycleId,
    ) -> EngineResult<ExecutionHandle> {
        graph.validate()?;
        let order = graph.topological_order()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (result_tx, result_rx) = oneshot::channel();

        let status = initial_status(&graph, snapshot);
        let receiver: Arc<dyn JobInvocationReceiver> = Arc::new(CycleReceiver {
            cache: Arc::clone(&self.cache),
            events: events_tx,
        });

        let run = Execution {
            cycle_timestamp: graph.resolution_time().timestamp_millis(),
            graph,
            order,
            status,
            cycle,
            cycle_name: self.cycle_name.clone(),
            config: self.config.clone(),
            cache: Arc::clone(&self.cache),
            dispatcher: self.dispatcher.clone(),
            statistics: Arc::clone(&self.statistics),
            receiver,
            job_nodes: HashMap::new(),
            node_jobs: HashMap::new(),
            outstanding: HashSet::new(),
            batches: 0,
            jobs: 0,
            job_items: 0,
            execution_nanos: 0,
        };
        tokio::spawn(run.run(events_rx, cancel_rx, result_tx));

        Ok(ExecutionHandle {
            result: result_rx,
            cancel: cancel_tx,
        })
    }
}

impl fmt::Debug for DependencyGraphExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyGraphExecutor")
            .field("config", &self.config)
            .field("cycle_name", &self.cycle_name)
            .finish()
    }
}

#[derive(Debug, Clone)]
enum NodeStatus {
    Pending,
    Running,
    Done,
    Skipped,
    Failed(FailureChain),
}

impl NodeStatus {
    fn is_satisfied(&self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Skipped)
    }
}

/// Mark the nodes that need to run; everything else is skipped.
fn initial_status(graph: &DependencyGraph, snapshot: &CacheSnapshot) -> Vec<NodeStatus> {
    let cached = |idx: NodeIndex| {
        graph
            .node(idx)
            .map(|n| !n.outputs.is_empty() && n.outputs.iter().all(|o| snapshot.contains(o)))
            .unwrap_or(false)
    };

    let mut status = vec![NodeStatus::Skipped; graph.node_count()];
    let mut work: Vec<NodeIndex> = graph
        .roots()
        .iter()
        .filter_map(|r| r.node)
        .filter(|&idx| !cached(idx))
        .collect();

    while let Some(idx) = work.pop() {
        if matches!(status[idx.index()], NodeStatus::Pending) {
            continue;
        }
        status[idx.index()] = NodeStatus::Pending;
        work.extend(graph.dependencies(idx).filter(|&dep| !cached(dep)));
    }
    status
}

struct Execution {
    graph: Arc<DependencyGraph>,
    order: Vec<NodeIndex>,
    status: Vec<NodeStatus>,
    cycle: CycleId,
    cycle_name: String,
    cycle_timestamp: i64,
    config: ExecutorConfig,
    cache: Arc<ComputationCache>,
    dispatcher: JobDispatcher,
    statistics: Arc<dyn StatisticsGatherer>,
    receiver: Arc<dyn JobInvocationReceiver>,
    job_nodes: HashMap<JobId, Vec<NodeIndex>>,
    node_jobs: HashMap<NodeIndex, JobId>,
    outstanding: HashSet<JobId>,
    batches: usize,
    jobs: usize,
    job_items: usize,
    execution_nanos: u64,
}

impl Execution {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ExecutorEvent>,
        mut cancel: watch::Receiver<bool>,
        result: oneshot::Sender<ExecutionResult>,
    ) {
        let start = Instant::now();
        let deadline = self.config.deadline();
        let sleep = tokio::time::sleep(deadline.unwrap_or(Duration::from_secs(365 * 24 * 3600)));
        tokio::pin!(sleep);

        let mut cancelled = false;
        let mut aborted = false;

        'batches: loop {
            if *cancel.borrow() {
                info!(cycle = %self.cycle, "Execution cancelled");
                cancelled = true;
                break;
            }

            self.propagate_failures();
            if self.root_failed() {
                aborted = true;
                break;
            }

            let batch: Vec<NodeIndex> = self
                .order
                .iter()
                .copied()
                .filter(|&idx| matches!(self.status[idx.index()], NodeStatus::Pending))
                .filter(|&idx| {
                    self.graph
                        .dependencies(idx)
                        .all(|dep| self.status[dep.index()].is_satisfied())
                })
                .collect();
            if batch.is_empty() {
                break;
            }

            self.dispatch_batch(batch);

            while !self.outstanding.is_empty() {
                tokio::select! {
                    biased;
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            info!(cycle = %self.cycle, "Execution cancelled");
                            cancelled = true;
                            break 'batches;
                        }
                    }
                    _ = &mut sleep, if deadline.is_some() => {
                        warn!(
                            cycle = %self.cycle,
                            deadline_ms = self.config.deadline_ms,
                            "Execution deadline expired"
                        );
                        cancelled = true;
                        break 'batches;
                    }
                    event = events.recv() => {
                        match event {
                            Some(event) => self.handle(event),
                            None => break 'batches,
                        }
                        if self.config.failure_policy == FailurePolicy::AbortOnRootFailure {
                            self.propagate_failures();
                            if self.root_failed() {
                                aborted = true;
                                break 'batches;
                            }
                        }
                    }
                }
            }
        }

        if aborted {
            warn!(cycle = %self.cycle, "Failure reached a requested value, execution aborted");
        }

        let outcome = self.finish(start.elapsed(), cancelled, aborted);
        let _ = result.send(outcome);
    }

    fn dispatch_batch(&mut self, batch: Vec<NodeIndex>) {
        self.batches += 1;
        let max_job_size = self.config.max_job_size.max(1);
        let mut dispatched = 0;

        for chunk in batch.chunks(max_job_size) {
            let job_id = self.dispatcher.next_job_id();
            let mut items = Vec::with_capacity(chunk.len());
            let mut depends_on = BTreeSet::new();

            for &idx in chunk {
                let Some(node) = self.graph.node(idx) else { continue };
                items.push(CalculationJobItem {
                    function_id: node.function_id().clone(),
                    target: node.target.clone(),
                    input_specs: node.inputs.clone(),
                    output_specs: node.outputs.clone(),
                });
                depends_on.extend(
                    self.graph
                        .dependencies(idx)
                        .filter_map(|dep| self.node_jobs.get(&dep).copied()),
                );
                self.status[idx.index()] = NodeStatus::Running;
                self.node_jobs.insert(idx, job_id);
            }

            let job = CalculationJob {
                spec: CalculationJobSpec {
                    cycle_name: self.cycle_name.clone(),
                    cycle_timestamp: self.cycle_timestamp,
                    job_id,
                },
                items,
                depends_on: depends_on.into_iter().collect(),
            };
            self.jobs += 1;
            self.job_items += job.len();
            self.job_nodes.insert(job_id, chunk.to_vec());
            self.outstanding.insert(job_id);

            if let Err(e) = self.dispatcher.dispatch(job, Arc::clone(&self.receiver)) {
                warn!(job_id = %job_id, error = %e, "Dispatch rejected");
                self.fail_job(job_id, JobFailure::DispatcherShutdown);
                continue;
            }
            dispatched += 1;
        }

        debug!(
            cycle = %self.cycle,
            batch = self.batches,
            nodes = batch.len(),
            jobs = dispatched,
            "Batch dispatched"
        );
    }

    fn handle(&mut self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::Completed(result) => self.complete_job(result),
            ExecutorEvent::Failed { job_id, failure } => {
                warn!(job_id = %job_id, error = %failure, "Job aborted, failing its nodes");
                self.fail_job(job_id, failure);
            }
        }
    }

    fn complete_job(&mut self, result: CalculationJobResult) {
        self.outstanding.remove(&result.job_id);
        let Some(nodes) = self.job_nodes.remove(&result.job_id) else {
            return;
        };
        self.execution_nanos += result.duration_nanos;

        let items: HashMap<&ValueSpecification, &CalculationJobResultItem> = result
            .items
            .iter()
            .map(|item| (&item.output_spec, item))
            .collect();

        for idx in nodes {
            let Some(node) = self.graph.node(idx) else { continue };
            let failure = node.outputs.iter().find_map(|output| match items.get(output) {
                Some(item) => match item.status {
                    ItemStatus::Success => None,
                    ItemStatus::Failure => Some(FailureCause::FunctionFailed(
                        item.error.clone().unwrap_or_default(),
                    )),
                    ItemStatus::MissingInput => Some(FailureCause::MissingInput(
                        item.error.clone().unwrap_or_default(),
                    )),
                },
                None => Some(FailureCause::OutputNotReported(output.to_string())),
            });

            self.status[idx.index()] = match failure {
                None => {
                    trace!(node = %node, "Node executed");
                    NodeStatus::Done
                }
                Some(cause) => {
                    debug!(node = %node, cause = %cause, "Node failed");
                    NodeStatus::Failed(FailureChain::origin(FailureLink {
                        function_id: Some(node.function_id().clone()),
                        target: node.target.clone(),
                        cause,
                    }))
                }
            };
        }
    }

    fn fail_job(&mut self, job_id: JobId, failure: JobFailure) {
        self.outstanding.remove(&job_id);
        let Some(nodes) = self.job_nodes.remove(&job_id) else {
            return;
        };
        for idx in nodes {
            let Some(node) = self.graph.node(idx) else { continue };
            self.status[idx.index()] = NodeStatus::Failed(FailureChain::origin(FailureLink {
                function_id: Some(node.function_id().clone()),
                target: node.target.clone(),
                cause: FailureCause::JobAborted(failure.clone()),
            }));
        }
    }

    /// Fail every pending node with a failed dependency, in topological order
    /// so failures reach transitive dependents in one pass.
    fn propagate_failures(&mut self) {
        for &idx in &self.order {
            if !matches!(self.status[idx.index()], NodeStatus::Pending) {
                continue;
            }
            let upstream = self.graph.dependencies(idx).find_map(|dep| {
                match &self.status[dep.index()] {
                    NodeStatus::Failed(chain) => Some(chain.clone()),
                    _ => None,
                }
            });
            if let (Some(chain), Some(node)) = (upstream, self.graph.node(idx)) {
                self.status[idx.index()] = NodeStatus::Failed(chain.extended(FailureLink {
                    function_id: Some(node.function_id().clone()),
                    target: node.target.clone(),
                    cause: FailureCause::UpstreamFailed,
                }));
            }
        }
    }

    fn root_failed(&self) -> bool {
        self.config.failure_policy == FailurePolicy::AbortOnRootFailure
            && self.graph.roots().iter().any(|r| {
                r.node
                    .map(|idx| matches!(self.status[idx.index()], NodeStatus::Failed(_)))
                    .unwrap_or(false)
            })
    }

    fn finish(self, duration: Duration, cancelled: bool, aborted: bool) -> ExecutionResult {
        let roots: Vec<RootResult> = self
            .graph
            .roots()
            .iter()
            .map(|root| {
                let outcome = match root.node.map(|idx| &self.status[idx.index()]) {
                    None => match self.cache.get(&root.specification) {
                        Some(value) => RootOutcome::Value(value),
                        None => RootOutcome::Failed(FailureChain::origin(FailureLink {
                            function_id: None,
                            target: root.specification.target.clone(),
                            cause: FailureCause::MissingInput(root.specification.to_string()),
                        })),
                    },
                    Some(NodeStatus::Done) | Some(NodeStatus::Skipped) => {
                        match self.cache.get(&root.specification) {
                            Some(value) => RootOutcome::Value(value),
                            None => RootOutcome::Failed(FailureChain::origin(FailureLink {
                                function_id: root.specification.function_id.clone(),
                                target: root.specification.target.clone(),
                                cause: FailureCause::OutputNotReported(
                                    root.specification.to_string(),
                                ),
                            })),
                        }
                    }
                    Some(NodeStatus::Failed(chain)) => RootOutcome::Failed(chain.clone()),
                    Some(NodeStatus::Pending) | Some(NodeStatus::Running) => RootOutcome::Cancelled,
                };
                RootResult {
                    requirement: root.requirement.clone(),
                    specification: root.specification.clone(),
                    outcome,
                }
            })
            .collect();

        let count = |f: fn(&NodeStatus) -> bool| self.status.iter().filter(|s| f(s)).count();
        let nodes_executed = count(|s| matches!(s, NodeStatus::Done));
        let nodes_failed = count(|s| matches!(s, NodeStatus::Failed(_)));
        let nodes_skipped = count(|s| matches!(s, NodeStatus::Skipped));

        let mean_job_size = if self.jobs == 0 {
            0.0
        } else {
            self.job_items as f64 / self.jobs as f64
        };
        self.statistics
            .graph_processed(self.cycle, self.jobs, mean_job_size);
        self.statistics
            .graph_executed(self.cycle, nodes_executed, self.execution_nanos, duration);

        let failed_roots = roots
            .iter()
            .filter(|r| matches!(r.outcome, RootOutcome::Failed(_)))
            .count();
        info!(
            cycle = %self.cycle,
            roots = roots.len(),
            failed_roots,
            batches = self.batches,
            jobs = self.jobs,
            nodes_executed,
            nodes_failed,
            nodes_skipped,
            duration_ms = duration.as_millis() as u64,
            "Graph execution finished"
        );

        ExecutionResult {
            cycle: self.cycle,
            roots,
            batches: self.batches,
            jobs: self.jobs,
            nodes_executed,
            nodes_failed,
            nodes_skipped,
            cancelled,
            aborted,
            duration,
        }
    }
}
