//! Job dispatcher and invoker pool.
//!
//! The dispatcher is an actor: a single tokio task owns the invoker slots,
//! the job table and the overflow queue, and every event (new job, result,
//! failure, timeout) arrives as a message on its inbox. Invokers report back
//! through a per-attempt receiver that forwards into the same inbox, so no
//! lock is held across an invoker call.
//!
//! Only [`JobDispatcher`] handles hold a strong sender. The actor, its timers
//! and the attempt receivers hold weak ones, so the task stops once the last
//! handle is dropped.
//!
//! ```text
//! CREATED -> DISPATCHED -> COMPLETED
//!               |  ^
//!               v  |
//!        FAILED / TIMED_OUT --(attempts exhausted)--> ABORTED
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use quiver_traits::{
    CalculationJob, CalculationJobResult, DispatchConfig, InvokerId, JobFailure, JobId,
    JobInvocationReceiver, JobInvoker, SelectionPolicy,
};

use crate::error::{EngineError, EngineResult};

/// Invoker ID used for failures raised by the dispatcher itself.
pub const DISPATCHER_ID: &str = "dispatcher";

// =============================================================================
// PUBLIC STATE
// =============================================================================

/// Dispatch state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobState {
    /// Accepted, waiting for invoker capacity.
    Created,
    /// Handed to an invoker.
    Dispatched {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Invoker holding the job.
        invoker: InvokerId,
    },
    /// The attempt failed; a redispatch follows unless attempts are exhausted.
    Failed {
        /// Attempt that failed.
        attempt: u32,
    },
    /// The attempt missed its deadline; the invoker is suspected dead.
    TimedOut {
        /// Attempt that timed out.
        attempt: u32,
    },
    /// A result was delivered.
    Completed,
    /// Given up.
    Aborted,
}

impl JobState {
    /// Returns true for COMPLETED and ABORTED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Aborted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => f.write_str("CREATED"),
            JobState::Dispatched { attempt, invoker } => {
                write!(f, "DISPATCHED(attempt {} on {})", attempt, invoker)
            }
            JobState::Failed { attempt } => write!(f, "FAILED(attempt {})", attempt),
            JobState::TimedOut { attempt } => write!(f, "TIMED_OUT(attempt {})", attempt),
            JobState::Completed => f.write_str("COMPLETED"),
            JobState::Aborted => f.write_str("ABORTED"),
        }
    }
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Attempts handed to invokers.
    pub dispatched: u64,
    /// Jobs completed.
    pub completed: u64,
    /// Redispatches after failure or timeout.
    pub retried: u64,
    /// Jobs aborted after retry exhaustion or shutdown.
    pub aborted: u64,
    /// Jobs rejected because the queue was full.
    pub overflowed: u64,
    /// Jobs currently waiting for capacity.
    pub queued: usize,
    /// Registered invokers.
    pub invokers: usize,
}

#[derive(Default)]
struct Shared {
    states: DashMap<JobId, JobState>,
    next_job_id: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    aborted: AtomicU64,
    overflowed: AtomicU64,
    queued: AtomicUsize,
    invokers: AtomicUsize,
}

enum Command {
    Register(Arc<dyn JobInvoker>),
    Dispatch {
        job: CalculationJob,
        receiver: Arc<dyn JobInvocationReceiver>,
    },
    Completed {
        job_id: JobId,
        attempt: u32,
        result: CalculationJobResult,
    },
    Failed {
        job_id: JobId,
        attempt: u32,
        invoker: InvokerId,
        failure: JobFailure,
    },
    Timeout {
        job_id: JobId,
        attempt: u32,
    },
    Shutdown(oneshot::Sender<()>),
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable handle to the dispatcher task.
#[derive(Clone)]
pub struct JobDispatcher {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    config: DispatchConfig,
}

impl JobDispatcher {
    /// Start the dispatcher task. Must be called within a tokio runtime.
    pub fn spawn(config: DispatchConfig) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let actor = DispatcherActor {
            config: config.clone(),
            shared: Arc::clone(&shared),
            commands: commands.downgrade(),
            invokers: Vec::new(),
            jobs: HashMap::new(),
            queue: VecDeque::new(),
            outstanding: HashMap::new(),
            cursor: 0,
        };
        tokio::spawn(actor.run(inbox));

        info!(
            max_attempts = config.max_attempts,
            response_timeout_ms = config.response_timeout_ms,
            max_queued_jobs = config.max_queued_jobs,
            "Job dispatcher started"
        );

        Self {
            shared,
            commands,
            config,
        }
    }

    /// Dispatcher configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Allocate a job ID unique within this dispatcher.
    pub fn next_job_id(&self) -> JobId {
        JobId::new(self.shared.next_job_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Add an invoker to the pool.
    pub fn register_invoker(&self, invoker: Arc<dyn JobInvoker>) -> EngineResult<()> {
        self.commands
            .send(Command::Register(invoker))
            .map_err(|_| EngineError::DispatcherShutdown)?;
        self.shared.invokers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Submit a job.
    ///
    /// Exactly one of the receiver's methods is called once the job reaches
    /// COMPLETED or ABORTED. Intermediate failures are retried internally and
    /// never reach the receiver.
    pub fn dispatch(
        &self,
        job: CalculationJob,
        receiver: Arc<dyn JobInvocationReceiver>,
    ) -> EngineResult<()> {
        let job_id = job.job_id();
        self.shared.states.insert(job_id, JobState::Created);
        if self
            .commands
            .send(Command::Dispatch { job, receiver })
            .is_err()
        {
            self.shared.states.remove(&job_id);
            return Err(EngineError::DispatcherShutdown);
        }
        Ok(())
    }

    /// Current state of a job.
    pub fn job_state(&self, job_id: JobId) -> Option<JobState> {
        self.shared.states.get(&job_id).map(|s| s.value().clone())
    }

    /// Number of registered invokers.
    pub fn invoker_count(&self) -> usize {
        self.shared.invokers.load(Ordering::Relaxed)
    }

    /// Current counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            retried: self.shared.retried.load(Ordering::Relaxed),
            aborted: self.shared.aborted.load(Ordering::Relaxed),
            overflowed: self.shared.overflowed.load(Ordering::Relaxed),
            queued: self.shared.queued.load(Ordering::Relaxed),
            invokers: self.shared.invokers.load(Ordering::Relaxed),
        }
    }

    /// Forget the states of COMPLETED and ABORTED jobs.
    pub fn clear_finished(&self) {
        self.shared.states.retain(|_, state| !state.is_terminal());
    }

    /// Stop the dispatcher. Jobs still pending are aborted with
    /// [`JobFailure::DispatcherShutdown`].
    pub async fn shutdown(&self) -> EngineResult<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(ack))
            .map_err(|_| EngineError::DispatcherShutdown)?;
        done.await.map_err(|_| EngineError::DispatcherShutdown)
    }

    /// Returns true once the dispatcher task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// ATTEMPT RECEIVER
// =============================================================================

/// Receiver handed to an invoker for one attempt.
struct AttemptReceiver {
    job_id: JobId,
    attempt: u32,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl AttemptReceiver {
    fn send(&self, command: Command) {
        match self.commands.upgrade() {
            Some(commands) => {
                let _ = commands.send(command);
            }
            None => trace!(job_id = %self.job_id, "Dispatcher gone, dropping report"),
        }
    }
}

impl JobInvocationReceiver for AttemptReceiver {
    fn job_completed(&self, result: CalculationJobResult) {
        if result.job_id != self.job_id {
            warn!(
                job_id = %self.job_id,
                reported = %result.job_id,
                "Result reported under a different job ID"
            );
        }
        self.send(Command::Completed {
            job_id: self.job_id,
            attempt: self.attempt,
            result,
        });
    }

    fn job_failed(&self, invoker: &InvokerId, _job_id: JobId, failure: JobFailure) {
        self.send(Command::Failed {
            job_id: self.job_id,
            attempt: self.attempt,
            invoker: invoker.clone(),
            failure,
        });
    }
}

// =============================================================================
// ACTOR
// =============================================================================

struct InvokerSlot {
    invoker: Arc<dyn JobInvoker>,
    in_flight: usize,
}

impl InvokerSlot {
    fn has_capacity(&self) -> bool {
        self.invoker.is_available() && self.in_flight < self.invoker.capacity()
    }

    fn load(&self) -> f64 {
        self.in_flight as f64 / self.invoker.capacity().max(1) as f64
    }
}

struct JobRecord {
    job: CalculationJob,
    receiver: Arc<dyn JobInvocationReceiver>,
    attempt: u32,
    awaiting: bool,
    tried: HashSet<InvokerId>,
    last_invoker: Option<InvokerId>,
    last_failure: Option<JobFailure>,
    timer: Option<JoinHandle<()>>,
}

struct DispatcherActor {
    config: DispatchConfig,
    shared: Arc<Shared>,
    commands: mpsc::WeakUnboundedSender<Command>,
    invokers: Vec<InvokerSlot>,
    jobs: HashMap<JobId, JobRecord>,
    queue: VecDeque<JobId>,
    outstanding: HashMap<(JobId, u32), usize>,
    cursor: usize,
}

impl DispatcherActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        let period = self.config.requeue_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = inbox.recv() => {
                    match command {
                        Some(Command::Shutdown(ack)) => {
                            self.stop(&mut inbox);
                            let _ = ack.send(());
                            break;
                        }
                        Some(command) => self.handle(command),
                        None => {
                            debug!("All dispatcher handles dropped");
                            self.stop(&mut inbox);
                            break;
                        }
                    }
                }
                _ = ticker.tick(), if !self.queue.is_empty() => self.drain_queue(),
            }
        }

        info!("Job dispatcher stopped");
    }

    /// Close the inbox and fail everything still pending, including jobs
    /// submitted after the stop was requested.
    fn stop(&mut self, inbox: &mut mpsc::UnboundedReceiver<Command>) {
        inbox.close();
        self.abort_all();
        while let Ok(command) = inbox.try_recv() {
            match command {
                Command::Dispatch { job, receiver } => {
                    let job_id = job.job_id();
                    debug!(job_id = %job_id, "Job submitted during shutdown, aborting");
                    self.shared.states.insert(job_id, JobState::Aborted);
                    self.shared.aborted.fetch_add(1, Ordering::Relaxed);
                    receiver.job_failed(
                        &InvokerId::new(DISPATCHER_ID),
                        job_id,
                        JobFailure::DispatcherShutdown,
                    );
                }
                Command::Shutdown(ack) => {
                    let _ = ack.send(());
                }
                _ => {}
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register(invoker) => {
                info!(
                    invoker = %invoker.id(),
                    capacity = invoker.capacity(),
                    "Invoker registered"
                );
                self.invokers.push(InvokerSlot {
                    invoker,
                    in_flight: 0,
                });
                self.drain_queue();
            }
            Command::Dispatch { job, receiver } => self.accept(job, receiver),
            Command::Completed {
                job_id,
                attempt,
                result,
            } => self.on_completed(job_id, attempt, result),
            Command::Failed {
                job_id,
                attempt,
                invoker,
                failure,
            } => self.on_failed(job_id, attempt, invoker, failure),
            Command::Timeout { job_id, attempt } => self.on_timeout(job_id, attempt),
            Command::Shutdown(_) => {}
        }
    }

    fn accept(&mut self, job: CalculationJob, receiver: Arc<dyn JobInvocationReceiver>) {
        let job_id = job.job_id();
        if self.jobs.contains_key(&job_id) {
            warn!(job_id = %job_id, "Duplicate job ID rejected");
            receiver.job_failed(
                &InvokerId::new(DISPATCHER_ID),
                job_id,
                JobFailure::InvokerFailed {
                    invoker: InvokerId::new(DISPATCHER_ID),
                    message: format!("duplicate job ID {}", job_id),
                },
            );
            return;
        }

        self.jobs.insert(
            job_id,
            JobRecord {
                job,
                receiver,
                attempt: 0,
                awaiting: false,
                tried: HashSet::new(),
                last_invoker: None,
                last_failure: None,
                timer: None,
            },
        );

        if self.try_place(job_id) {
            return;
        }

        if self.queue.len() >= self.config.max_queued_jobs {
            warn!(
                job_id = %job_id,
                capacity = self.config.max_queued_jobs,
                "Dispatch queue full, rejecting job"
            );
            self.shared.overflowed.fetch_add(1, Ordering::Relaxed);
            let failure = JobFailure::DispatchQueueOverflow {
                capacity: self.config.max_queued_jobs,
            };
            self.finish_aborted(job_id, failure);
            return;
        }

        debug!(job_id = %job_id, queued = self.queue.len() + 1, "No invoker capacity, job queued");
        self.queue.push_back(job_id);
        self.update_queued();
    }

    /// Invoker indices to offer a job to, best first.
    ///
    /// Invokers that already failed the job are excluded while any other
    /// available invoker exists.
    fn selection_order(&self, tried: &HashSet<InvokerId>) -> Vec<usize> {
        let n = self.invokers.len();
        if n == 0 {
            return Vec::new();
        }
        let untried_exists = self
            .invokers
            .iter()
            .any(|s| s.invoker.is_available() && !tried.contains(s.invoker.id()));

        let mut order: Vec<usize> = (0..n)
            .map(|k| (self.cursor + k) % n)
            .filter(|&i| self.invokers[i].has_capacity())
            .filter(|&i| !untried_exists || !tried.contains(self.invokers[i].invoker.id()))
            .collect();

        if self.config.selection == SelectionPolicy::LeastLoaded {
            // Stable sort keeps the round-robin order among equal loads.
            order.sort_by(|&a, &b| self.invokers[a].load().total_cmp(&self.invokers[b].load()));
        }
        order
    }

    /// Offer a job to the pool. Returns false if no invoker accepted it.
    fn try_place(&mut self, job_id: JobId) -> bool {
        let (job, tried, attempt) = match self.jobs.get(&job_id) {
            Some(record) => (record.job.clone(), record.tried.clone(), record.attempt + 1),
            None => return true,
        };

        for idx in self.selection_order(&tried) {
            let invoker = Arc::clone(&self.invokers[idx].invoker);
            let receiver = Arc::new(AttemptReceiver {
                job_id,
                attempt,
                commands: self.commands.clone(),
            });
            if !invoker.try_invoke(job.clone(), receiver) {
                trace!(job_id = %job_id, invoker = %invoker.id(), "Invoker refused job");
                continue;
            }

            if tried.contains(invoker.id()) {
                warn!(
                    job_id = %job_id,
                    invoker = %invoker.id(),
                    "No other invoker available, retrying on the same invoker"
                );
            }

            self.invokers[idx].in_flight += 1;
            self.cursor = (idx + 1) % self.invokers.len();
            self.outstanding.insert((job_id, attempt), idx);
            let timer = self.start_timer(job_id, attempt);

            if let Some(record) = self.jobs.get_mut(&job_id) {
                record.attempt = attempt;
                record.awaiting = true;
                record.last_invoker = Some(invoker.id().clone());
                if let Some(old) = record.timer.replace(timer) {
                    old.abort();
                }
            }

            self.shared.states.insert(
                job_id,
                JobState::Dispatched {
                    attempt,
                    invoker: invoker.id().clone(),
                },
            );
            self.shared.dispatched.fetch_add(1, Ordering::Relaxed);
            debug!(
                job_id = %job_id,
                attempt,
                invoker = %invoker.id(),
                items = job.len(),
                "Job dispatched"
            );
            return true;
        }
        false
    }

    fn start_timer(&self, job_id: JobId, attempt: u32) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let timeout = self.config.response_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Timeout { job_id, attempt });
            }
        })
    }

    fn on_completed(&mut self, job_id: JobId, attempt: u32, result: CalculationJobResult) {
        self.release(job_id, attempt);
        let Some(record) = self.jobs.remove(&job_id) else {
            debug!(job_id = %job_id, attempt, "Ignoring result for finished job");
            return;
        };
        if attempt != record.attempt || !record.awaiting {
            debug!(job_id = %job_id, attempt, current = record.attempt, "Accepting late result");
        }
        if let Some(timer) = record.timer {
            timer.abort();
        }
        self.release_all(job_id);
        self.queue.retain(|&id| id != job_id);
        self.update_queued();

        self.shared.states.insert(job_id, JobState::Completed);
        self.shared.completed.fetch_add(1, Ordering::Relaxed);
        debug!(
            job_id = %job_id,
            attempt,
            items = result.items.len(),
            duration_nanos = result.duration_nanos,
            "Job completed"
        );
        record.receiver.job_completed(result);
        self.drain_queue();
    }

    fn on_failed(&mut self, job_id: JobId, attempt: u32, invoker: InvokerId, failure: JobFailure) {
        self.release(job_id, attempt);
        let Some(record) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if attempt != record.attempt || !record.awaiting {
            debug!(job_id = %job_id, attempt, "Ignoring stale failure");
            return;
        }

        warn!(
            job_id = %job_id,
            attempt,
            invoker = %invoker,
            error = %failure,
            "Job attempt failed"
        );
        record.awaiting = false;
        record.tried.insert(invoker);
        record.last_failure = Some(failure);
        if let Some(timer) = record.timer.take() {
            timer.abort();
        }
        self.shared
            .states
            .insert(job_id, JobState::Failed { attempt });
        self.redispatch(job_id);
        self.drain_queue();
    }

    fn on_timeout(&mut self, job_id: JobId, attempt: u32) {
        let Some(record) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if attempt != record.attempt || !record.awaiting {
            return;
        }

        let invoker = record
            .last_invoker
            .clone()
            .unwrap_or_else(|| InvokerId::new(DISPATCHER_ID));
        warn!(
            job_id = %job_id,
            attempt,
            invoker = %invoker,
            timeout_ms = self.config.response_timeout_ms,
            "Job timed out, invoker suspected dead"
        );
        record.awaiting = false;
        record.timer = None;
        record.tried.insert(invoker.clone());
        record.last_failure = Some(JobFailure::InvokerSuspectedDead {
            invoker,
            timeout_ms: self.config.response_timeout_ms,
        });
        self.release(job_id, attempt);
        self.shared
            .states
            .insert(job_id, JobState::TimedOut { attempt });
        self.redispatch(job_id);
        self.drain_queue();
    }

    fn redispatch(&mut self, job_id: JobId) {
        let Some(record) = self.jobs.get(&job_id) else {
            return;
        };

        if record.attempt >= self.config.max_attempts {
            let attempts = record.attempt;
            let last = record
                .last_failure
                .clone()
                .unwrap_or(JobFailure::DispatcherShutdown);
            warn!(job_id = %job_id, attempts, "Retry attempts exhausted, aborting job");
            self.finish_aborted(
                job_id,
                JobFailure::RetryExhausted {
                    attempts,
                    last: Box::new(last),
                },
            );
            return;
        }

        self.shared.retried.fetch_add(1, Ordering::Relaxed);
        if !self.try_place(job_id) {
            debug!(job_id = %job_id, "Retry waiting for capacity");
            self.queue.push_front(job_id);
            self.update_queued();
        }
    }

    fn finish_aborted(&mut self, job_id: JobId, failure: JobFailure) {
        let Some(record) = self.jobs.remove(&job_id) else {
            return;
        };
        if let Some(timer) = record.timer {
            timer.abort();
        }
        self.release_all(job_id);
        self.queue.retain(|&id| id != job_id);
        self.update_queued();

        self.shared.states.insert(job_id, JobState::Aborted);
        self.shared.aborted.fetch_add(1, Ordering::Relaxed);
        let invoker = failure
            .invoker()
            .cloned()
            .or(record.last_invoker)
            .unwrap_or_else(|| InvokerId::new(DISPATCHER_ID));
        record.receiver.job_failed(&invoker, job_id, failure);
    }

    fn drain_queue(&mut self) {
        while let Some(&job_id) = self.queue.front() {
            if !self.jobs.contains_key(&job_id) {
                self.queue.pop_front();
                continue;
            }
            if !self.try_place(job_id) {
                break;
            }
            self.queue.pop_front();
        }
        self.update_queued();
    }

    fn release(&mut self, job_id: JobId, attempt: u32) {
        if let Some(idx) = self.outstanding.remove(&(job_id, attempt)) {
            if let Some(slot) = self.invokers.get_mut(idx) {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
        }
    }

    fn release_all(&mut self, job_id: JobId) {
        let attempts: Vec<u32> = self
            .outstanding
            .keys()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, attempt)| *attempt)
            .collect();
        for attempt in attempts {
            self.release(job_id, attempt);
        }
    }

    fn update_queued(&self) {
        self.shared.queued.store(self.queue.len(), Ordering::Relaxed);
    }

    fn abort_all(&mut self) {
        let pending: Vec<JobId> = self.jobs.keys().copied().collect();
        if !pending.is_empty() {
            warn!(jobs = pending.len(), "Aborting pending jobs on shutdown");
        }
        for job_id in pending {
            self.finish_aborted(job_id, JobFailure::DispatcherShutdown);
        }
    }
}
