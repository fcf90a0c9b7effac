//! Scheduler — admission control and request lifecycle.
//!
//! The `Scheduler` is the composition root that:
//! - Rate-limits each client before anything else happens
//! - Costs the request and reserves budget, or parks it in the wait queue
//! - Hands admitted requests to the executor on their own task
//! - Re-admits the queue head whenever budget is released (cascading admission)
//! - Evicts queued requests whose queue deadline passed
//! - Delivers exactly one terminal outcome per request
//!
//! The budget, the wait queue and the request table live behind a single
//! mutex. Nothing blocks while it is held; all waiting happens on handles
//! or inside executor tasks.
//!
//! Executor tasks are spawned on the runtime the scheduler was created in,
//! so `cancel` and `reap` may be called from any thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use synthgrid_core::config::SchedulingConfig;
use synthgrid_core::{
    ErrorKind, GenerationParams, Outcome, RequestId, RequestState, SchedulerConfig,
};

use crate::budget::ResourceBudget;
use crate::cancel::CancelToken;
use crate::cost::CostEstimator;
use crate::dispatcher::{Canceller, Completion, Handle};
use crate::engine::GenerationEngine;
use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::{Execution, Executor, Job, StopReason};
use crate::queue::WaitQueue;
use crate::rate_limiter::{Decision, Quota, RateLimiter};

/// A request as handed over by the serving layer.
#[derive(Debug, Clone)]
pub struct Submission {
    pub client_key: String,
    pub params: GenerationParams,
    /// Overrides the configured queue timeout.
    pub queue_timeout: Option<Duration>,
    /// Overrides the configured execution timeout.
    pub execution_timeout: Option<Duration>,
}

impl Submission {
    pub fn new(client_key: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            client_key: client_key.into(),
            params,
            queue_timeout: None,
            execution_timeout: None,
        }
    }

    pub fn with_queue_timeout(self, timeout: Duration) -> Self {
        Self {
            queue_timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_execution_timeout(self, timeout: Duration) -> Self {
        Self {
            execution_timeout: Some(timeout),
            ..self
        }
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub submitted: u64,
    pub admitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub rejected_rate_limited: u64,
    pub rejected_overloaded: u64,
    pub rejected_invalid: u64,
    pub rejected_shutdown: u64,
    pub retries: u64,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub capacity: u32,
    pub allocated: u32,
    pub queued: usize,
    pub queue_capacity: usize,
    /// Admitted or running, outcome not yet delivered.
    pub running: usize,
    /// Outcome delivered, engine call still returning; budget still held.
    pub draining: usize,
    pub pool_size: usize,
    pub idle_slots: usize,
    pub tracked_clients: usize,
    pub counters: Counters,
}

/// Per-request bookkeeping, owned by the scheduler until delivery.
struct Tracked {
    client_key: String,
    params: Arc<GenerationParams>,
    cost: u32,
    state: RequestState,
    attempt: u32,
    queue_timeout: Duration,
    execution_timeout: Duration,
    cancel: CancelToken,
    completion: Completion,
    holds_budget: bool,
}

impl Tracked {
    fn transition(&mut self, id: RequestId, next: RequestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "{id}: illegal transition {} -> {next}",
            self.state
        );
        self.state = next;
    }
}

struct Core {
    budget: ResourceBudget,
    queue: WaitQueue,
    requests: HashMap<RequestId, Tracked>,
    counters: Counters,
    accepting: bool,
}

struct Shared<E> {
    settings: SchedulingConfig,
    limiter: RateLimiter,
    estimator: CostEstimator,
    executor: Executor<E>,
    runtime: runtime::Handle,
    core: Mutex<Core>,
    next_id: AtomicU64,
    this: Weak<Shared<E>>,
}

/// Admission-controlled scheduler for a generation engine.
pub struct Scheduler<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for Scheduler<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E: GenerationEngine> Scheduler<E> {
    /// Create a scheduler. Fails if the config is invalid, if the largest
    /// allowed request would not fit in the budget, or if called outside a
    /// Tokio runtime.
    pub fn new(config: SchedulerConfig, engine: E) -> SchedulerResult<Self> {
        Self::with_engine(config, Arc::new(engine))
    }

    pub fn with_engine(config: SchedulerConfig, engine: Arc<E>) -> SchedulerResult<Self> {
        config.validate()?;
        let settings = config.scheduler;
        let estimator = CostEstimator::new(config.cost, settings.budget_capacity)?;
        let runtime = runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let shared = Arc::new_cyclic(|this| Shared {
            limiter: RateLimiter::new(&config.rate_limit),
            estimator,
            executor: Executor::new(engine, settings.pool_size),
            runtime,
            core: Mutex::new(Core {
                budget: ResourceBudget::new(settings.budget_capacity),
                queue: WaitQueue::new(settings.queue_capacity),
                requests: HashMap::new(),
                counters: Counters::default(),
                accepting: true,
            }),
            next_id: AtomicU64::new(1),
            this: this.clone(),
            settings,
        });

        info!(
            capacity = shared.settings.budget_capacity,
            queue_capacity = shared.settings.queue_capacity,
            pool_size = shared.settings.pool_size,
            worst_case_cost = shared.estimator.worst_case(),
            "scheduler initialized"
        );
        Ok(Self { shared })
    }

    /// Submit a request.
    ///
    /// Rate-limited, oversized, overloaded and post-shutdown submissions are
    /// rejected immediately with [`SchedulerError::Rejected`] and never
    /// touch the budget or the queue.
    pub fn submit(&self, submission: Submission) -> SchedulerResult<Handle> {
        self.shared.submit(submission)
    }

    /// Cancel a request. Idempotent: returns `true` only if the request was
    /// still live, and later calls leave the outcome unchanged.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.shared.cancel(id)
    }

    /// Current state of a live request. `None` once its outcome has been
    /// delivered and its budget released.
    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        self.shared.lock().requests.get(&id).map(|t| t.state)
    }

    /// Evict expired queue entries and admit whatever now fits. Returns the
    /// number of requests evicted.
    pub fn reap(&self) -> usize {
        let shared = &self.shared;
        let mut core = shared.lock();
        let evicted = shared.evict_expired(&mut core, Instant::now());
        shared.admit_waiting(&mut core);
        evicted
    }

    /// Run the queue reaper until shutdown. It wakes at the earliest queue
    /// deadline, or after `reaper_interval` if that comes first.
    pub async fn run_reaper(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.shared.settings.reaper_interval;
        info!(interval_ms = interval.as_millis() as u64, "queue reaper started");

        loop {
            let wake = self.shared.next_wake(interval);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {
                    let evicted = self.reap();
                    if evicted > 0 {
                        debug!(evicted, "reaper evicted expired requests");
                    }
                }
                _ = shutdown.changed() => {
                    info!("queue reaper stopping");
                    break;
                }
            }
        }
    }

    /// Stop accepting work: queued requests are rejected with
    /// `ShuttingDown` and running requests are cancelled.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let mut core = shared.lock();
        core.accepting = false;

        let queued = core.queue.drain();
        for entry in &queued {
            shared.finish(&mut core, entry.id, Outcome::Rejected(ErrorKind::ShuttingDown));
        }

        let mut running = 0;
        for tracked in core.requests.values() {
            if !tracked.state.is_terminal() && tracked.cancel.cancel() {
                running += 1;
            }
        }
        info!(queued = queued.len(), running, "scheduler shutting down");
    }

    pub fn stats(&self) -> SchedulerStats {
        let shared = &self.shared;
        let core = shared.lock();
        let running = core
            .requests
            .values()
            .filter(|t| matches!(t.state, RequestState::Admitted | RequestState::Running))
            .count();
        let draining = core
            .requests
            .values()
            .filter(|t| t.state.is_terminal() && t.holds_budget)
            .count();

        SchedulerStats {
            capacity: core.budget.capacity(),
            allocated: core.budget.allocated(),
            queued: core.queue.len(),
            queue_capacity: core.queue.capacity(),
            running,
            draining,
            pool_size: shared.executor.pool_size(),
            idle_slots: shared.executor.idle_slots(),
            tracked_clients: shared.limiter.tracked_clients(),
            counters: core.counters.clone(),
        }
    }

    /// Remaining rate-limit allowance for a client, or `None` when rate
    /// limiting is disabled.
    pub fn quota(&self, client_key: &str) -> Option<Quota> {
        self.shared.limiter.quota(client_key)
    }

    pub fn estimator(&self) -> &CostEstimator {
        &self.shared.estimator
    }
}

impl<E: GenerationEngine> Shared<E> {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// When the reaper should next run.
    fn next_wake(&self, interval: Duration) -> Instant {
        let tick = deadline_after(Instant::now(), interval);
        match self.lock().queue.next_deadline() {
            Some(deadline) => deadline.min(tick),
            None => tick,
        }
    }

    fn submit(&self, submission: Submission) -> SchedulerResult<Handle> {
        let Submission {
            client_key,
            params,
            queue_timeout,
            execution_timeout,
        } = submission;
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut core = self.lock();
            core.counters.submitted += 1;
            if !core.accepting {
                core.counters.rejected_shutdown += 1;
                return Err(SchedulerError::rejected(ErrorKind::ShuttingDown));
            }
        }

        if let Decision::Deny { retry_after } = self.limiter.check(&client_key) {
            self.lock().counters.rejected_rate_limited += 1;
            warn!(request_id = %id, client = %client_key, "rejected: rate limit exceeded");
            return Err(SchedulerError::Rejected {
                kind: ErrorKind::RateLimitExceeded,
                retry_after: Some(retry_after),
            });
        }

        let cost = match self.estimator.cost(&params) {
            Ok(cost) => cost,
            Err(e) => {
                self.lock().counters.rejected_invalid += 1;
                warn!(request_id = %id, client = %client_key, error = %e, "rejected: invalid parameters");
                return Err(SchedulerError::rejected(ErrorKind::InvalidParameters));
            }
        };

        let (completion, rx) = Completion::new();
        let tracked = Tracked {
            client_key,
            params: Arc::new(params),
            cost,
            state: RequestState::Queued,
            attempt: 0,
            queue_timeout: queue_timeout.unwrap_or(self.settings.queue_timeout),
            execution_timeout: execution_timeout.unwrap_or(self.settings.execution_timeout),
            cancel: CancelToken::new(),
            completion,
            holds_budget: false,
        };

        let mut core = self.lock();
        if !core.accepting {
            core.counters.rejected_shutdown += 1;
            return Err(SchedulerError::rejected(ErrorKind::ShuttingDown));
        }
        self.evict_expired(&mut core, Instant::now());
        if let Err(tracked) = self.enter(&mut core, id, tracked) {
            core.counters.rejected_overloaded += 1;
            warn!(
                request_id = %id,
                client = %tracked.client_key,
                queued = core.queue.len(),
                "rejected: wait queue full"
            );
            return Err(SchedulerError::rejected(ErrorKind::Overloaded));
        }
        drop(core);

        let canceller: Weak<dyn Canceller> = self.this.clone();
        Ok(Handle::new(id, rx, canceller))
    }

    /// Admit directly if nothing is waiting and the budget allows, else
    /// enqueue. A full queue hands the request back untouched.
    fn enter(&self, core: &mut Core, id: RequestId, mut tracked: Tracked) -> Result<(), Tracked> {
        let now = Instant::now();
        let cost = tracked.cost;
        let queue_deadline = deadline_after(now, tracked.queue_timeout);

        // Direct admission never overtakes entries that are already waiting.
        if core.queue.is_empty() && core.budget.try_reserve(cost) {
            tracked.state = RequestState::Queued;
            core.requests.insert(id, tracked);
            self.admit(core, id);
            return Ok(());
        }

        match core.queue.enqueue(id, cost, now, queue_deadline) {
            Ok(seq) => {
                debug!(
                    request_id = %id,
                    client = %tracked.client_key,
                    cost,
                    seq,
                    queued = core.queue.len(),
                    allocated = core.budget.allocated(),
                    "request queued"
                );
                tracked.state = RequestState::Queued;
                core.requests.insert(id, tracked);
                Ok(())
            }
            Err(_) => Err(tracked),
        }
    }

    /// Move a reserved request to `Admitted` and start its executor task.
    fn admit(&self, core: &mut Core, id: RequestId) {
        let Some(tracked) = core.requests.get_mut(&id) else {
            return;
        };
        tracked.transition(id, RequestState::Admitted);
        tracked.holds_budget = true;

        let job = Job {
            id,
            params: tracked.params.clone(),
            deadline: deadline_after(Instant::now(), tracked.execution_timeout),
            cancel: tracked.cancel.clone(),
        };
        core.counters.admitted += 1;
        debug!(
            request_id = %id,
            cost = tracked.cost,
            attempt = tracked.attempt,
            allocated = core.budget.allocated(),
            "request admitted"
        );

        if let Some(shared) = self.this.upgrade() {
            self.runtime.spawn(drive(shared, job));
        }
    }

    /// Cascading admission: admit queue heads in strict FIFO order while
    /// they fit. Stops at the first head that does not fit.
    fn admit_waiting(&self, core: &mut Core) {
        if !core.accepting {
            return;
        }
        self.evict_expired(core, Instant::now());
        while let Some(&head) = core.queue.peek_head() {
            if !core.budget.try_reserve(head.cost) {
                break;
            }
            core.queue.pop_head();
            self.admit(core, head.id);
        }
    }

    fn evict_expired(&self, core: &mut Core, now: Instant) -> usize {
        let expired = core.queue.evict_expired(now);
        for entry in &expired {
            info!(
                request_id = %entry.id,
                waited_ms = now.saturating_duration_since(entry.enqueued_at).as_millis() as u64,
                "queue timeout"
            );
            self.finish(core, entry.id, Outcome::TimedOut(ErrorKind::QueueTimeout));
        }
        expired.len()
    }

    /// Record a terminal outcome and deliver it. The entry is dropped once
    /// it no longer holds budget.
    fn finish(&self, core: &mut Core, id: RequestId, outcome: Outcome) {
        let Some(tracked) = core.requests.get_mut(&id) else {
            return;
        };
        if tracked.state.is_terminal() {
            return;
        }

        let counters = &mut core.counters;
        match &outcome {
            Outcome::Succeeded(_) => counters.succeeded += 1,
            Outcome::Failed(_) => counters.failed += 1,
            Outcome::TimedOut(_) => counters.timed_out += 1,
            Outcome::Cancelled => counters.cancelled += 1,
            Outcome::Rejected(ErrorKind::ShuttingDown) => counters.rejected_shutdown += 1,
            Outcome::Rejected(_) => counters.rejected_overloaded += 1,
        }

        tracked.transition(id, outcome.state());
        debug!(request_id = %id, outcome = outcome.code(), "request finished");
        tracked.completion.deliver(outcome);

        if !tracked.holds_budget {
            core.requests.remove(&id);
        }
    }

    fn mark_running(&self, id: RequestId) {
        let mut core = self.lock();
        if let Some(tracked) = core.requests.get_mut(&id) {
            if tracked.state == RequestState::Admitted {
                tracked.transition(id, RequestState::Running);
            }
        }
    }

    /// Executor stopped a request; report now, release later.
    fn report_stop(&self, id: RequestId, stop: StopReason) {
        let mut core = self.lock();
        if stop == StopReason::DeadlineExceeded {
            warn!(request_id = %id, "execution timeout");
        }
        self.finish(&mut core, id, stop.outcome());
    }

    /// The engine call (or slot wait) is over: settle the outcome, release
    /// budget, then run cascading admission.
    fn complete(&self, id: RequestId, execution: Execution) {
        let mut core = self.lock();
        let Some(tracked) = core.requests.get_mut(&id) else {
            return;
        };
        let cost = tracked.cost;
        tracked.holds_budget = false;
        core.budget.release(cost);

        match execution {
            Execution::Succeeded(image) => {
                info!(request_id = %id, bytes = image.len(), "generation succeeded");
                self.finish(&mut core, id, Outcome::Succeeded(image));
            }
            Execution::Failed(ErrorKind::EngineTransientFailure) if self.retry(&mut core, id) => {}
            Execution::Failed(kind) => {
                self.finish(&mut core, id, Outcome::Failed(kind));
            }
            Execution::Stopped(stop) => {
                // Usually already reported by `report_stop`.
                self.finish(&mut core, id, stop.outcome());
            }
        }

        if core
            .requests
            .get(&id)
            .is_some_and(|t| t.state.is_terminal() && !t.holds_budget)
        {
            core.requests.remove(&id);
        }

        self.admit_waiting(&mut core);
    }

    /// Re-enter a transiently failed request as a fresh submission: rate
    /// limited again, then admitted directly or queued. Returns `false` if
    /// the failure should surface instead.
    fn retry(&self, core: &mut Core, id: RequestId) -> bool {
        let Some(mut tracked) = core.requests.remove(&id) else {
            return false;
        };

        let allowed = core.accepting
            && tracked.attempt < self.settings.transient_retries
            && !tracked.cancel.is_cancelled()
            && self.limiter.check(&tracked.client_key).is_allowed();
        if !allowed {
            core.requests.insert(id, tracked);
            return false;
        }

        // A retry is a new attempt with its own lifecycle, starting at Queued.
        tracked.attempt += 1;
        let attempt = tracked.attempt;
        match self.enter(core, id, tracked) {
            Ok(()) => {
                core.counters.retries += 1;
                info!(request_id = %id, attempt, "transient engine failure, request resubmitted");
                true
            }
            Err(mut tracked) => {
                warn!(request_id = %id, "wait queue full, transient failure not retried");
                tracked.attempt -= 1;
                core.requests.insert(id, tracked);
                false
            }
        }
    }

    fn cancel(&self, id: RequestId) -> bool {
        let mut core = self.lock();
        let Some(tracked) = core.requests.get(&id) else {
            return false;
        };
        let state = tracked.state;
        let token = tracked.cancel.clone();

        match state {
            RequestState::Queued => {
                core.queue.remove(id);
                info!(request_id = %id, "queued request cancelled");
                self.finish(&mut core, id, Outcome::Cancelled);
                // The removed entry may have been the head blocking others.
                self.admit_waiting(&mut core);
                true
            }
            RequestState::Admitted | RequestState::Running => {
                if token.cancel() {
                    info!(request_id = %id, "cancellation requested");
                }
                true
            }
            _ => false,
        }
    }
}

impl<E: GenerationEngine> Canceller for Shared<E> {
    fn cancel_request(&self, id: RequestId) -> bool {
        self.cancel(id)
    }
}

/// Far enough ahead to never fire; stands in for deadlines that overflow.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, clamped for timeouts too large to represent.
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Executor task for one admitted attempt.
async fn drive<E: GenerationEngine>(shared: Arc<Shared<E>>, job: Job) {
    let id = job.id;
    let slot = match shared.executor.acquire(&job).await {
        Ok(slot) => slot,
        Err(stop) => {
            shared.report_stop(id, stop);
            shared.complete(id, Execution::Stopped(stop));
            return;
        }
    };

    shared.mark_running(id);
    let reporter = shared.clone();
    let execution = shared
        .executor
        .execute(&job, slot, move |stop| reporter.report_stop(id, stop))
        .await;
    shared.complete(id, execution);
}
