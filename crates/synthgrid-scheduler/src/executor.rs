//! Executor — runs admitted requests on a fixed pool of engine slots.
//!
//! A request goes through two phases:
//!
//! 1. [`Executor::acquire`] waits for one of the `K` pool slots. Admission
//!    already reserved budget, so this wait is bounded by in-flight
//!    completions. Cancellation and the execution deadline are honoured
//!    while waiting.
//! 2. [`Executor::execute`] calls the engine with the request's cancel token.
//!    If the deadline passes or the caller cancels, the token is set and
//!    `on_stop` fires right away so the outcome reaches the caller, but the
//!    slot is held until the engine call actually returns.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use synthgrid_core::{ErrorKind, GenerationParams, Outcome, RequestId};

use crate::cancel::CancelToken;
use crate::engine::{EngineError, GenerationEngine};

/// Everything the executor needs to run one attempt.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: RequestId,
    pub params: Arc<GenerationParams>,
    /// Execution deadline, counted from admission.
    pub deadline: Instant,
    pub cancel: CancelToken,
}

/// Why an execution stopped before the engine produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    DeadlineExceeded,
}

impl StopReason {
    pub fn outcome(&self) -> Outcome {
        match self {
            StopReason::Cancelled => Outcome::Cancelled,
            StopReason::DeadlineExceeded => Outcome::TimedOut(ErrorKind::ExecutionTimeout),
        }
    }
}

/// Classified result of an execution, available once the slot is free.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Succeeded(Bytes),
    /// `EngineTransientFailure` or `EngineFatalFailure`.
    Failed(ErrorKind),
    /// Stopped by cancellation or deadline; `on_stop` already ran.
    Stopped(StopReason),
}

pub struct Executor<E> {
    engine: Arc<E>,
    slots: Arc<Semaphore>,
    pool_size: usize,
}

impl<E: GenerationEngine> Executor<E> {
    pub fn new(engine: Arc<E>, pool_size: usize) -> Self {
        Self {
            engine,
            slots: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Slots not currently running an engine call.
    pub fn idle_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a pool slot, giving up on cancellation or deadline.
    pub async fn acquire(&self, job: &Job) -> Result<OwnedSemaphorePermit, StopReason> {
        tokio::select! {
            biased;
            () = job.cancel.cancelled() => Err(StopReason::Cancelled),
            permit = self.slots.clone().acquire_owned() => {
                // The semaphore is never closed.
                permit.map_err(|_| StopReason::Cancelled)
            }
            () = tokio::time::sleep_until(job.deadline) => Err(StopReason::DeadlineExceeded),
        }
    }

    /// Run the engine call in an acquired slot.
    pub async fn execute<F>(&self, job: &Job, slot: OwnedSemaphorePermit, on_stop: F) -> Execution
    where
        F: FnOnce(StopReason),
    {
        let generation = self
            .engine
            .generate(&job.params, job.cancel.clone(), job.deadline);
        tokio::pin!(generation);

        // An answer that is already in wins over a stop raised alongside it.
        let stop = tokio::select! {
            biased;
            result = &mut generation => {
                drop(slot);
                return match result {
                    Ok(image) => Execution::Succeeded(image),
                    Err(EngineError::Cancelled) if job.cancel.is_cancelled() => {
                        on_stop(StopReason::Cancelled);
                        Execution::Stopped(StopReason::Cancelled)
                    }
                    Err(EngineError::Cancelled) => {
                        warn!(request_id = %job.id, "engine reported cancellation nobody requested");
                        Execution::Failed(ErrorKind::EngineFatalFailure)
                    }
                    Err(e) => {
                        let kind = e.classify();
                        warn!(request_id = %job.id, error = %e, kind = %kind, "engine call failed");
                        Execution::Failed(kind)
                    }
                };
            }
            () = job.cancel.cancelled() => StopReason::Cancelled,
            () = tokio::time::sleep_until(job.deadline) => StopReason::DeadlineExceeded,
        };

        job.cancel.cancel();
        on_stop(stop);
        debug!(request_id = %job.id, reason = ?stop, "waiting for engine to observe cancellation");

        let late = generation.await;
        debug!(
            request_id = %job.id,
            discarded_ok = late.is_ok(),
            "engine call returned after stop"
        );
        drop(slot);
        Execution::Stopped(stop)
    }
}
