//! Shared helpers for scheduler integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use synthgrid_core::config::{CostConfig, RateLimitConfig, SchedulingConfig};
use synthgrid_core::{GenerationParams, SchedulerConfig};
use synthgrid_scheduler::{CancelToken, EngineError, GenerationEngine};

/// Config where a request's cost equals its width: one unit per pixel-step,
/// heights and steps fixed at 1, widths bounded by the budget capacity.
pub fn unit_config(capacity: u32, queue_capacity: usize, pool_size: usize) -> SchedulerConfig {
    SchedulerConfig {
        scheduler: SchedulingConfig {
            budget_capacity: capacity,
            queue_capacity,
            pool_size,
            ..SchedulingConfig::default()
        },
        rate_limit: RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        },
        cost: CostConfig {
            pixel_steps_per_unit: 1,
            min_units: 1,
            max_width: capacity,
            max_height: 1,
            max_steps: 1,
        },
    }
}

/// A request costing exactly `units` under [`unit_config`].
pub fn costing(name: &str, units: u32) -> GenerationParams {
    GenerationParams::text_to_image(name, units, 1, 1)
}

/// One engine invocation, answered by the test.
pub struct Call {
    pub prompt: String,
    pub cancel: CancelToken,
    reply: oneshot::Sender<Result<Bytes, EngineError>>,
}

impl Call {
    pub fn succeed(self) {
        let image = Bytes::from(format!("image:{}", self.prompt));
        let _ = self.reply.send(Ok(image));
    }

    pub fn fail(self, error: EngineError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Engine whose every call is handed to the test to answer.
pub struct ScriptedEngine {
    calls: mpsc::UnboundedSender<Call>,
    honour_cancel: bool,
}

/// Receiving end of a [`ScriptedEngine`].
pub struct Calls {
    rx: mpsc::UnboundedReceiver<Call>,
}

impl Calls {
    /// Next engine call, failing the test if none arrives.
    pub async fn next(&mut self) -> Call {
        tokio::time::timeout(Duration::from_secs(3600), self.rx.recv())
            .await
            .expect("timed out waiting for an engine call")
            .expect("engine dropped")
    }

    /// Next call, asserting which request it belongs to.
    pub async fn expect(&mut self, prompt: &str) -> Call {
        let call = self.next().await;
        assert_eq!(call.prompt, prompt, "unexpected engine call order");
        call
    }

    /// Assert no call is pending right now.
    pub fn assert_none(&mut self) {
        if let Ok(call) = self.rx.try_recv() {
            panic!("unexpected engine call for {}", call.prompt);
        }
    }
}

impl ScriptedEngine {
    /// Engine that stops as soon as its cancel token is set.
    pub fn new() -> (Self, Calls) {
        Self::build(true)
    }

    /// Engine that ignores cancellation and runs until answered.
    pub fn stubborn() -> (Self, Calls) {
        Self::build(false)
    }

    fn build(honour_cancel: bool) -> (Self, Calls) {
        let (calls, rx) = mpsc::unbounded_channel();
        (
            Self {
                calls,
                honour_cancel,
            },
            Calls { rx },
        )
    }
}

impl GenerationEngine for ScriptedEngine {
    fn generate(
        &self,
        params: &GenerationParams,
        cancel: CancelToken,
        _deadline: Instant,
    ) -> impl Future<Output = Result<Bytes, EngineError>> + Send {
        let (reply, rx) = oneshot::channel();
        let _ = self.calls.send(Call {
            prompt: params.prompt.clone(),
            cancel: cancel.clone(),
            reply,
        });
        let honour_cancel = self.honour_cancel;

        async move {
            let answer = async {
                rx.await
                    .unwrap_or_else(|_| Err(EngineError::Unavailable("test dropped call".into())))
            };
            if honour_cancel {
                tokio::select! {
                    result = answer => result,
                    () = cancel.cancelled() => Err(EngineError::Cancelled),
                }
            } else {
                answer.await
            }
        }
    }
}

/// Engine that echoes the prompt back after yielding once.
pub struct EchoEngine;

impl GenerationEngine for EchoEngine {
    fn generate(
        &self,
        params: &GenerationParams,
        _cancel: CancelToken,
        _deadline: Instant,
    ) -> impl Future<Output = Result<Bytes, EngineError>> + Send {
        let image = Bytes::from(params.prompt.clone().into_bytes());
        async move {
            tokio::task::yield_now().await;
            Ok(image)
        }
    }
}

/// Yield until no request holds budget or runs.
pub async fn settle<E: GenerationEngine>(scheduler: &synthgrid_scheduler::Scheduler<E>) {
    for _ in 0..1000 {
        let stats = scheduler.stats();
        if stats.allocated == 0 && stats.running == 0 && stats.draining == 0 {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("scheduler did not settle: {:?}", scheduler.stats());
}
