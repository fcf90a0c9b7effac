//! Simulated generation engine and synthetic load.
//!
//! The engine sleeps once per denoising step and checks its cancel token
//! between steps, so deadlines and cancellation behave like a real device.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use synthgrid_core::GenerationParams;
use synthgrid_scheduler::{
    CancelToken, EngineError, GenerationEngine, Scheduler, SchedulerError, SchedulerStats,
    Submission,
};

const IMAGE_MAGIC: &[u8; 4] = b"SIMG";

/// Engine that takes `step_delay` per denoising step.
pub struct SimulatedEngine {
    step_delay: Duration,
    /// Every Nth call fails halfway with a transient error.
    fail_every: Option<u64>,
    calls: AtomicU64,
}

impl SimulatedEngine {
    pub fn new(step_delay: Duration, fail_every: Option<u64>) -> Self {
        Self {
            step_delay,
            fail_every: fail_every.filter(|n| *n > 0),
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl GenerationEngine for SimulatedEngine {
    fn generate(
        &self,
        params: &GenerationParams,
        cancel: CancelToken,
        _deadline: Instant,
    ) -> impl Future<Output = Result<Bytes, EngineError>> + Send {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let inject_failure = self.fail_every.is_some_and(|n| call % n == 0);
        let steps = params.effective_steps();
        let step_delay = self.step_delay;
        let header = (params.width, params.height, params.seed.unwrap_or(call));

        async move {
            for step in 0..steps {
                if cancel.is_cancelled() {
                    debug!(call, step, "simulated engine observed cancellation");
                    return Err(EngineError::Cancelled);
                }
                tokio::time::sleep(step_delay).await;
                if inject_failure && step == steps / 2 {
                    return Err(EngineError::ResourceExhausted(format!(
                        "simulated allocation failure at step {step}"
                    )));
                }
            }
            let (width, height, seed) = header;
            Ok(render(width, height, seed))
        }
    }
}

/// Placeholder image: magic, dimensions and seed.
fn render(width: u32, height: u32, seed: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_slice(IMAGE_MAGIC);
    buf.put_u32_le(width);
    buf.put_u32_le(height);
    buf.put_u64_le(seed);
    buf.freeze()
}

// ── Synthetic load ─────────────────────────────────────────────

/// Shape of a simulation run.
#[derive(Debug, Clone, Copy)]
pub struct Load {
    pub clients: usize,
    pub requests_per_client: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Outcome code (or immediate rejection code) to count.
    pub outcomes: BTreeMap<String, usize>,
    pub elapsed_ms: u64,
    pub stats: SchedulerStats,
}

/// Request mix cycled through by every client.
fn request_mix(client: usize, index: usize) -> GenerationParams {
    let prompt = format!("client-{client} request-{index}");
    let params = match (client + index) % 4 {
        0 => GenerationParams::text_to_image(prompt, 512, 512, 20),
        1 => GenerationParams::text_to_image(prompt, 768, 768, 30),
        2 => GenerationParams::text_to_image(prompt, 1024, 1024, 50),
        _ => GenerationParams::image_to_image(prompt, 1024, 1024, 40, 0.5),
    };
    params.with_seed((client * 1000 + index) as u64)
}

/// Fire the load from `clients` concurrent clients and wait for every
/// outcome.
pub async fn run<E: GenerationEngine>(scheduler: &Scheduler<E>, load: Load) -> Report {
    let started = Instant::now();
    let mut clients = Vec::with_capacity(load.clients);

    for client in 0..load.clients {
        let scheduler = scheduler.clone();
        clients.push(tokio::spawn(async move {
            let key = format!("client-{client}");
            let mut codes = Vec::with_capacity(load.requests_per_client);
            let mut handles = Vec::new();

            for index in 0..load.requests_per_client {
                let submission = Submission::new(key.clone(), request_mix(client, index));
                match scheduler.submit(submission) {
                    Ok(handle) => handles.push(handle),
                    Err(SchedulerError::Rejected { kind, .. }) => {
                        codes.push(kind.code().to_string());
                    }
                    Err(e) => codes.push(e.to_string()),
                }
            }

            for handle in handles {
                let code = match handle.wait().await {
                    Ok(outcome) => outcome.code().to_string(),
                    Err(e) => e.to_string(),
                };
                codes.push(code);
            }
            codes
        }));
    }

    let mut outcomes = BTreeMap::new();
    for client in clients {
        let codes = match client.await {
            Ok(codes) => codes,
            Err(e) => vec![format!("client task failed: {e}")],
        };
        for code in codes {
            *outcomes.entry(code).or_insert(0) += 1;
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(elapsed_ms, "simulation finished");
    Report {
        outcomes,
        elapsed_ms,
        stats: scheduler.stats(),
    }
}

#[cfg(test)]
mod tests {
    use synthgrid_core::{ErrorKind, SchedulerConfig};

    use super::*;

    fn params(steps: u32) -> GenerationParams {
        GenerationParams::text_to_image("a lighthouse", 512, 512, steps).with_seed(7)
    }

    #[tokio::test(start_paused = true)]
    async fn takes_one_delay_per_step() {
        let engine = SimulatedEngine::new(Duration::from_millis(10), None);
        let started = Instant::now();

        let image = engine
            .generate(&params(20), CancelToken::new(), Instant::now())
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(200));
        assert_eq!(&image[..4], IMAGE_MAGIC);
        assert_eq!(image.len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_between_steps_when_cancelled() {
        let engine = SimulatedEngine::new(Duration::from_millis(10), None);
        let cancel = CancelToken::new();

        let p = params(100);
        let generation = engine.generate(&p, cancel.clone(), Instant::now());
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(35)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(generation, canceller);
        assert_eq!(result, Err(EngineError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn injects_transient_failures() {
        let engine = SimulatedEngine::new(Duration::from_millis(1), Some(2));

        let first = engine
            .generate(&params(4), CancelToken::new(), Instant::now())
            .await;
        let second = engine
            .generate(&params(4), CancelToken::new(), Instant::now())
            .await;
        assert!(first.is_ok());
        assert_eq!(
            second.unwrap_err().classify(),
            ErrorKind::EngineTransientFailure
        );
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn load_run_accounts_for_every_request() {
        let mut config = SchedulerConfig::default();
        config.scheduler.queue_capacity = 64;
        let engine = SimulatedEngine::new(Duration::from_millis(5), None);
        let scheduler = Scheduler::new(config, engine).unwrap();

        let report = run(
            &scheduler,
            Load {
                clients: 3,
                requests_per_client: 4,
            },
        )
        .await;

        assert_eq!(report.outcomes.values().sum::<usize>(), 12);
        assert_eq!(report.outcomes.get("SUCCEEDED"), Some(&12));
        assert_eq!(report.stats.allocated, 0);
        assert_eq!(report.stats.counters.submitted, 12);
    }
}
