//! synthgrid-scheduler — admission control for image generation engines.
//!
//! Sits between a serving layer and a generation engine that can run only
//! a bounded amount of work at once. The scheduler:
//!
//! - Rate-limits each client with a token bucket
//! - Costs each request and admits it only if the budget allows
//! - Parks the rest in a bounded FIFO queue with a wait deadline
//! - Runs admitted requests on a fixed pool of engine slots
//! - Cancels on deadline or caller request, and delivers exactly one outcome
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── RateLimiter (per-client token buckets)
//!   ├── CostEstimator (params -> cost units, bounds check)
//!   ├── Mutex<Core>
//!   │     ├── ResourceBudget (allocated <= capacity)
//!   │     ├── WaitQueue (strict FIFO, per-entry deadline)
//!   │     └── request table (state, cancel token, completion)
//!   └── Executor (K engine slots, one task per admitted request)
//!         └── GenerationEngine
//! ```

pub mod budget;
pub mod cancel;
pub mod cost;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod queue;
pub mod rate_limiter;
pub mod scheduler;

pub use budget::ResourceBudget;
pub use cancel::CancelToken;
pub use cost::{CostEstimator, OutOfBounds};
pub use dispatcher::Handle;
pub use engine::{EngineError, GenerationEngine};
pub use error::{AwaitError, SchedulerError, SchedulerResult};
pub use executor::{Execution, Executor, Job, StopReason};
pub use queue::{QueueEntry, QueueFull, WaitQueue};
pub use rate_limiter::{Decision, Quota, RateLimiter};
pub use scheduler::{Counters, Scheduler, SchedulerStats, Submission};
