//! Scheduler error types.

use std::time::Duration;

use thiserror::Error;

use synthgrid_core::{ConfigError, ErrorKind};

/// Errors returned synchronously by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Immediate rejection at submission: nothing was queued or reserved.
    #[error("request rejected: {kind}")]
    Rejected {
        kind: ErrorKind,
        /// When the client may try again, if known.
        retry_after: Option<Duration>,
    },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The scheduler spawns executor tasks and must be built on a runtime.
    #[error("scheduler must be created inside a Tokio runtime")]
    NoRuntime,
}

impl SchedulerError {
    pub fn rejected(kind: ErrorKind) -> Self {
        SchedulerError::Rejected {
            kind,
            retry_after: None,
        }
    }

    /// Error kind of an immediate rejection.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SchedulerError::Rejected { kind, .. } => Some(*kind),
            SchedulerError::Config(_) | SchedulerError::NoRuntime => None,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Why awaiting a handle ended without an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AwaitError {
    /// The caller's context finished first; cancellation was requested.
    #[error("caller stopped waiting before the request finished")]
    CallerGone,
    /// The scheduler was dropped before delivering an outcome.
    #[error("scheduler dropped before delivering an outcome")]
    Abandoned,
}
