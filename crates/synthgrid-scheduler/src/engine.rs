//! Generation engine boundary.
//!
//! The engine is an external collaborator: an opaque, costed, cancellable,
//! sometimes-failing operation. Implementations are expected to check the
//! [`CancelToken`] between iterative refinement steps and return
//! [`EngineError::Cancelled`] promptly once it is set.

use std::future::Future;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;

use synthgrid_core::{ErrorKind, GenerationParams};

use crate::cancel::CancelToken;

/// Failures reported by a generation engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Device memory or another engine resource ran out.
    #[error("engine resources exhausted: {0}")]
    ResourceExhausted(String),
    /// Engine temporarily unable to serve (model reloading, device busy).
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    /// The forward computation itself failed.
    #[error("inference failed: {0}")]
    Inference(String),
    /// The engine produced output that could not be used.
    #[error("malformed engine output: {0}")]
    MalformedOutput(String),
    /// The engine observed the cancellation token and stopped.
    #[error("generation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Map onto the scheduler's error taxonomy.
    pub fn classify(&self) -> ErrorKind {
        match self {
            EngineError::ResourceExhausted(_) | EngineError::Unavailable(_) => {
                ErrorKind::EngineTransientFailure
            }
            EngineError::Inference(_) | EngineError::MalformedOutput(_) => {
                ErrorKind::EngineFatalFailure
            }
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// An image-synthesis engine bound to one accelerator slot.
pub trait GenerationEngine: Send + Sync + 'static {
    /// Run one generation. `deadline` is informational; the executor enforces
    /// it by setting `cancel`.
    fn generate(
        &self,
        params: &GenerationParams,
        cancel: CancelToken,
        deadline: Instant,
    ) -> impl Future<Output = Result<Bytes, EngineError>> + Send;
}
