//! Cooperative cancellation token.
//!
//! One token exists per request. The scheduler sets it on `cancel()` and the
//! executor sets it when the execution deadline passes; the engine checks it
//! between denoising steps. Nothing is ever force-terminated.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared, idempotent cancellation signal backed by a `watch` channel.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation. Returns `true` only for the call that flipped the
    /// token; later calls are no-ops.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled (immediately if it already is).
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
