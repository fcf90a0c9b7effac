//! Exactly-once delivery of terminal outcomes to waiting callers.
//!
//! Each request owns a [`Completion`] (the sending side, held by the
//! scheduler) and hands out [`Handle`]s (the receiving side). The outcome
//! slot is written at most once; every clone of the handle observes the same
//! value no matter how many callers wait on it.

use std::fmt;
use std::future::Future;
use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;

use synthgrid_core::{Outcome, RequestId};

use crate::error::AwaitError;

/// Implemented by the scheduler so handles can request cancellation.
pub(crate) trait Canceller: Send + Sync {
    fn cancel_request(&self, id: RequestId) -> bool;
}

/// Sending side of a request's outcome slot.
#[derive(Debug)]
pub(crate) struct Completion {
    tx: watch::Sender<Option<Outcome>>,
}

impl Completion {
    pub(crate) fn new() -> (Self, watch::Receiver<Option<Outcome>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    /// Store the outcome. Returns `false` if one was already delivered.
    pub(crate) fn deliver(&self, outcome: Outcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = Some(outcome);
                true
            }
        })
    }
}

/// Caller-side reference to a submitted request.
#[derive(Clone)]
pub struct Handle {
    id: RequestId,
    rx: watch::Receiver<Option<Outcome>>,
    canceller: Weak<dyn Canceller>,
}

impl Handle {
    pub(crate) fn new(
        id: RequestId,
        rx: watch::Receiver<Option<Outcome>>,
        canceller: Weak<dyn Canceller>,
    ) -> Self {
        Self { id, rx, canceller }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The outcome, if the request has already finished.
    pub fn try_outcome(&self) -> Option<Outcome> {
        self.rx.borrow().clone()
    }

    /// Wait for the terminal outcome.
    pub async fn wait(&self) -> Result<Outcome, AwaitError> {
        let mut rx = self.rx.clone();
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| AwaitError::Abandoned)?;
        slot.clone().ok_or(AwaitError::Abandoned)
    }

    /// Wait for the outcome unless `caller` finishes first. In that case the
    /// request is cancelled (best effort) and no outcome is returned.
    pub async fn wait_with<F>(&self, caller: F) -> Result<Outcome, AwaitError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            outcome = self.wait() => outcome,
            () = caller => {
                self.cancel();
                Err(AwaitError::CallerGone)
            }
        }
    }

    /// [`Handle::wait_with`] bounded by a timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Outcome, AwaitError> {
        self.wait_with(tokio::time::sleep(timeout)).await
    }

    /// Request cancellation. Idempotent; returns `false` if the request had
    /// already finished or the scheduler is gone.
    pub fn cancel(&self) -> bool {
        match self.canceller.upgrade() {
            Some(canceller) => canceller.cancel_request(self.id),
            None => false,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("outcome", &*self.rx.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use synthgrid_core::ErrorKind;

    use super::*;

    #[derive(Default)]
    struct CountingCanceller {
        calls: AtomicUsize,
    }

    impl Canceller for CountingCanceller {
        fn cancel_request(&self, _id: RequestId) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) == 0
        }
    }

    fn handle_pair(canceller: &Arc<CountingCanceller>) -> (Completion, Handle) {
        let (completion, rx) = Completion::new();
        let weak: Weak<dyn Canceller> = Arc::downgrade(canceller) as Weak<dyn Canceller>;
        (completion, Handle::new(RequestId(1), rx, weak))
    }

    #[tokio::test]
    async fn delivers_exactly_once() {
        let canceller = Arc::new(CountingCanceller::default());
        let (completion, handle) = handle_pair(&canceller);

        assert!(handle.try_outcome().is_none());
        assert!(completion.deliver(Outcome::Succeeded(Bytes::from_static(b"img"))));
        assert!(!completion.deliver(Outcome::Cancelled));

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome, Outcome::Succeeded(Bytes::from_static(b"img")));
    }

    #[tokio::test]
    async fn every_clone_sees_the_same_outcome() {
        let canceller = Arc::new(CountingCanceller::default());
        let (completion, handle) = handle_pair(&canceller);

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.wait().await })
            })
            .collect();

        completion.deliver(Outcome::Failed(ErrorKind::EngineFatalFailure));

        for waiter in waiters {
            assert_eq!(
                waiter.await.unwrap(),
                Ok(Outcome::Failed(ErrorKind::EngineFatalFailure))
            );
        }
    }

    #[tokio::test]
    async fn caller_gone_requests_cancellation_without_outcome() {
        let canceller = Arc::new(CountingCanceller::default());
        let (_completion, handle) = handle_pair(&canceller);

        let result = handle.wait_with(async {}).await;
        assert_eq!(result, Err(AwaitError::CallerGone));
        assert_eq!(canceller.calls.load(Ordering::SeqCst), 1);
        assert!(handle.try_outcome().is_none());
    }

    #[tokio::test]
    async fn ready_outcome_wins_over_caller() {
        let canceller = Arc::new(CountingCanceller::default());
        let (completion, handle) = handle_pair(&canceller);
        completion.deliver(Outcome::Cancelled);

        let result = handle.wait_with(async {}).await;
        assert_eq!(result, Ok(Outcome::Cancelled));
        assert_eq!(canceller.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_expires() {
        let canceller = Arc::new(CountingCanceller::default());
        let (_completion, handle) = handle_pair(&canceller);

        let result = handle.wait_timeout(Duration::from_secs(5)).await;
        assert_eq!(result, Err(AwaitError::CallerGone));
    }

    #[tokio::test]
    async fn dropped_completion_abandons_waiters() {
        let canceller = Arc::new(CountingCanceller::default());
        let (completion, handle) = handle_pair(&canceller);
        drop(completion);

        assert_eq!(handle.wait().await, Err(AwaitError::Abandoned));
    }

    #[tokio::test]
    async fn cancel_after_scheduler_dropped_is_noop() {
        let canceller = Arc::new(CountingCanceller::default());
        let (_completion, handle) = handle_pair(&canceller);
        drop(canceller);

        assert!(!handle.cancel());
    }
}
