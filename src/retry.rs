//! Poll-until-condition primitives.
//!
//! Used to wait for the index service to report healthy before syncing and
//! to drive periodic convergence passes.
//!
//! All helpers evaluate their predicate or action immediately, then wait a
//! fixed interval *after* each evaluation completes before the next one.
//! A slow evaluation therefore delays the next tick instead of overlapping
//! it, and at most one evaluation is in flight at any time.
//!
//! There is no external cancel token for [`retry_until`] and
//! [`retry_until_done`]: they stop when the condition holds or an
//! evaluation fails. [`ScheduledTask`] is the cancellable variant.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Evaluate `f` until it yields `Some`, sleeping `interval` between
/// evaluations. An `Err` halts polling and is returned as is.
pub async fn poll_until<T, E, F, Fut>(mut f: F, interval: Duration) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    loop {
        if let Some(value) = f().await? {
            return Ok(value);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Evaluate `predicate` until it returns `true`.
///
/// Resolves with `true`; the value exists so callers can chain on it.
pub async fn retry_until<E, F, Fut>(mut predicate: F, interval: Duration) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    poll_until(
        || {
            let check = predicate();
            async move { check.await.map(|ok| ok.then_some(true)) }
        },
        interval,
    )
    .await
}

/// Completion signal handed to [`retry_until_done`] actions.
#[derive(Debug, Clone, Default)]
pub struct Done(Arc<AtomicBool>);

impl Done {
    /// Mark the loop complete. No further invocations happen after the
    /// current one returns.
    pub fn done(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Invoke `action` until it signals completion through its [`Done`] handle.
///
/// The action decides completion itself, so it can perform several checks
/// (and side effects such as status updates) before stopping the loop.
pub async fn retry_until_done<E, F, Fut>(mut action: F, interval: Duration) -> Result<(), E>
where
    F: FnMut(Done) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let done = Done::default();
    poll_until(
        || {
            let run = action(done.clone());
            let done = done.clone();
            async move { run.await.map(|()| done.is_done().then_some(())) }
        },
        interval,
    )
    .await
}

/// A background loop running `action` every `interval` until cancelled.
///
/// The next run is scheduled only after the previous one finished.
/// Dropping the handle cancels the loop.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawn the loop on the current tokio runtime. The first run starts
    /// immediately.
    pub fn start<F, Fut>(interval: Duration, mut action: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                action().await;
                tokio::time::sleep(interval).await;
            }
        });
        Self { handle }
    }

    /// Stop the loop. A run in progress is aborted at its next await point.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
