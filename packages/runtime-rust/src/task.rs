//! Owned background tasks.
//!
//! Renewal loops, watch consumers, keep-alives and accept loops are all
//! started through [`OwnedTask::spawn`]. The component that starts a task
//! keeps the handle; dropping the handle cancels the task, and
//! [`OwnedTask::stop`] cancels it and waits for it to finish.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A cancellable tokio task with exactly one owner.
#[derive(Debug)]
pub struct OwnedTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl OwnedTask {
    /// Spawns `body` with a fresh cancellation token.
    ///
    /// The body receives a clone of the token and is expected to return
    /// promptly once it is cancelled.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_with_token(name, CancellationToken::new(), body)
    }

    /// Spawns `body` under an existing token, typically a child token of a
    /// wider shutdown scope.
    pub fn spawn_with_token<F, Fut>(name: &'static str, cancel: CancellationToken, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(body(cancel.clone()));
        debug!(task = name, "background task started");
        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    /// Signals the task to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once the task body has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the task to finish on its own, without cancelling it.
    ///
    /// Safe to abandon (for example under a timeout) and call again.
    pub async fn finished(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(task = self.name, "background task panicked");
                }
            }
            self.handle = None;
        }
    }

    /// Cancels the task and waits for it to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(task = self.name, "background task panicked");
                }
            }
        }
        debug!(task = self.name, "background task stopped");
    }
}

impl Drop for OwnedTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sleeps for `period`, returning `false` early if `cancel` fires first.
pub async fn sleep_or_cancel(period: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(period) => true,
        () = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn stop_cancels_and_joins() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);
        let task = OwnedTask::spawn("ticker", move |cancel| async move {
            while sleep_or_cancel(Duration::from_millis(5), &cancel).await {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        task.stop().await;

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected a few ticks, got {seen}");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen, "task kept running after stop");
    }

    #[tokio::test]
    async fn drop_cancels_task() {
        let cancelled = CancellationToken::new();
        let observed = cancelled.clone();
        let task = OwnedTask::spawn("waiter", move |cancel| async move {
            cancel.cancelled().await;
            observed.cancel();
        });
        drop(task);
        tokio::time::timeout(Duration::from_secs(1), cancelled.cancelled())
            .await
            .expect("task body should observe cancellation");
    }

    #[tokio::test]
    async fn finished_can_be_abandoned_and_resumed() {
        let mut task = OwnedTask::spawn("short", |_cancel| async {
            tokio::time::sleep(Duration::from_millis(60)).await;
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(5), task.finished())
                .await
                .is_err()
        );
        assert!(!task.is_finished());
        task.finished().await;
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn sleep_or_cancel_returns_false_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);
    }
}
