use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{Session, SessionOptions};
use super::LockError;
use crate::store::{CoordinationStore, KeyValue, LeaseId, WatchStream};

/// Mutual exclusion over a key prefix in the coordination store.
///
/// Every contender writes `<path>/<lease>` bound to its session lease. The
/// contender whose key has the lowest create revision holds the lock; the
/// others wait for the keys ahead of them to disappear. Because the key
/// lives on the session lease, a holder that stops renewing loses the lock
/// within one lease TTL.
pub struct DistributedMutex {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    session: Option<Session>,
    held: bool,
}

impl DistributedMutex {
    /// Opens a session and binds a mutex to `path` within it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidPath`] for a path that is empty or only
    /// slashes, and [`LockError::Store`] if the session lease cannot be
    /// granted.
    pub async fn new(
        store: Arc<dyn CoordinationStore>,
        path: &str,
        options: SessionOptions,
    ) -> Result<Self, LockError> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.trim_start_matches('/').trim().is_empty() {
            return Err(LockError::InvalidPath(path.to_string()));
        }
        let session = Session::new(Arc::clone(&store), options).await?;
        Ok(Self {
            store,
            prefix: format!("{trimmed}/"),
            session: Some(session),
            held: false,
        })
    }

    /// Key this mutex writes while contending or holding.
    #[must_use]
    pub fn key(&self) -> Option<String> {
        self.session
            .as_ref()
            .map(|s| format!("{}{:x}", self.prefix, s.lease()))
    }

    /// Whether this mutex believes it holds the lock.
    ///
    /// Turns `false` as soon as the session notices its lease is gone.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held && self.session.as_ref().is_some_and(|s| !s.is_expired())
    }

    /// Blocks until the lock is acquired, `cancel` fires, or `timeout`
    /// elapses.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] or [`LockError::Cancelled`] if the lock was
    /// not acquired; the waiter key has been removed in both cases.
    pub async fn lock(
        &mut self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), LockError> {
        self.acquire(cancel, timeout, true).await
    }

    /// Attempts the lock once, failing with [`LockError::Contended`] if
    /// another session holds it.
    ///
    /// # Errors
    ///
    /// Same as [`DistributedMutex::lock`], plus `Contended`.
    pub async fn try_lock(
        &mut self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), LockError> {
        self.acquire(cancel, timeout, false).await
    }

    /// Releases the lock and closes the session.
    ///
    /// If `cancel` has already fired nothing is released and the lock stays
    /// held. Once started, the release runs to completion: a cancellation
    /// arriving mid-way returns [`LockError::Cancelled`] while the key delete
    /// and lease revoke finish in the background.
    ///
    /// # Errors
    ///
    /// [`LockError::NotHeld`] if the lock was never acquired or was
    /// already released.
    pub async fn unlock(&mut self, cancel: &CancellationToken) -> Result<(), LockError> {
        if !self.held {
            return Err(LockError::NotHeld);
        }
        if cancel.is_cancelled() {
            return Err(LockError::Cancelled);
        }
        let (Some(key), Some(session)) = (self.key(), self.session.take()) else {
            return Err(LockError::NotHeld);
        };
        self.held = false;

        let store = Arc::clone(&self.store);
        let released = key.clone();
        let mut release = tokio::spawn(async move {
            // Revoking also removes the key, so it runs even if the delete failed.
            let deleted = store.delete(&released).await;
            let revoked = session.close().await;
            deleted?;
            revoked?;
            Ok::<(), LockError>(())
        });

        tokio::select! {
            biased;
            joined = &mut release => {
                joined.unwrap_or_else(|e| {
                    warn!(key = %key, error = %e, "lock release task failed");
                    Err(LockError::SessionClosed)
                })?;
                info!(key = %key, "lock released");
                Ok(())
            }
            () = cancel.cancelled() => {
                debug!(key = %key, "unlock cancelled; release continues in the background");
                Err(LockError::Cancelled)
            }
        }
    }

    async fn acquire(
        &mut self,
        cancel: &CancellationToken,
        timeout: Duration,
        wait: bool,
    ) -> Result<(), LockError> {
        let Some(key) = self.key() else {
            return Err(LockError::SessionClosed);
        };
        if self.held {
            return Ok(());
        }
        let Some(lease) = self.session.as_ref().map(Session::lease) else {
            return Err(LockError::SessionClosed);
        };

        let mut waiter = WaiterGuard::new(Arc::clone(&self.store), key.clone());
        let attempt = contend(&self.store, &self.prefix, &key, lease, wait);
        let result = tokio::select! {
            outcome = tokio::time::timeout(timeout, attempt) => {
                outcome.unwrap_or(Err(LockError::Timeout(timeout)))
            }
            () = cancel.cancelled() => Err(LockError::Cancelled),
        };

        match result {
            Ok(()) => {
                waiter.disarm();
                self.held = true;
                info!(key = %key, "lock acquired");
                Ok(())
            }
            Err(e) => {
                waiter.disarm();
                if let Err(del) = self.store.delete(&key).await {
                    warn!(key = %key, error = %del, "failed to remove waiter key");
                }
                debug!(key = %key, error = %e, "lock not acquired");
                Err(e)
            }
        }
    }
}

/// Writes the waiter key and waits until it is the oldest under `prefix`.
async fn contend(
    store: &Arc<dyn CoordinationStore>,
    prefix: &str,
    key: &str,
    lease: LeaseId,
    wait: bool,
) -> Result<(), LockError> {
    // Watch first so a release between the read and the wait is not missed.
    let mut stream: WatchStream = store.watch(prefix).await?;
    store.put(key, Vec::new(), Some(lease)).await?;

    loop {
        let waiters = store.get_prefix(prefix).await?;
        let Some(mine) = waiters.iter().find(|kv| kv.key == key) else {
            return Err(LockError::SessionClosed);
        };
        if is_oldest(mine, &waiters) {
            return Ok(());
        }
        if !wait {
            return Err(LockError::Contended);
        }
        if stream.next_batch().await.is_none() {
            stream = store.watch(prefix).await?;
        }
    }
}

fn is_oldest(mine: &KeyValue, waiters: &[KeyValue]) -> bool {
    waiters
        .iter()
        .all(|kv| kv.create_revision >= mine.create_revision)
}

/// Removes the waiter key if an acquisition is abandoned mid-flight.
struct WaiterGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    armed: bool,
}

impl WaiterGuard {
    fn new(store: Arc<dyn CoordinationStore>, key: String) -> Self {
        Self {
            store,
            key,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            if let Err(e) = store.delete(&key).await {
                warn!(key = %key, error = %e, "failed to remove abandoned waiter key");
            }
        });
    }
}
