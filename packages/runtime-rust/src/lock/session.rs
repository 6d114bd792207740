use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{CoordinationStore, LeaseId, StoreError};
use crate::task::{sleep_or_cancel, OwnedTask};

/// Default TTL of a session lease.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);

/// Options for opening a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// TTL of the lease granted for the session.
    pub ttl: Duration,
    /// Use an existing lease instead of granting one. The caller keeps
    /// that lease alive and revokes it.
    pub lease: Option<LeaseId>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            lease: None,
        }
    }
}

impl SessionOptions {
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = Some(lease);
        self
    }
}

/// A lease kept alive for as long as the session is open.
///
/// Keys written under [`Session::lease`] vanish when the session closes or
/// when the lease lapses because the process stopped renewing it.
pub struct Session {
    store: Arc<dyn CoordinationStore>,
    lease: LeaseId,
    owns_lease: bool,
    expired: CancellationToken,
    keep_alive: Option<OwnedTask>,
}

impl Session {
    /// Opens a session, granting a lease unless one was supplied.
    ///
    /// # Errors
    ///
    /// Returns the store error if the lease cannot be granted.
    pub async fn new(
        store: Arc<dyn CoordinationStore>,
        options: SessionOptions,
    ) -> Result<Self, StoreError> {
        let expired = CancellationToken::new();

        if let Some(lease) = options.lease {
            debug!(lease, "session attached to external lease");
            return Ok(Self {
                store,
                lease,
                owns_lease: false,
                expired,
                keep_alive: None,
            });
        }

        let lease = store.grant_lease(options.ttl).await?;
        let period = options.ttl / 3;
        let renew_store = Arc::clone(&store);
        let lost = expired.clone();
        let keep_alive = OwnedTask::spawn("session-keep-alive", move |cancel| async move {
            while sleep_or_cancel(period, &cancel).await {
                match renew_store.keep_alive(lease).await {
                    Ok(_) => {}
                    Err(StoreError::LeaseNotFound(_)) => {
                        warn!(lease, "session lease lost");
                        lost.cancel();
                        return;
                    }
                    Err(e) => warn!(lease, error = %e, "session keep-alive failed"),
                }
            }
        });
        info!(lease, ttl_ms = options.ttl.as_millis(), "session opened");

        Ok(Self {
            store,
            lease,
            owns_lease: true,
            expired,
            keep_alive: Some(keep_alive),
        })
    }

    #[must_use]
    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Returns `true` once the keep-alive loop has observed the lease gone.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired.is_cancelled()
    }

    /// Token cancelled when the session's lease is lost.
    #[must_use]
    pub fn expired(&self) -> CancellationToken {
        self.expired.clone()
    }

    /// Stops renewing and revokes the lease this session granted.
    ///
    /// # Errors
    ///
    /// Returns the store error if revocation fails. An already expired
    /// lease is not an error.
    pub async fn close(mut self) -> Result<(), StoreError> {
        if let Some(task) = self.keep_alive.take() {
            task.stop().await;
        }
        if !self.owns_lease {
            return Ok(());
        }
        match self.store.revoke_lease(self.lease).await {
            Ok(()) | Err(StoreError::LeaseNotFound(_)) => {
                debug!(lease = self.lease, "session closed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
