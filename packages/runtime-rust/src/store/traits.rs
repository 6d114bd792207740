use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::mpsc;

/// Identifier of a lease granted by the store.
pub type LeaseId = i64;

/// Monotonic store revision, bumped by every mutation.
pub type Revision = i64;

/// One stored key with its revision bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created (survives updates).
    pub create_revision: Revision,
    /// Revision of the most recent write to the key.
    pub mod_revision: Revision,
    /// Lease the key is bound to, if any.
    pub lease: Option<LeaseId>,
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single change observed on a watched prefix.
///
/// For `Delete` events `kv.value` is empty and `kv.mod_revision` is the
/// revision of the deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
}

/// Errors surfaced by a coordination store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or did not answer in time.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("lease {0} not found or expired")]
    LeaseNotFound(LeaseId),
    #[error("invalid store request: {0}")]
    InvalidRequest(String),
}

/// Stream of change batches for one watched prefix.
///
/// Each item is the set of events produced by a single store mutation (a
/// put, a delete, or a lease expiry removing several keys at once). The
/// stream ends when the store side of the watch goes away.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<Vec<WatchEvent>>,
}

impl WatchStream {
    /// Wraps the receiving end of a watch channel.
    #[must_use]
    pub fn new(rx: mpsc::UnboundedReceiver<Vec<WatchEvent>>) -> Self {
        Self { rx }
    }

    /// Waits for the next batch, or `None` once the watch is closed.
    pub async fn next_batch(&mut self) -> Option<Vec<WatchEvent>> {
        self.rx.recv().await
    }
}

impl Stream for WatchStream {
    type Item = Vec<WatchEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Consistent key/value store with leases and prefix watches.
///
/// This is the only seam between the runtime and the external coordination
/// service. Implementations must be safe for concurrent use: one store is
/// shared by every registry, resolver and mutex built on it.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Writes `key`, optionally bound to `lease`. Returns the write revision.
    ///
    /// Binding a key to a new lease detaches it from its previous one.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError>;

    /// Reads a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Reads every key starting with `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// Deletes `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Grants a lease that expires `ttl` after its last renewal.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Renews `lease` for another full TTL. Returns the TTL.
    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, StoreError>;

    /// Revokes `lease`, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Opens a watch on every key starting with `prefix`.
    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError>;
}
