//! In-process [`CoordinationStore`] implementation.
//!
//! Keeps a revisioned `BTreeMap` of keys, a lease table, and a list of
//! prefix watchers behind one `parking_lot` mutex, so every mutation and its
//! watch notification happen atomically. A reaper task expires leases in the
//! background; every operation also expires overdue leases before it runs,
//! so reads never observe a key whose lease has already lapsed.
//!
//! Suitable for tests, single-process deployments, and failure drills
//! (see [`MemoryStore::set_unavailable`]).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::traits::{
    CoordinationStore, EventKind, KeyValue, LeaseId, Revision, StoreError, WatchEvent,
    WatchStream,
};
use crate::task::{sleep_or_cancel, OwnedTask};

/// Default period of the background lease reaper.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(20);

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Vec<WatchEvent>>,
}

#[derive(Default)]
struct State {
    revision: Revision,
    next_lease: LeaseId,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    watchers: Vec<Watcher>,
}

impl State {
    /// Fans a batch out to every watcher whose prefix matches, pruning
    /// watchers whose stream has been dropped.
    fn notify(&mut self, events: &[WatchEvent]) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|watcher| {
            let matching: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.kv.key.starts_with(&watcher.prefix))
                .cloned()
                .collect();
            if matching.is_empty() {
                !watcher.tx.is_closed()
            } else {
                watcher.tx.send(matching).is_ok()
            }
        });
    }

    /// Removes `key` at `revision`, detaching it from its lease.
    fn remove_key(&mut self, key: &str, revision: Revision) -> Option<WatchEvent> {
        let old = self.kvs.remove(key)?;
        if let Some(lease) = old.lease {
            if let Some(entry) = self.leases.get_mut(&lease) {
                entry.keys.remove(key);
            }
        }
        Some(WatchEvent {
            kind: EventKind::Delete,
            kv: KeyValue {
                key: old.key,
                value: Vec::new(),
                create_revision: old.create_revision,
                mod_revision: revision,
                lease: old.lease,
            },
        })
    }

    /// Drops a lease and every key bound to it as one revision.
    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        let Some(entry) = self.leases.remove(&lease) else {
            return false;
        };
        if entry.keys.is_empty() {
            return true;
        }
        self.revision += 1;
        let revision = self.revision;
        let events: Vec<WatchEvent> = entry
            .keys
            .iter()
            .filter_map(|key| self.remove_key(key, revision))
            .collect();
        self.notify(&events);
        true
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            debug!(lease, "lease expired");
            self.drop_lease(lease);
        }
    }
}

struct Inner {
    state: Mutex<State>,
    unavailable: AtomicBool,
    reaper: Mutex<Option<OwnedTask>>,
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(StoreError::Unavailable("store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Locks the state after expiring overdue leases.
    fn lock(&self) -> Result<parking_lot::MutexGuard<'_, State>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.expire(Instant::now());
        Ok(state)
    }
}

/// In-memory coordination store. Cloning shares the same underlying data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Creates an empty store and starts its lease reaper.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_reap_interval(DEFAULT_REAP_INTERVAL)
    }

    /// Creates an empty store whose reaper runs every `interval`.
    #[must_use]
    pub fn with_reap_interval(interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                next_lease: 1,
                ..State::default()
            }),
            unavailable: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let reaper = OwnedTask::spawn("memory-store-reaper", move |cancel| async move {
            while sleep_or_cancel(interval, &cancel).await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.state.lock().expire(Instant::now());
            }
        });
        *inner.reaper.lock() = Some(reaper);

        Self { inner }
    }

    /// Makes every subsequent operation fail with [`StoreError::Unavailable`]
    /// until switched back. Leases keep ticking while the store is down, as
    /// they would on a real server the client cannot reach.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::Release);
    }

    /// Ends every open watch stream, as a dropped connection to a remote
    /// store would. Watchers must re-open to keep receiving events.
    pub fn close_watches(&self) {
        let dropped = std::mem::take(&mut self.inner.state.lock().watchers);
        debug!(count = dropped.len(), "closed all watches");
    }

    /// Current store revision.
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.inner.state.lock().revision
    }

    /// Number of live leases.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.expire(Instant::now());
        state.leases.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidRequest("empty key".to_string()));
        }
        let mut state = self.inner.lock()?;
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        state.revision += 1;
        let revision = state.revision;
        let previous = state.kvs.get(key).map(|kv| (kv.create_revision, kv.lease));
        let create_revision = previous.map_or(revision, |(created, _)| created);

        if let Some((_, Some(old_lease))) = previous {
            if Some(old_lease) != lease {
                if let Some(entry) = state.leases.get_mut(&old_lease) {
                    entry.keys.remove(key);
                }
            }
        }
        if let Some(id) = lease {
            if let Some(entry) = state.leases.get_mut(&id) {
                entry.keys.insert(key.to_string());
            }
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision,
            mod_revision: revision,
            lease,
        };
        state.kvs.insert(key.to_string(), kv.clone());
        state.notify(&[WatchEvent {
            kind: EventKind::Put,
            kv,
        }]);
        Ok(revision)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let state = self.inner.lock()?;
        Ok(state.kvs.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let state = self.inner.lock()?;
        Ok(state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.lock()?;
        if !state.kvs.contains_key(key) {
            return Ok(false);
        }
        state.revision += 1;
        let revision = state.revision;
        if let Some(event) = state.remove_key(key, revision) {
            state.notify(&[event]);
        }
        Ok(true)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidRequest("lease ttl must be positive".to_string()));
        }
        let mut state = self.inner.lock()?;
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, StoreError> {
        let mut state = self.inner.lock()?;
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        entry.deadline = Instant::now() + entry.ttl;
        Ok(entry.ttl)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut state = self.inner.lock()?;
        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let mut state = self.inner.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }
}
