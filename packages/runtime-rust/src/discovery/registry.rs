//! Write side of the registry: lease-backed registration with renewal.
//!
//! Each registered instance owns one key and one renewal task. Every
//! `register_ttl / 3` the task grants a fresh lease and rewrites the same
//! key and value under it, then revokes the previous lease. A renewal that
//! fails is logged and retried on the next tick; if renewals keep failing
//! for a whole TTL the key expires and the instance drops out of discovery.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use skiff_core::ServiceInfo;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::RegistryConfig;
use super::directory::ServiceDirectory;
use super::{DiscoveryError, Registrar};
use crate::store::{CoordinationStore, LeaseId, StoreError, WatchStream};
use crate::task::{sleep_or_cancel, OwnedTask};

/// A key this registry owns, with the lease currently backing it.
struct Registration {
    lease: Arc<AtomicI64>,
    renewal: OwnedTask,
}

/// Registers service instances and keeps their keys alive.
///
/// Owned keys are tracked in a `DashMap` shared between the public API and
/// the renewal tasks. [`ServiceRegistry::close`] removes every owned key.
pub struct ServiceRegistry {
    directory: ServiceDirectory,
    config: RegistryConfig,
    owned: DashMap<String, Registration>,
    closed: AtomicBool,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, config: RegistryConfig) -> Self {
        Self {
            directory: ServiceDirectory::new(store, config.prefix.clone()),
            config,
            owned: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Keys currently owned by this registry, sorted.
    #[must_use]
    pub fn owned_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.owned.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Lease currently backing `info`, if this registry owns its key.
    #[must_use]
    pub fn lease_of(&self, info: &ServiceInfo) -> Option<LeaseId> {
        self.owned
            .get(&info.key(&self.config.prefix))
            .map(|r| r.lease.load(Ordering::Acquire))
    }

    /// Registers `info` and starts renewing it.
    ///
    /// Registering a key this registry already owns replaces the stored
    /// value and restarts its renewal.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidServiceInfo`] for a record without a
    /// name or address, [`DiscoveryError::Timeout`] if the store does not
    /// answer within `op_timeout`, and [`DiscoveryError::Store`] if the
    /// lease grant or write fails.
    pub async fn register(&self, info: &ServiceInfo) -> Result<(), DiscoveryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DiscoveryError::Closed);
        }
        validate(info)?;

        let key = info.key(&self.config.prefix);
        let value = info
            .to_bytes()
            .map_err(|e| DiscoveryError::Encode(e.to_string()))?;
        let store = Arc::clone(self.directory.store());

        let lease = tokio::time::timeout(
            self.config.op_timeout,
            publish(&store, &key, &value, self.config.register_ttl),
        )
        .await
        .map_err(|_| DiscoveryError::Timeout(self.config.op_timeout))??;

        let lease_cell = Arc::new(AtomicI64::new(lease));
        let renewal = {
            let store = Arc::clone(&store);
            let key = key.clone();
            let lease_cell = Arc::clone(&lease_cell);
            let config = self.config.clone();
            OwnedTask::spawn("registry-renewal", move |cancel| {
                renew_loop(store, key, value, config, lease_cell, cancel)
            })
        };

        let previous = self.owned.insert(
            key.clone(),
            Registration {
                lease: lease_cell,
                renewal,
            },
        );
        if let Some(previous) = previous {
            previous.renewal.stop().await;
            let old_lease = previous.lease.load(Ordering::Acquire);
            if old_lease != lease {
                let _ = store.revoke_lease(old_lease).await;
            }
        }

        info!(key = %key, lease, ttl_ms = duration_ms(self.config.register_ttl), "service registered");
        Ok(())
    }

    /// Removes `info` from the store and stops renewing it.
    ///
    /// Deleting a key that is already gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Timeout`] or [`DiscoveryError::Store`] if
    /// the delete could not be confirmed.
    pub async fn deregister(&self, info: &ServiceInfo) -> Result<(), DiscoveryError> {
        let key = info.key(&self.config.prefix);
        let registration = self.owned.remove(&key).map(|(_, r)| r);
        remove_key(
            Arc::clone(self.directory.store()),
            key,
            registration,
            self.config.op_timeout,
        )
        .await
    }

    /// Deregisters every owned key in parallel and waits for all of them.
    ///
    /// Each removal is bounded by `op_timeout`; failures are logged, never
    /// returned, so shutdown cannot hang on an unreachable store. Further
    /// `register` calls fail with [`DiscoveryError::Closed`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);

        let keys: Vec<String> = self.owned.iter().map(|e| e.key().clone()).collect();
        let mut removals = JoinSet::new();
        for key in keys {
            let Some((key, registration)) = self.owned.remove(&key) else {
                continue;
            };
            let store = Arc::clone(self.directory.store());
            let timeout = self.config.op_timeout;
            removals.spawn(async move {
                let result = remove_key(store, key.clone(), Some(registration), timeout).await;
                (key, result)
            });
        }

        while let Some(joined) = removals.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((key, Err(e))) => {
                    warn!(key = %key, error = %e, "deregistration failed during close");
                }
                Err(e) => warn!(error = %e, "deregistration task failed during close"),
            }
        }
        info!(prefix = %self.config.prefix, "service registry closed");
    }

    /// Reads every registered instance of `name`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the read fails.
    pub async fn instances(&self, name: &str) -> Result<Vec<ServiceInfo>, DiscoveryError> {
        Ok(self.directory.instances(name).await?)
    }

    /// Watches the instances of `name`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the watch cannot be opened.
    pub async fn watch(&self, name: &str) -> Result<WatchStream, DiscoveryError> {
        Ok(self.directory.watch(name).await?)
    }
}

#[async_trait]
impl Registrar for ServiceRegistry {
    async fn register(&self, info: &ServiceInfo) -> Result<(), DiscoveryError> {
        ServiceRegistry::register(self, info).await
    }

    async fn deregister(&self, info: &ServiceInfo) -> Result<(), DiscoveryError> {
        ServiceRegistry::deregister(self, info).await
    }

    async fn close(&self) {
        ServiceRegistry::close(self).await;
    }
}

fn validate(info: &ServiceInfo) -> Result<(), DiscoveryError> {
    if info.name.trim().is_empty() {
        return Err(DiscoveryError::InvalidServiceInfo("empty service name".to_string()));
    }
    if info.addr.trim().is_empty() {
        return Err(DiscoveryError::InvalidServiceInfo("empty address".to_string()));
    }
    if info.name.contains('/') {
        return Err(DiscoveryError::InvalidServiceInfo(format!(
            "service name {:?} must not contain '/'",
            info.name
        )));
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Revokes a lease when dropped unless disarmed.
///
/// Covers the window between granting a lease and writing the key: if the
/// caller's future is dropped there, the lease is revoked in the background
/// instead of lingering untracked until its TTL runs out.
struct LeaseGuard {
    store: Arc<dyn CoordinationStore>,
    lease: LeaseId,
    armed: bool,
}

impl LeaseGuard {
    fn disarm(mut self) -> LeaseId {
        self.armed = false;
        self.lease
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let lease = self.lease;
        let store = Arc::clone(&self.store);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.revoke_lease(lease).await;
                debug!(lease, "revoked lease abandoned by a cancelled registration");
            });
        }
    }
}

/// Grants a lease and writes `key` under it, revoking the lease if the
/// write fails.
async fn publish(
    store: &Arc<dyn CoordinationStore>,
    key: &str,
    value: &[u8],
    ttl: Duration,
) -> Result<LeaseId, StoreError> {
    let lease = store.grant_lease(ttl).await?;
    let guard = LeaseGuard {
        store: Arc::clone(store),
        lease,
        armed: true,
    };
    match store.put(key, value.to_vec(), Some(lease)).await {
        Ok(_) => Ok(guard.disarm()),
        Err(e) => {
            let lease = guard.disarm();
            let _ = store.revoke_lease(lease).await;
            Err(e)
        }
    }
}

async fn renew_loop(
    store: Arc<dyn CoordinationStore>,
    key: String,
    value: Vec<u8>,
    config: RegistryConfig,
    lease: Arc<AtomicI64>,
    cancel: CancellationToken,
) {
    let interval = config.renew_interval();
    while sleep_or_cancel(interval, &cancel).await {
        let renewed = tokio::select! {
            () = cancel.cancelled() => return,
            result = tokio::time::timeout(
                config.op_timeout,
                publish(&store, &key, &value, config.register_ttl),
            ) => result,
        };
        match renewed {
            Ok(Ok(new_lease)) => {
                let old = lease.swap(new_lease, Ordering::AcqRel);
                let _ = store.revoke_lease(old).await;
                debug!(key = %key, lease = new_lease, "registration renewed");
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "registration renewal failed; retrying next tick");
            }
            Err(_) => {
                warn!(key = %key, timeout_ms = duration_ms(config.op_timeout), "registration renewal timed out; retrying next tick");
            }
        }
    }
}

async fn remove_key(
    store: Arc<dyn CoordinationStore>,
    key: String,
    registration: Option<Registration>,
    timeout: Duration,
) -> Result<(), DiscoveryError> {
    let lease = match registration {
        Some(registration) => {
            // A renewal finishing before stop() may have swapped the lease.
            registration.renewal.stop().await;
            Some(registration.lease.load(Ordering::Acquire))
        }
        None => None,
    };

    let existed = tokio::time::timeout(timeout, store.delete(&key))
        .await
        .map_err(|_| DiscoveryError::Timeout(timeout))??;
    if let Some(lease) = lease {
        let _ = store.revoke_lease(lease).await;
    }
    info!(key = %key, existed, "service deregistered");
    Ok(())
}
