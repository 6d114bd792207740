//! Turns a logical service name into a live, weighted address list.
//!
//! A resolver seeds its list with a full prefix read, then follows a watch on
//! the same prefix. Every event batch triggers another full read; the list is
//! replaced wholesale, never patched, so consumers always see one consistent
//! snapshot. An empty read never replaces a non-empty list: a transient
//! failure must not blank out addresses that were known to be good.

use std::sync::Arc;

use async_trait::async_trait;
use skiff_core::ServiceInfo;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ResolverConfig;
use super::directory::ServiceDirectory;
use super::{DiscoveryError, DiscoveryProvider};
use crate::store::{CoordinationStore, EventKind, WatchStream};
use crate::task::{sleep_or_cancel, OwnedTask};

/// One resolved endpoint with its routing attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub addr: String,
    pub weight: u32,
    pub scheme: String,
}

impl Address {
    #[must_use]
    pub fn new(addr: impl Into<String>, weight: u32, scheme: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            weight,
            scheme: scheme.into(),
        }
    }
}

/// Builds the address list for `scheme` out of registered instances.
#[must_use]
pub fn to_addresses(instances: &[ServiceInfo], scheme: &str) -> Vec<Address> {
    instances
        .iter()
        .filter(|info| info.scheme.eq_ignore_ascii_case(scheme))
        .map(|info| Address::new(info.addr.clone(), info.weight(), info.scheme.clone()))
        .collect()
}

/// Creates watching resolvers backed by a coordination store.
#[derive(Clone)]
pub struct ResolverBuilder {
    directory: ServiceDirectory,
    config: ResolverConfig,
}

impl ResolverBuilder {
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, config: ResolverConfig) -> Self {
        Self {
            directory: ServiceDirectory::new(store, config.prefix.clone()),
            config,
        }
    }

    /// Seeds and starts a resolver for `service`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the watch or the seed read fails.
    pub async fn build(&self, service: &str) -> Result<Resolver, DiscoveryError> {
        // The watch is opened before the seed read so that a change landing
        // in between is still observed.
        let stream = self.directory.watch(service).await?;
        let seed = self.directory.instances(service).await?;
        let addresses = to_addresses(&seed, &self.config.scheme);
        info!(service, count = addresses.len(), "resolver seeded");

        let (tx, rx) = watch::channel(addresses);
        let watcher = WatchLoop {
            directory: self.directory.clone(),
            service: service.to_string(),
            config: self.config.clone(),
            tx,
        };
        let task = OwnedTask::spawn("resolver-watch", move |cancel| watcher.run(stream, cancel));

        Ok(Resolver {
            service: service.to_string(),
            rx,
            task: Some(task),
            pinned: None,
        })
    }
}

#[async_trait]
impl DiscoveryProvider for ResolverBuilder {
    async fn build(&self, service: &str) -> Result<Resolver, DiscoveryError> {
        ResolverBuilder::build(self, service).await
    }
}

/// Live address list for one service.
///
/// Updates are push-driven; [`Resolver::resolve_now`] exists for callers
/// that expect a pull hook and does nothing.
pub struct Resolver {
    service: String,
    rx: watch::Receiver<Vec<Address>>,
    task: Option<OwnedTask>,
    /// Keeps the channel open for resolvers with no watch task.
    pinned: Option<watch::Sender<Vec<Address>>>,
}

impl Resolver {
    /// A resolver over a fixed address list that never changes.
    #[must_use]
    pub fn fixed(service: impl Into<String>, addresses: Vec<Address>) -> Self {
        let (tx, rx) = watch::channel(addresses);
        Self {
            service: service.into(),
            rx,
            task: None,
            pinned: Some(tx),
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Snapshot of the current address list.
    #[must_use]
    pub fn addresses(&self) -> Vec<Address> {
        self.rx.borrow().clone()
    }

    /// Receiver notified whenever the address list is replaced.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<Address>> {
        self.rx.clone()
    }

    pub fn resolve_now(&self) {}

    /// Stops watching. Subscribers keep the last published list.
    pub async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
        }
        self.pinned.take();
        debug!(service = %self.service, "resolver closed");
    }
}

struct WatchLoop {
    directory: ServiceDirectory,
    service: String,
    config: ResolverConfig,
    tx: watch::Sender<Vec<Address>>,
}

impl WatchLoop {
    async fn run(self, mut stream: WatchStream, cancel: CancellationToken) {
        loop {
            let batch = tokio::select! {
                () = cancel.cancelled() => return,
                batch = stream.next_batch() => batch,
            };
            match batch {
                Some(events) => {
                    if events
                        .iter()
                        .any(|e| matches!(e.kind, EventKind::Put | EventKind::Delete))
                    {
                        self.refresh().await;
                    }
                }
                None => {
                    warn!(service = %self.service, "watch stream ended; re-opening");
                    let Some(reopened) = self.reopen(&cancel).await else {
                        return;
                    };
                    stream = reopened;
                    // Changes made while the watch was down are only visible
                    // through a fresh read.
                    self.refresh().await;
                }
            }
        }
    }

    async fn reopen(&self, cancel: &CancellationToken) -> Option<WatchStream> {
        loop {
            if !sleep_or_cancel(self.config.retry_backoff, cancel).await {
                return None;
            }
            match self.directory.watch(&self.service).await {
                Ok(stream) => return Some(stream),
                Err(e) => warn!(service = %self.service, error = %e, "watch re-open failed"),
            }
        }
    }

    async fn refresh(&self) {
        match self.directory.instances(&self.service).await {
            Ok(instances) => {
                let addresses = to_addresses(&instances, &self.config.scheme);
                if addresses.is_empty() {
                    debug!(service = %self.service, "empty address set; keeping last known list");
                    return;
                }
                info!(service = %self.service, count = addresses.len(), "address list updated");
                self.tx.send_replace(addresses);
            }
            Err(e) => {
                warn!(service = %self.service, error = %e, "address refresh failed; keeping last known list");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::discovery::{RegistryConfig, ServiceRegistry};
    use crate::store::MemoryStore;

    fn registry(store: &MemoryStore) -> ServiceRegistry {
        ServiceRegistry::new(
            Arc::new(store.clone()),
            RegistryConfig {
                prefix: "test".to_string(),
                register_ttl: Duration::from_secs(5),
                op_timeout: Duration::from_millis(200),
            },
        )
    }

    fn builder(store: &MemoryStore) -> ResolverBuilder {
        ResolverBuilder::new(
            Arc::new(store.clone()),
            ResolverConfig {
                prefix: "test".to_string(),
                scheme: "rpc".to_string(),
                retry_backoff: Duration::from_millis(20),
            },
        )
    }

    async fn wait_for_count(rx: &mut watch::Receiver<Vec<Address>>, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|a| a.len() == count))
            .await
            .expect("resolver did not converge")
            .expect("resolver channel closed");
    }

    #[test]
    fn addresses_filter_scheme_and_carry_weight() {
        let instances = vec![
            ServiceInfo::new("greeter", "rpc", "h:1").with_metadata("weight", "250"),
            ServiceInfo::new("greeter", "http", "h:2"),
            ServiceInfo::new("greeter", "RPC", "h:3").with_metadata("weight", "abc"),
        ];
        let addresses = to_addresses(&instances, "rpc");
        assert_eq!(
            addresses,
            vec![Address::new("h:1", 250, "rpc"), Address::new("h:3", 100, "RPC")]
        );
    }

    #[tokio::test]
    async fn build_seeds_existing_instances() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        registry
            .register(&ServiceInfo::new("greeter", "rpc", "h:1"))
            .await
            .unwrap();

        let resolver = builder(&store).build("greeter").await.unwrap();
        assert_eq!(resolver.addresses(), vec![Address::new("h:1", 100, "rpc")]);
        resolver.close().await;
    }

    #[tokio::test]
    async fn converges_after_registrations_and_removals() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let resolver = builder(&store).build("greeter").await.unwrap();
        let mut rx = resolver.subscribe();

        let instances: Vec<ServiceInfo> = (0..5)
            .map(|i| ServiceInfo::new("greeter", "rpc", format!("10.0.0.{i}:9000")))
            .collect();
        for info in &instances {
            registry.register(info).await.unwrap();
        }
        wait_for_count(&mut rx, 5).await;

        for info in &instances[..3] {
            registry.deregister(info).await.unwrap();
        }
        wait_for_count(&mut rx, 2).await;

        let mut remaining: Vec<String> = resolver.addresses().into_iter().map(|a| a.addr).collect();
        remaining.sort();
        assert_eq!(remaining, vec!["10.0.0.3:9000", "10.0.0.4:9000"]);
        resolver.close().await;
    }

    #[tokio::test]
    async fn empty_result_keeps_last_known_list() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let only = ServiceInfo::new("greeter", "rpc", "h:1");
        registry.register(&only).await.unwrap();

        let resolver = builder(&store).build("greeter").await.unwrap();
        registry.deregister(&only).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(resolver.addresses().len(), 1);
        resolver.close().await;
    }

    #[tokio::test]
    async fn malformed_record_does_not_abort_refresh() {
        let store = MemoryStore::new();
        let resolver = builder(&store).build("greeter").await.unwrap();
        let mut rx = resolver.subscribe();

        store
            .put("/test/greeter/h:9", b"garbage".to_vec(), None)
            .await
            .unwrap();
        let good = ServiceInfo::new("greeter", "rpc", "h:1");
        store
            .put(&good.key("test"), good.to_bytes().unwrap(), None)
            .await
            .unwrap();

        wait_for_count(&mut rx, 1).await;
        assert_eq!(resolver.addresses()[0].addr, "h:1");
        resolver.close().await;
    }

    #[tokio::test]
    async fn reopened_watch_picks_up_changes_missed_while_down() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        registry
            .register(&ServiceInfo::new("greeter", "rpc", "h:1"))
            .await
            .unwrap();
        let resolver = builder(&store).build("greeter").await.unwrap();
        let mut rx = resolver.subscribe();
        assert_eq!(resolver.addresses().len(), 1);

        // This registration lands while no watch is open; only the refresh
        // after re-opening can see it.
        store.close_watches();
        registry
            .register(&ServiceInfo::new("greeter", "rpc", "h:2"))
            .await
            .unwrap();
        wait_for_count(&mut rx, 2).await;

        // The re-opened watch keeps delivering events.
        registry
            .register(&ServiceInfo::new("greeter", "rpc", "h:3"))
            .await
            .unwrap();
        wait_for_count(&mut rx, 3).await;
        resolver.close().await;
    }

    #[tokio::test]
    async fn build_fails_when_store_is_down() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            builder(&store).build("greeter").await,
            Err(DiscoveryError::Store(_))
        ));
    }

    #[tokio::test]
    async fn fixed_resolver_serves_static_list() {
        let resolver = Resolver::fixed("greeter", vec![Address::new("h:1", 5, "rpc")]);
        resolver.resolve_now();
        assert_eq!(resolver.addresses()[0].weight, 5);
        let rx = resolver.subscribe();
        resolver.close().await;
        assert_eq!(rx.borrow().len(), 1);
    }
}
