//! Read side of the registry: enumerate and watch the instances of a name.

use std::sync::Arc;

use skiff_core::{keys, ServiceInfo};
use tracing::warn;

use crate::store::{CoordinationStore, KeyValue, StoreError, WatchStream};

/// Prefix-scoped view of the coordination store.
#[derive(Clone)]
pub struct ServiceDirectory {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
}

impl ServiceDirectory {
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Key prefix covering every instance of `name`.
    #[must_use]
    pub fn service_prefix(&self, name: &str) -> String {
        keys::service_prefix(&self.prefix, name)
    }

    /// Reads a consistent snapshot of every instance of `name`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the prefix read fails. Records that fail
    /// to decode are skipped, not reported.
    pub async fn instances(&self, name: &str) -> Result<Vec<ServiceInfo>, StoreError> {
        let kvs = self.store.get_prefix(&self.service_prefix(name)).await?;
        Ok(decode_instances(&kvs))
    }

    /// Opens a watch on every instance of `name`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the watch cannot be established.
    pub async fn watch(&self, name: &str) -> Result<WatchStream, StoreError> {
        self.store.watch(&self.service_prefix(name)).await
    }
}

/// Decodes stored records, logging and skipping any that are malformed.
#[must_use]
pub fn decode_instances(kvs: &[KeyValue]) -> Vec<ServiceInfo> {
    kvs.iter()
        .filter_map(|kv| match ServiceInfo::from_bytes(&kv.value) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(key = %kv.key, error = %e, "skipping malformed service record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let store = MemoryStore::new();
        let directory = ServiceDirectory::new(Arc::new(store.clone()), "svc");

        let good = ServiceInfo::new("greeter", "rpc", "10.0.0.1:9000");
        store
            .put(&good.key("svc"), good.to_bytes().unwrap(), None)
            .await
            .unwrap();
        store
            .put("/svc/greeter/10.0.0.2:9000", b"{broken".to_vec(), None)
            .await
            .unwrap();

        let instances = directory.instances("greeter").await.unwrap();
        assert_eq!(instances, vec![good]);
    }

    #[tokio::test]
    async fn names_do_not_bleed_into_each_other() {
        let store = MemoryStore::new();
        let directory = ServiceDirectory::new(Arc::new(store.clone()), "svc");
        for (name, addr) in [("greeter", "h:1"), ("greeter-admin", "h:2")] {
            let info = ServiceInfo::new(name, "rpc", addr);
            store
                .put(&info.key("svc"), info.to_bytes().unwrap(), None)
                .await
                .unwrap();
        }
        let instances = directory.instances("greeter").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].addr, "h:1");
    }
}
