//! Service registration and discovery on top of the coordination store.
//!
//! - [`registry`]: lease-backed registration with periodic renewal
//! - [`resolver`]: watch-driven, weighted address lists per service name
//! - [`directory`]: the shared read side (enumerate and watch instances)

pub mod config;
pub mod directory;
pub mod registry;
pub mod resolver;

use std::time::Duration;

use async_trait::async_trait;
use skiff_core::ServiceInfo;

use crate::store::StoreError;

pub use config::{RegistryConfig, ResolverConfig, DEFAULT_PREFIX};
pub use directory::ServiceDirectory;
pub use registry::ServiceRegistry;
pub use resolver::{to_addresses, Address, Resolver, ResolverBuilder};

/// Errors surfaced by registration and discovery calls.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid service info: {0}")]
    InvalidServiceInfo(String),
    #[error("failed to encode service info: {0}")]
    Encode(String),
    #[error("registry operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("registry is closed")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registration contract consumed by service bootstrap code.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, info: &ServiceInfo) -> Result<(), DiscoveryError>;

    async fn deregister(&self, info: &ServiceInfo) -> Result<(), DiscoveryError>;

    /// Removes everything this registrar registered.
    async fn close(&self);
}

/// Discovery contract consumed by the client's balancing layer.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Starts resolving `service`.
    async fn build(&self, service: &str) -> Result<Resolver, DiscoveryError>;
}
