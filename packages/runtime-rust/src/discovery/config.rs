//! Registry and resolver configuration.

use std::time::Duration;

/// Namespace under which instances are registered unless configured otherwise.
pub const DEFAULT_PREFIX: &str = "microservices";

/// Configuration for a [`ServiceRegistry`](super::ServiceRegistry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Key namespace, the `<prefix>` in `/<prefix>/<name>/<addr>`.
    pub prefix: String,
    /// Lease TTL of each registration. Renewal runs every `register_ttl / 3`.
    pub register_ttl: Duration,
    /// Upper bound on a single register, renew, or deregister round trip.
    pub op_timeout: Duration,
}

impl RegistryConfig {
    /// Interval between renewals: a third of the TTL, so two consecutive
    /// renewals can fail before the key expires.
    #[must_use]
    pub fn renew_interval(&self) -> Duration {
        self.register_ttl / 3
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            register_ttl: Duration::from_secs(15),
            op_timeout: Duration::from_secs(3),
        }
    }
}

/// Configuration for a [`ResolverBuilder`](super::ResolverBuilder).
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Key namespace shared with the registry.
    pub prefix: String,
    /// Only instances advertising this scheme are resolved.
    pub scheme: String,
    /// Delay before re-opening a watch that ended or failed.
    pub retry_backoff: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            scheme: "rpc".to_string(),
            retry_backoff: Duration::from_secs(1),
        }
    }
}
