//! Network configuration for RPC servers and clients.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::service::DEFAULT_MAX_INTERCEPTORS;

/// Default cap on a single encoded frame, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Connection keep-alive parameters.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Server closes a connection with no calls in flight and no traffic
    /// for this long.
    pub idle_timeout: Duration,
    /// Server sends `GoAway` once a connection is this old. `None` means
    /// connections may live forever.
    pub max_connection_age: Option<Duration>,
    /// Time granted to in-flight calls after `GoAway` before the server
    /// force-closes the connection.
    pub max_connection_age_grace: Duration,
    /// Client sends a ping this often.
    pub ping_interval: Duration,
    /// Client drops the connection if no pong arrives within this long of a
    /// ping.
    pub ping_timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            max_connection_age: None,
            max_connection_age_grace: Duration::from_secs(5),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

/// RPC server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    pub keep_alive: KeepAliveConfig,
    /// Largest frame accepted or sent, in bytes.
    pub max_message_size: usize,
    /// Maximum number of interceptor stages, defaults included.
    pub max_interceptors: usize,
    /// Optional cap on calls in flight across all connections.
    pub max_concurrent_calls: Option<usize>,
    /// Bounded channel capacity for outbound frames per connection.
    pub outbound_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            keep_alive: KeepAliveConfig::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_interceptors: DEFAULT_MAX_INTERCEPTORS,
            max_concurrent_calls: None,
            outbound_channel_capacity: 256,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How the client spreads calls over resolved addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalancerPolicy {
    RoundRobin,
    /// Smooth weighted round robin over the resolved address weights.
    #[default]
    WeightedRoundRobin,
}

impl BalancerPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
        }
    }
}

impl fmt::Display for BalancerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown balancer policy: {0}")]
pub struct UnknownPolicy(pub String);

impl FromStr for BalancerPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "weighted_round_robin" | "weighted" | "wrr" => Ok(Self::WeightedRoundRobin),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

/// RPC client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on each connection attempt, and on the initial blocking dial.
    pub dial_timeout: Duration,
    /// Make `dial` wait until a first connection is established.
    pub block_on_dial: bool,
    /// Deadline applied to calls that do not set their own.
    pub call_timeout: Option<Duration>,
    pub keep_alive: KeepAliveConfig,
    /// Largest frame accepted or sent, in bytes.
    pub max_message_size: usize,
    /// Maximum number of interceptor stages, defaults included.
    pub max_interceptors: usize,
    pub breaker: BreakerConfig,
    pub balancer: BalancerPolicy,
    /// Scheme addresses must carry to be used by this client.
    pub scheme: String,
    /// Bounded channel capacity for outbound frames per connection.
    pub outbound_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(3),
            block_on_dial: true,
            call_timeout: Some(Duration::from_secs(2)),
            keep_alive: KeepAliveConfig::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_interceptors: DEFAULT_MAX_INTERCEPTORS,
            breaker: BreakerConfig::default(),
            balancer: BalancerPolicy::default(),
            scheme: "rpc".to_string(),
            outbound_channel_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:0");
        assert_eq!(config.max_message_size, 4 * 1024 * 1024);
        assert_eq!(config.max_interceptors, DEFAULT_MAX_INTERCEPTORS);
        assert!(config.max_concurrent_calls.is_none());
        assert!(config.keep_alive.max_connection_age.is_none());
    }

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::default();
        assert!(config.block_on_dial);
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.balancer, BalancerPolicy::WeightedRoundRobin);
        assert_eq!(config.scheme, "rpc");
    }

    #[test]
    fn balancer_policy_parses_names() {
        assert_eq!("round_robin".parse(), Ok(BalancerPolicy::RoundRobin));
        assert_eq!(
            " Weighted_Round_Robin ".parse(),
            Ok(BalancerPolicy::WeightedRoundRobin)
        );
        assert_eq!(
            "p2c".parse::<BalancerPolicy>(),
            Err(UnknownPolicy("p2c".to_string()))
        );
        for policy in [BalancerPolicy::RoundRobin, BalancerPolicy::WeightedRoundRobin] {
            assert_eq!(policy.to_string().parse(), Ok(policy));
        }
    }
}
