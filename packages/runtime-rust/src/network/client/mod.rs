//! RPC client: target resolution, connection pool, balancing, keep-alive.
//!
//! A client owns one [`Resolver`] for its target, one multiplexed
//! [`Connection`] per backend address it has talked to, and the composed
//! client interceptor pipeline. The pipeline's terminal handler picks an
//! address through the [`Balancer`] and sends the call on that address's
//! connection.

pub mod balancer;
pub mod connection;
pub mod target;

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use skiff_core::{Metadata, Status, DEFAULT_WEIGHT};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::breaker::BreakerGroup;
use crate::discovery::{Address, DiscoveryError, DiscoveryProvider, Resolver};
use crate::network::config::ClientConfig;
use crate::service::{
    encode_message, CallResult, Chain, ChainError, Handler, Pipeline, Request, Response, Side,
    Stage,
};
use crate::task::OwnedTask;

pub use balancer::Balancer;
pub use connection::Connection;
pub use target::{InvalidTarget, Target};

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error(transparent)]
    InvalidTarget(#[from] InvalidTarget),
    #[error("target {0} needs a discovery provider")]
    NoDiscovery(String),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("target resolved to no addresses")]
    NoAddresses,
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides [`ClientConfig::call_timeout`] for this call.
    pub timeout: Option<Duration>,
    pub metadata: Metadata,
}

impl CallOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Terminal handler of the client pipeline.
struct Transport {
    config: ClientConfig,
    addresses: watch::Receiver<Vec<Address>>,
    balancer: Balancer,
    pool: DashMap<String, Arc<Connection>>,
}

impl Transport {
    /// Returns the pooled connection for `addr`, dialing a new one if there
    /// is none or the pooled one is no longer usable.
    async fn connection(&self, addr: &str) -> io::Result<Arc<Connection>> {
        let pooled = self.pool.get(addr).map(|c| Arc::clone(c.value()));
        if let Some(conn) = pooled.filter(|c| c.is_usable()) {
            return Ok(conn);
        }
        let conn = Connection::connect(addr, &self.config).await?;
        self.pool.insert(addr.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Waits for the first address list and connects to one of its
    /// addresses. Fails with the first connect error if none is reachable.
    async fn connect_any(&self) -> Result<(), DialError> {
        let mut rx = self.addresses.clone();
        let addresses: Vec<Address> = rx
            .wait_for(|a| !a.is_empty())
            .await
            .map_err(|_| DialError::NoAddresses)?
            .clone();

        let mut first_err = None;
        for address in &addresses {
            match self.connection(&address.addr).await {
                Ok(_) => return Ok(()),
                Err(source) => {
                    debug!(addr = %address.addr, error = %source, "dial attempt failed");
                    first_err.get_or_insert(DialError::Connect {
                        addr: address.addr.clone(),
                        source,
                    });
                }
            }
        }
        Err(first_err.unwrap_or(DialError::NoAddresses))
    }

    fn prune(&self, live: &[Address]) {
        let live: HashSet<&str> = live.iter().map(|a| a.addr.as_str()).collect();
        self.pool.retain(|addr, _| {
            let keep = live.contains(addr.as_str());
            if !keep {
                debug!(addr = %addr, "dropping connection to removed address");
            }
            keep
        });
    }
}

#[async_trait]
impl Handler for Transport {
    async fn call(&self, mut req: Request) -> CallResult {
        let addresses = self.addresses.borrow().clone();
        if addresses.is_empty() {
            return Err(Status::unavailable(format!(
                "no addresses available for {}",
                req.method
            )));
        }

        let mut last_err = String::new();
        for _ in 0..addresses.len() {
            let Some(address) = self.balancer.pick(&addresses) else {
                break;
            };
            match self.connection(&address.addr).await {
                Ok(conn) => {
                    req.peer = Some(address.addr);
                    return conn.invoke(req).await;
                }
                Err(e) => {
                    warn!(addr = %address.addr, error = %e, "connect failed; trying next address");
                    last_err = format!("{}: {e}", address.addr);
                }
            }
        }
        Err(Status::unavailable(format!(
            "no reachable address for {} (last error {last_err})",
            req.method
        )))
    }
}

/// A dialed RPC client. Cheap calls, one per [`RpcClient::invoke`].
pub struct RpcClient {
    target: Target,
    config: ClientConfig,
    pipeline: Pipeline,
    transport: Arc<Transport>,
    breakers: Arc<BreakerGroup>,
    resolver: Option<Resolver>,
    prune: Option<OwnedTask>,
}

impl RpcClient {
    /// Dials `target` with the default client chain.
    ///
    /// `target` is `host:port`, `direct:///a:1,b:2` or
    /// `discovery:///<service>`; the last needs a `discovery` provider.
    ///
    /// # Errors
    ///
    /// Returns a [`DialError`] if the target is malformed or cannot be
    /// resolved, or, with `block_on_dial`, if no connection could be
    /// established within `dial_timeout`.
    pub async fn dial(
        target: &str,
        config: ClientConfig,
        discovery: Option<Arc<dyn DiscoveryProvider>>,
    ) -> Result<Self, DialError> {
        Self::dial_with_stages(target, config, discovery, Vec::new()).await
    }

    /// Like [`RpcClient::dial`], appending `stages` after the default
    /// client chain.
    ///
    /// # Errors
    ///
    /// As [`RpcClient::dial`], plus [`DialError::Chain`] when the stages
    /// exceed `max_interceptors`.
    pub async fn dial_with_stages(
        target: &str,
        config: ClientConfig,
        discovery: Option<Arc<dyn DiscoveryProvider>>,
        stages: Vec<Stage>,
    ) -> Result<Self, DialError> {
        let target: Target = target.parse()?;
        let breakers = Arc::new(BreakerGroup::new(config.breaker.clone()));
        let mut chain = Chain::client_defaults(config.max_interceptors, Arc::clone(&breakers))?;
        chain.extend(stages)?;

        let resolver = match &target {
            Target::Direct(endpoints) => Resolver::fixed(
                target.to_string(),
                endpoints
                    .iter()
                    .map(|e| Address::new(e.clone(), DEFAULT_WEIGHT, config.scheme.clone()))
                    .collect(),
            ),
            Target::Discovery(name) => {
                let provider = discovery.ok_or_else(|| DialError::NoDiscovery(target.to_string()))?;
                provider.build(name).await?
            }
        };

        let transport = Arc::new(Transport {
            config: config.clone(),
            addresses: resolver.subscribe(),
            balancer: Balancer::new(config.balancer),
            pool: DashMap::new(),
        });

        if config.block_on_dial {
            match tokio::time::timeout(config.dial_timeout, transport.connect_any()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    resolver.close().await;
                    return Err(e);
                }
                Err(_) => {
                    resolver.close().await;
                    return Err(DialError::Timeout(config.dial_timeout));
                }
            }
        }

        let prune = {
            let transport = Arc::clone(&transport);
            let mut rx = resolver.subscribe();
            OwnedTask::spawn("rpc-client-prune", move |cancel| async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            let live = rx.borrow_and_update().clone();
                            transport.prune(&live);
                        }
                    }
                }
            })
        };

        info!(dial_target = %target, policy = %config.balancer, "rpc client dialed");
        let pipeline = chain.compose(Arc::clone(&transport) as Arc<dyn Handler>);
        Ok(Self {
            target,
            config,
            pipeline,
            transport,
            breakers,
            resolver: Some(resolver),
            prune: Some(prune),
        })
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Breakers keyed by method, shared with the breaker stage.
    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerGroup> {
        &self.breakers
    }

    /// Current resolved address list.
    #[must_use]
    pub fn addresses(&self) -> Vec<Address> {
        self.transport.addresses.borrow().clone()
    }

    /// Number of pooled connections.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.transport.pool.len()
    }

    /// Sends a raw call through the client pipeline.
    pub async fn invoke(
        &self,
        method: &str,
        payload: impl Into<Bytes>,
        options: CallOptions,
    ) -> CallResult {
        let mut req = Request::new(Side::Client, method, payload);
        req.metadata = options.metadata;
        req.deadline = options
            .timeout
            .or(self.config.call_timeout)
            .map(|t| Instant::now() + t);
        self.pipeline.handle(req).await
    }

    /// Sends a `MsgPack`-encoded request and decodes the response.
    ///
    /// # Errors
    ///
    /// Returns the call's status, or `Internal` if either side of the
    /// exchange fails to (de)serialize.
    pub async fn call<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp, Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = encode_message(request)?;
        let response: Response = self.invoke(method, payload, options).await?;
        response.decode()
    }

    /// Stops resolving and closes every pooled connection. Calls still in
    /// flight fail with `Unavailable`.
    pub async fn close(mut self) {
        if let Some(prune) = self.prune.take() {
            prune.stop().await;
        }
        if let Some(resolver) = self.resolver.take() {
            resolver.close().await;
        }
        let connections: Vec<Arc<Connection>> = self
            .transport
            .pool
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect();
        self.transport.pool.clear();
        for conn in connections {
            conn.close().await;
        }
        info!(dial_target = %self.target, "rpc client closed");
    }
}
