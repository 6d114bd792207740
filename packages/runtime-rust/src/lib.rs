//! Skiff runtime: service registry and resolver over a coordination store,
//! a distributed mutex, an adaptive breaker, the interceptor chain, and the
//! RPC server and client built on it.

pub mod breaker;
pub mod discovery;
pub mod lock;
pub mod network;
pub mod service;
pub mod store;
pub mod task;
pub mod telemetry;

pub use breaker::{Breaker, BreakerConfig, BreakerGroup};
pub use discovery::{
    Address, DiscoveryError, DiscoveryProvider, Registrar, Resolver, ResolverBuilder,
    ServiceRegistry,
};
pub use lock::{DistributedMutex, LockError, Session, SessionOptions};
pub use network::{
    CallOptions, ClientConfig, DialError, RpcClient, RpcServer, RunningServer, ServerConfig,
    ServerError,
};
pub use service::{Chain, ChainError, Handler, Interceptor, Pipeline, Request, Response, Stage};
pub use store::{CoordinationStore, MemoryStore, StoreError};
