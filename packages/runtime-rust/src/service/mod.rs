//! Call pipeline shared by the RPC server and client.
//!
//! 1. **Call model** (`call`): `Request`/`Response` seen by every stage
//! 2. **Chain** (`chain`): ordered, length-capped stages composed into a `Pipeline`
//! 3. **Stages** (`middleware`): recovery, trace, log, metric, breaker, load shedding
//! 4. **Routing** (`router`): dispatch to handlers by method name

pub mod call;
pub mod chain;
pub mod middleware;
pub mod router;

pub use call::{decode_message, encode_message, BoxFuture, CallResult, Request, Response, Side};
pub use chain::{
    handler_fn, Chain, ChainError, Handler, HandlerFn, Interceptor, Next, Pipeline, Stage,
    DEFAULT_MAX_INTERCEPTORS,
};
pub use router::Router;
