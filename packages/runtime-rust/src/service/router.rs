//! Method routing: dispatches a server-side [`Request`] to the handler
//! registered for its method name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use skiff_core::Status;

use super::call::{decode_message, CallResult, Request, Response};
use super::chain::{handler_fn, Handler};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Routes requests to handlers keyed by full method name
/// (e.g. `"/greeter.Greeter/SayHello"`).
///
/// Requests for an unregistered method return `Unimplemented`. Routes are
/// fixed before the server starts; the router is read-only while serving.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn Handler>>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method`, replacing any previous one.
    pub fn route(&mut self, method: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.routes.insert(method.into(), Arc::new(handler));
        self
    }

    /// Registers a typed unary handler. The request payload is decoded as
    /// `Req` and the returned `Resp` is encoded as the response payload.
    pub fn unary<Req, Resp, F, Fut>(&mut self, method: impl Into<String>, f: F) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.route(
            method,
            handler_fn(move |req: Request| {
                let f = Arc::clone(&f);
                async move {
                    let message: Req = decode_message(&req.payload)?;
                    let reply = f(message).await?;
                    Response::encode(&reply)
                }
            }),
        )
    }

    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.routes.contains_key(method)
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.routes.keys().cloned().collect();
        methods.sort();
        methods
    }
}

#[async_trait]
impl Handler for Router {
    async fn call(&self, req: Request) -> CallResult {
        match self.routes.get(&req.method) {
            Some(handler) => handler.call(req).await,
            None => Err(Status::unimplemented(format!(
                "unknown method {}",
                req.method
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde::Deserialize;
    use skiff_core::Code;

    use super::*;
    use crate::service::call::{encode_message, Side};

    #[derive(Debug, Serialize, Deserialize)]
    struct Hello {
        name: String,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Reply {
        message: String,
    }

    fn router() -> Router {
        let mut router = Router::new();
        router
            .route(
                "/echo/Echo",
                handler_fn(|req: Request| async move { Ok(Response::new(req.payload)) }),
            )
            .unary("/greeter/Hello", |hello: Hello| async move {
                Ok(Reply {
                    message: format!("hello {}", hello.name),
                })
            });
        router
    }

    #[tokio::test]
    async fn dispatches_by_method() {
        let resp = router()
            .call(Request::new(Side::Server, "/echo/Echo", Bytes::from_static(b"ping")))
            .await
            .unwrap();
        assert_eq!(resp.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let err = router()
            .call(Request::new(Side::Server, "/nope/Nope", Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::Unimplemented);
    }

    #[tokio::test]
    async fn unary_decodes_and_encodes() {
        let payload = encode_message(&Hello { name: "ada".into() }).unwrap();
        let resp = router()
            .call(Request::new(Side::Server, "/greeter/Hello", payload))
            .await
            .unwrap();
        assert_eq!(
            resp.decode::<Reply>().unwrap(),
            Reply {
                message: "hello ada".into()
            }
        );

        let err = router()
            .call(Request::new(Side::Server, "/greeter/Hello", Bytes::from_static(b"\xc1")))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn methods_are_listed_sorted() {
        assert_eq!(router().methods(), vec!["/echo/Echo", "/greeter/Hello"]);
        assert!(router().contains("/echo/Echo"));
    }
}
