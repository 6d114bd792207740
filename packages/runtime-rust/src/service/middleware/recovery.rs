//! Panic recovery stage.
//!
//! Catches a panic anywhere further down the chain (including the handler)
//! and answers with a generic `Internal` status, so one bad call never takes
//! the connection or the process down with it.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use skiff_core::Status;
use tracing::error;

use crate::service::call::{CallResult, Request};
use crate::service::chain::{Interceptor, Next};

#[derive(Debug, Clone, Copy, Default)]
pub struct Recovery;

#[async_trait]
impl Interceptor for Recovery {
    async fn intercept(&self, req: Request, next: Next<'_>) -> CallResult {
        let method = req.method.clone();
        let side = req.side;
        match AssertUnwindSafe(next.run(req)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                error!(
                    %side,
                    method = %method,
                    panic = panic_message(payload.as_ref()),
                    "call panicked; recovered"
                );
                Err(Status::internal("internal error"))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use skiff_core::Code;

    use crate::service::call::{Response, Side};
    use crate::service::chain::{handler_fn, Chain, Stage};

    use super::*;

    #[tokio::test]
    async fn handler_panic_becomes_internal_status() {
        let mut chain = Chain::default();
        chain.push(Stage::Recovery(Recovery)).unwrap();
        let pipeline = chain.compose(Arc::new(handler_fn(|req: Request| async move {
            if req.payload.is_empty() {
                panic!("boom");
            }
            Ok(Response::new(req.payload))
        })));

        let err = pipeline
            .handle(Request::new(Side::Server, "/t/Panic", Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::Internal);
        assert_eq!(err.message, "internal error");

        // The pipeline is still usable afterwards.
        let ok = pipeline
            .handle(Request::new(Side::Server, "/t/Panic", Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert_eq!(ok.payload, Bytes::from_static(b"x"));
    }

    #[test]
    fn panic_message_handles_common_payloads() {
        let a: Box<dyn Any + Send> = Box::new("static");
        let b: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let c: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(a.as_ref()), "static");
        assert_eq!(panic_message(b.as_ref()), "owned");
        assert_eq!(panic_message(c.as_ref()), "non-string panic payload");
    }
}
