//! Trace stage: one span per call, with the trace id carried in metadata.

use async_trait::async_trait;
use skiff_core::messages::TRACE_ID_KEY;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::service::call::{CallResult, Request};
use crate::service::chain::{Interceptor, Next};

/// Reuses the caller's `x-trace-id` or mints a new one, runs the rest of the
/// chain inside an `rpc` span, and echoes the id on the response.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trace;

#[async_trait]
impl Interceptor for Trace {
    async fn intercept(&self, mut req: Request, next: Next<'_>) -> CallResult {
        let trace_id = req
            .metadata
            .entry(TRACE_ID_KEY.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let span = info_span!(
            "rpc",
            side = %req.side,
            method = %req.method,
            trace_id = %trace_id,
        );

        let mut result = next.run(req).instrument(span).await;
        if let Ok(resp) = &mut result {
            resp.metadata
                .entry(TRACE_ID_KEY.to_string())
                .or_insert(trace_id);
        }
        result
    }
}
