//! Request counters and latency histograms via the `metrics` facade.
//!
//! Without an installed recorder every call here is a no-op.

use async_trait::async_trait;
use skiff_core::Code;
use tokio::time::Instant;

use crate::service::call::{CallResult, Request, Side};
use crate::service::chain::{Interceptor, Next};

pub const SERVER_REQUESTS_TOTAL: &str = "skiff_server_requests_total";
pub const SERVER_REQUEST_DURATION: &str = "skiff_server_request_duration_seconds";
pub const CLIENT_REQUESTS_TOTAL: &str = "skiff_client_requests_total";
pub const CLIENT_REQUEST_DURATION: &str = "skiff_client_request_duration_seconds";

/// Counts calls by method and status code and records their latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metric;

#[async_trait]
impl Interceptor for Metric {
    async fn intercept(&self, req: Request, next: Next<'_>) -> CallResult {
        let (requests, duration) = match req.side {
            Side::Server => (SERVER_REQUESTS_TOTAL, SERVER_REQUEST_DURATION),
            Side::Client => (CLIENT_REQUESTS_TOTAL, CLIENT_REQUEST_DURATION),
        };
        let method = req.method.clone();
        let start = Instant::now();

        let result = next.run(req).await;

        let code = result.as_ref().map_or_else(|s| s.code, |_| Code::Ok);
        ::metrics::counter!(requests, "method" => method.clone(), "code" => code.as_str())
            .increment(1);
        ::metrics::histogram!(duration, "method" => method).record(start.elapsed().as_secs_f64());
        result
    }
}
