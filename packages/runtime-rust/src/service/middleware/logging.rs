//! Structured call logging.

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::service::call::{CallResult, Request};
use crate::service::chain::{Interceptor, Next};

/// Logs every call once it has finished, with code and latency.
///
/// Server faults are logged at `warn`; client errors such as bad arguments
/// or unknown methods at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Log;

#[async_trait]
impl Interceptor for Log {
    async fn intercept(&self, req: Request, next: Next<'_>) -> CallResult {
        let start = Instant::now();
        let side = req.side;
        let method = req.method.clone();
        let peer = req.peer.clone().unwrap_or_default();

        let result = next.run(req).await;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => info!(%side, %method, %peer, elapsed_ms, code = "ok", "call completed"),
            Err(status) if status.code.is_server_fault() => warn!(
                %side,
                %method,
                %peer,
                elapsed_ms,
                code = status.code.as_str(),
                message = %status.message,
                "call failed"
            ),
            Err(status) => info!(
                %side,
                %method,
                %peer,
                elapsed_ms,
                code = status.code.as_str(),
                message = %status.message,
                "call returned error"
            ),
        }
        result
    }
}
