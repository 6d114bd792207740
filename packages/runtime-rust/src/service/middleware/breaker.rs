//! Client stage that consults the adaptive breaker before every call.

use std::sync::Arc;

use async_trait::async_trait;
use skiff_core::Status;
use tracing::debug;

use crate::breaker::BreakerGroup;
use crate::service::call::{CallResult, Request};
use crate::service::chain::{Interceptor, Next};

pub const BREAKER_REJECTIONS_TOTAL: &str = "skiff_client_breaker_rejections_total";

/// Short-circuits calls the breaker for their method rejects, answering
/// `Overloaded` without touching the network. Issued calls feed their
/// outcome back: only server-fault codes count as failures.
#[derive(Debug, Clone)]
pub struct BreakerStage {
    group: Arc<BreakerGroup>,
}

impl BreakerStage {
    #[must_use]
    pub fn new(group: Arc<BreakerGroup>) -> Self {
        Self { group }
    }

    #[must_use]
    pub fn group(&self) -> &Arc<BreakerGroup> {
        &self.group
    }
}

#[async_trait]
impl Interceptor for BreakerStage {
    async fn intercept(&self, req: Request, next: Next<'_>) -> CallResult {
        let breaker = self.group.get(&req.method);
        if !breaker.allow() {
            ::metrics::counter!(BREAKER_REJECTIONS_TOTAL, "target" => req.method.clone()).increment(1);
            debug!(method = %req.method, "call rejected by breaker");
            return Err(Status::overloaded(format!(
                "{} rejected by adaptive breaker",
                req.method
            )));
        }

        let result = next.run(req).await;
        match &result {
            Err(status) if status.code.is_server_fault() => breaker.mark_failed(),
            _ => breaker.mark_success(),
        }
        result
    }
}
