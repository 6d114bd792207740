//! Concurrency cap for server pipelines.
//!
//! Calls beyond the configured number in flight are rejected immediately
//! with `Overloaded` rather than queued.

use std::sync::Arc;

use async_trait::async_trait;
use skiff_core::Status;
use tokio::sync::Semaphore;

use crate::service::call::{CallResult, Request};
use crate::service::chain::{Interceptor, Next};

#[derive(Debug, Clone)]
pub struct LoadShed {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl LoadShed {
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            limit: max_concurrent,
        }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[async_trait]
impl Interceptor for LoadShed {
    async fn intercept(&self, req: Request, next: Next<'_>) -> CallResult {
        let Ok(_permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            return Err(Status::overloaded(format!(
                "server at its limit of {} concurrent calls",
                self.limit
            )));
        };
        next.run(req).await
    }
}
