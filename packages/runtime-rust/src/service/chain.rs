//! Ordered interceptor chains and the composed pipeline.
//!
//! Stages run in the order they were added, each wrapping the rest: the
//! first stage sees the request first and the response last.

use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;

use super::call::{BoxFuture, CallResult, Request};
use super::middleware::{BreakerStage, LoadShed, Log, Metric, Recovery, Trace};
use crate::breaker::BreakerGroup;

/// Default cap on the number of stages in one chain.
pub const DEFAULT_MAX_INTERCEPTORS: usize = 16;

/// A cross-cutting stage wrapped around every call.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Handles `req`, normally by delegating to `next` somewhere inside.
    async fn intercept(&self, req: Request, next: Next<'_>) -> CallResult;
}

/// Terminal step of a pipeline: the business handler on the server, the
/// transport on the client.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, req: Request) -> CallResult;
}

/// Adapts an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

/// Wraps `f` as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    async fn call(&self, req: Request) -> CallResult {
        (self.0)(req).await
    }
}

/// The remainder of a pipeline, handed to each stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Stage],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// Runs the remaining stages and then the handler.
    pub fn run(self, req: Request) -> BoxFuture<'a, CallResult> {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.intercept(
                req,
                Next {
                    stages: rest,
                    handler: self.handler,
                },
            ),
            None => self.handler.call(req),
        }
    }
}

/// One stage of a chain.
#[derive(Clone)]
pub enum Stage {
    /// Turns a panic further down into an `Internal` status.
    Recovery(Recovery),
    /// Opens a span and propagates the trace id.
    Trace(Trace),
    /// Logs the outcome and latency of every call.
    Log(Log),
    /// Records request counters and latency histograms.
    Metric(Metric),
    /// Adaptive client-side throttling per method.
    Breaker(BreakerStage),
    /// Caps concurrent calls, rejecting the excess as `Overloaded`.
    LoadShed(LoadShed),
    Custom(Arc<dyn Interceptor>),
}

impl Stage {
    #[must_use]
    pub fn custom(interceptor: impl Interceptor) -> Self {
        Self::Custom(Arc::new(interceptor))
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Recovery(_) => "recovery",
            Self::Trace(_) => "trace",
            Self::Log(_) => "log",
            Self::Metric(_) => "metric",
            Self::Breaker(_) => "breaker",
            Self::LoadShed(_) => "load_shed",
            Self::Custom(_) => "custom",
        }
    }

    fn intercept<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, CallResult> {
        match self {
            Self::Recovery(s) => s.intercept(req, next),
            Self::Trace(s) => s.intercept(req, next),
            Self::Log(s) => s.intercept(req, next),
            Self::Metric(s) => s.intercept(req, next),
            Self::Breaker(s) => s.intercept(req, next),
            Self::LoadShed(s) => s.intercept(req, next),
            Self::Custom(s) => s.intercept(req, next),
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("interceptor chain limited to {limit} stages, {requested} requested")]
    TooManyInterceptors { limit: usize, requested: usize },
}

/// An ordered, length-capped list of stages under construction.
#[derive(Debug, Clone)]
pub struct Chain {
    stages: Vec<Stage>,
    limit: usize,
}

impl Default for Chain {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_INTERCEPTORS)
    }
}

impl Chain {
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            stages: Vec::new(),
            limit,
        }
    }

    /// Recovery, trace, log, metric.
    #[must_use]
    pub fn server_stages() -> Vec<Stage> {
        vec![
            Stage::Recovery(Recovery),
            Stage::Trace(Trace),
            Stage::Log(Log),
            Stage::Metric(Metric),
        ]
    }

    /// Recovery, trace, log, breaker.
    #[must_use]
    pub fn client_stages(breakers: Arc<BreakerGroup>) -> Vec<Stage> {
        vec![
            Stage::Recovery(Recovery),
            Stage::Trace(Trace),
            Stage::Log(Log),
            Stage::Breaker(BreakerStage::new(breakers)),
        ]
    }

    /// A chain holding [`Chain::server_stages`].
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::TooManyInterceptors`] if `limit` is below four.
    pub fn server_defaults(limit: usize) -> Result<Self, ChainError> {
        let mut chain = Self::with_limit(limit);
        chain.extend(Self::server_stages())?;
        Ok(chain)
    }

    /// A chain holding [`Chain::client_stages`].
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::TooManyInterceptors`] if `limit` is below four.
    pub fn client_defaults(
        limit: usize,
        breakers: Arc<BreakerGroup>,
    ) -> Result<Self, ChainError> {
        let mut chain = Self::with_limit(limit);
        chain.extend(Self::client_stages(breakers))?;
        Ok(chain)
    }

    /// Appends one stage.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::TooManyInterceptors`] if the chain is full; the
    /// chain is left unchanged.
    pub fn push(&mut self, stage: Stage) -> Result<&mut Self, ChainError> {
        self.extend([stage])
    }

    /// Appends stages in order, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::TooManyInterceptors`] if the stages do not all
    /// fit; the chain is left unchanged.
    pub fn extend(
        &mut self,
        stages: impl IntoIterator<Item = Stage>,
    ) -> Result<&mut Self, ChainError> {
        let stages: Vec<Stage> = stages.into_iter().collect();
        let requested = self.stages.len() + stages.len();
        if requested > self.limit {
            return Err(ChainError::TooManyInterceptors {
                limit: self.limit,
                requested,
            });
        }
        self.stages.extend(stages);
        Ok(self)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Freezes the chain around `handler`.
    #[must_use]
    pub fn compose(self, handler: Arc<dyn Handler>) -> Pipeline {
        Pipeline {
            stages: self.stages.into(),
            handler,
        }
    }
}

/// An immutable chain bound to its terminal handler. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Stage]>,
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    /// Runs `req` through every stage and the handler.
    pub async fn handle(&self, req: Request) -> CallResult {
        Next {
            stages: &self.stages,
            handler: self.handler.as_ref(),
        }
        .run(req)
        .await
    }

    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }
}

impl tower::Service<Request> for Pipeline {
    type Response = super::call::Response;
    type Error = skiff_core::Status;
    type Future = BoxFuture<'static, CallResult>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let pipeline = self.clone();
        Box::pin(async move { pipeline.handle(req).await })
    }
}
