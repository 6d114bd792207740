//! Serving-state and drain control for a running RPC server.
//!
//! Uses `ArcSwap` for lock-free state reads, two cancellation tokens for the
//! drain and force signals, and an atomic counter with RAII guards for
//! in-flight call tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

/// Server lifecycle state.
///
/// State machine: Starting -> Serving -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingState {
    /// Listener not bound yet.
    Starting,
    /// Accepting connections and calls.
    Serving,
    /// No new calls accepted; in-flight calls are finishing.
    Draining,
    Stopped,
}

/// Coordinates graceful and forced shutdown across the accept loop, every
/// connection, and every in-flight call.
#[derive(Debug)]
pub struct ShutdownController {
    state: ArcSwap<ServingState>,
    in_flight: Arc<AtomicU64>,
    drain: CancellationToken,
    force: CancellationToken,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(ServingState::Starting),
            in_flight: Arc::new(AtomicU64::new(0)),
            drain: CancellationToken::new(),
            force: CancellationToken::new(),
        }
    }

    pub fn set_serving(&self) {
        self.state.store(Arc::new(ServingState::Serving));
    }

    #[must_use]
    pub fn state(&self) -> ServingState {
        **self.state.load()
    }

    /// Stops accepting new connections and calls.
    pub fn begin_drain(&self) {
        self.state.store(Arc::new(ServingState::Draining));
        self.drain.cancel();
    }

    /// Aborts every remaining call and closes every connection.
    pub fn force(&self) {
        self.drain.cancel();
        self.force.cancel();
    }

    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(ServingState::Stopped));
    }

    /// Token cancelled when draining starts.
    #[must_use]
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Token cancelled when shutdown is forced.
    #[must_use]
    pub fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    /// Tracks one in-flight call until the guard is dropped, including
    /// when the call task is aborted or panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
