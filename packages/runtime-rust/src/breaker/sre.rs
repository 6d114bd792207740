use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

use super::window::RollingWindow;

/// Tuning for the adaptive throttling formula.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Accept multiplier. Lower values throttle more aggressively.
    pub k: f64,
    /// Length of the sliding window.
    pub window: Duration,
    /// Number of buckets the window is split into.
    pub buckets: u32,
    /// Issued calls needed in the window before any call is rejected.
    pub min_requests: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            k: 1.5,
            window: Duration::from_secs(10),
            buckets: 40,
            min_requests: 100,
        }
    }
}

/// Client-side adaptive throttle.
///
/// Rejects locally with probability
/// `max(0, (requests - k * accepts) / (requests + 1))` over the window.
/// There is no open/half-open/closed state: the probability falls back
/// towards zero by itself as accepted calls refill the window.
#[derive(Debug)]
pub struct Breaker {
    config: BreakerConfig,
    window: Mutex<RollingWindow>,
}

impl Breaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        let window = RollingWindow::new(config.window, config.buckets, Instant::now());
        Self {
            config,
            window: Mutex::new(window),
        }
    }

    /// Decides whether a call may be issued.
    ///
    /// A rejected call is recorded as issued but not accepted.
    pub fn allow(&self) -> bool {
        let p = self.reject_probability();
        if p > 0.0 && rand::rng().random::<f64>() < p {
            self.window.lock().add(Instant::now(), 1, 0);
            return false;
        }
        true
    }

    pub fn mark_success(&self) {
        self.window.lock().add(Instant::now(), 1, 1);
    }

    pub fn mark_failed(&self) {
        self.window.lock().add(Instant::now(), 1, 0);
    }

    /// Current rejection probability in `[0, 1)`.
    #[must_use]
    pub fn reject_probability(&self) -> f64 {
        let (requests, accepts) = self.window.lock().totals(Instant::now());
        if requests < self.config.min_requests {
            return 0.0;
        }
        // Window counts stay far below 2^52.
        #[allow(clippy::cast_precision_loss)]
        let (requests, accepts) = (requests as f64, accepts as f64);
        ((requests - self.config.k * accepts) / (requests + 1.0)).max(0.0)
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }
}

impl Default for Breaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
