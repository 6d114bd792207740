//! Adaptive client-side throttling (Google SRE style).
//!
//! Each [`Breaker`] keeps a rolling count of issued and accepted calls and
//! rejects new calls locally with a probability derived from the ratio.
//! [`BreakerGroup`] holds one breaker per call target.

pub mod group;
pub mod sre;
pub mod window;

pub use group::BreakerGroup;
pub use sre::{Breaker, BreakerConfig};
pub use window::RollingWindow;
