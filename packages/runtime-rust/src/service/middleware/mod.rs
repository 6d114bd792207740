//! Built-in interceptor stages.
//!
//! - [`recovery`]: panic to `Internal` status
//! - [`trace`]: per-call span and trace id propagation
//! - [`logging`]: structured outcome logging
//! - [`metrics`]: request counters and latency histograms
//! - [`breaker`]: adaptive client-side throttling
//! - [`load_shed`]: server concurrency cap

pub mod breaker;
pub mod load_shed;
pub mod logging;
pub mod metrics;
pub mod recovery;
pub mod trace;

pub use breaker::BreakerStage;
pub use load_shed::LoadShed;
pub use logging::Log;
pub use metrics::Metric;
pub use recovery::Recovery;
pub use trace::Trace;
