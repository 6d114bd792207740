//! Skiff core: service records, registry key layout, RPC status codes and wire frames.

pub mod keys;
pub mod messages;
pub mod status;
pub mod types;

pub use messages::{Frame, FrameError, Metadata, RequestFrame, ResponseFrame};
pub use status::{Code, Status};
pub use types::{parse_weight, ServiceInfo, DEFAULT_WEIGHT};
