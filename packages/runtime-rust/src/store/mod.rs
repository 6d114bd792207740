//! Coordination-store abstraction and the in-memory implementation.
//!
//! Registry, resolver and mutex talk to the store only through
//! [`CoordinationStore`], shared as `Arc<dyn CoordinationStore>`.

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{
    CoordinationStore, EventKind, KeyValue, LeaseId, Revision, StoreError, WatchEvent,
    WatchStream,
};
