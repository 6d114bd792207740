//! Distributed mutex bound to a lease-backed session.

pub mod mutex;
pub mod session;

use std::time::Duration;

use crate::store::StoreError;

pub use mutex::DistributedMutex;
pub use session::{Session, SessionOptions, DEFAULT_SESSION_TTL};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock not acquired within {0:?}")]
    Timeout(Duration),
    #[error("lock acquisition cancelled")]
    Cancelled,
    #[error("lock is held by another session")]
    Contended,
    #[error("lock is not held")]
    NotHeld,
    #[error("invalid lock path {0:?}")]
    InvalidPath(String),
    #[error("lock session is closed or its lease has expired")]
    SessionClosed,
    #[error(transparent)]
    Store(#[from] StoreError),
}
