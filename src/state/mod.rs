//! State management module for the Skyforge engine.
//!
//! This module provides persistent storage of the last-applied snapshot,
//! incremental per-node commits, and the run lock.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LOCK_RENEW_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    DeposedInstance, ID_OUTPUT, NodeRecord, RunHistoryEntry, RunOperation, RunSummary, STATE_VERSION,
    StateSnapshot,
};
