//! Sync service configuration constants.
//!
//! Tunables that vary per deployment live in [`chain::SyncConfig`]; the
//! values here are structural limits of the pipeline.

pub use chain::SyncConfig;

/// Upper bound on peers tracked for quality bookkeeping.
pub const MAX_TRACKED_PEERS: usize = 100;

/// Maximum concurrent requests to a single peer.
pub const MAX_CONCURRENT_REQUESTS: usize = 2;

/// Commits buffered ahead of the store write loop.
pub const STORE_QUEUE_CAPACITY: usize = 16;
