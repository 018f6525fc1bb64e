//! Proof-of-stake sidechain sync.
//!
//! Keeps the local execution layer on the canonical sidechain:
//!
//! - **Downloader**: fetches header and body ranges from peers, aligned to
//!   checkpoints, and rotates peers on failure
//! - **Verification**: producer seals, block linkage and checkpoint/milestone
//!   roots
//! - **Chain builder** (`fork_choice`): tree of unfinalized blocks above the
//!   last finality boundary
//! - **Store**: serialised commit path to the execution engine and bridge
//! - **Tip events**: bounded queue merging peer gossip with finality updates
//! - **Sync service**: orchestrates all of the above
//! - **Sync node**: runs every component as one fail-fast group
//!
//! ## State Machine
//!
//! - **IDLE**: not started
//! - **AWAITING_TIP**: following the chain, waiting for events
//! - **DOWNLOADING**: fetching a block range from peers
//! - **VERIFYING**: connecting verified blocks to the chain builder
//! - **RECONCILING**: applying finality or fork choice
//! - **COMMITTING**: writing a segment through the store
//! - **FAULTED**: backing off after a failure
//! - **STOPPED**: shut down
pub mod bridge;
pub mod config;
pub mod downloader;
pub mod execution;
pub mod node;
pub mod oracle;
pub mod peer_manager;
pub mod service;
pub mod states;
pub mod store;
pub mod tip_events;
pub mod verification;

pub use bridge::{BridgeError, BridgeRelay};
pub use config::*;
pub use downloader::{AttemptError, BadBlocks, BlockDownloader, DownloadError, DownloadTarget};
pub use execution::{ExecutionClient, ExecutionEngine, ExecutionError, InMemoryExecutionEngine};
pub use node::{SyncNode, TaskError};
pub use oracle::{FinalityEvent, FinalityOracle, OracleError};
pub use peer_manager::{PeerManager, SyncPeer};
pub use service::{SyncError, SyncService};
pub use states::SyncState;
pub use store::{CommitReceipt, Store, StoreError};
pub use tip_events::{TipEvent, TipEvents};
pub use verification::{ChainVerifier, ConsensusVerifier, VerificationError};

#[cfg(test)]
mod tests;
