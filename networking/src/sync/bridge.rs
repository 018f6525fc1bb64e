use anyhow::Result;
use async_trait::async_trait;
use containers::{BlockNumber, Header};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge rejected blocks {start}..={end}: {reason}")]
    Rejected {
        start: BlockNumber,
        end: BlockNumber,
        reason: String,
    },
    #[error("bridge could not unwind to block {0}")]
    Unwind(BlockNumber),
}

/// Cross-chain event relay that follows the committed chain.
///
/// The store calls [`process_new_blocks`](Self::process_new_blocks) only after
/// the execution engine acknowledged the blocks, and
/// [`unwind`](Self::unwind) before a reorg replaces them.
#[async_trait]
pub trait BridgeRelay: Send + Sync {
    async fn run(&self, shutdown: CancellationToken) -> Result<()>;

    async fn process_new_blocks(&self, headers: &[Header]) -> Result<(), BridgeError>;

    /// Forget events above `number`.
    async fn unwind(&self, number: BlockNumber) -> Result<(), BridgeError>;
}
