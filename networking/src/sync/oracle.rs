use anyhow::Result;
use async_trait::async_trait;
use containers::{BlockNumber, Checkpoint, Milestone, ValidatorSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("finality oracle unavailable: {0}")]
    Unavailable(String),
    #[error("no validator set known for block {0}")]
    UnknownValidatorSet(BlockNumber),
}

/// Finality data pushed by the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalityEvent {
    Checkpoint(Checkpoint),
    Milestone(Milestone),
}

/// Client of the external consensus oracle issuing checkpoints and milestones.
#[async_trait]
pub trait FinalityOracle: Send + Sync {
    /// Poll or stream from the oracle until `shutdown` is cancelled.
    async fn run(&self, shutdown: CancellationToken) -> Result<()>;

    async fn latest_checkpoint(&self) -> Result<Option<Checkpoint>, OracleError>;

    async fn latest_milestone(&self) -> Result<Option<Milestone>, OracleError>;

    /// Checkpoint whose range contains `number`, if one has been issued.
    async fn checkpoint_covering(&self, number: BlockNumber) -> Result<Option<Checkpoint>, OracleError>;

    /// Producer set authorised to seal `number`.
    async fn validator_set(&self, number: BlockNumber) -> Result<ValidatorSet, OracleError>;

    /// New checkpoints and milestones as they are accepted.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<FinalityEvent>;
}
