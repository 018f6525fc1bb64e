//! Verification capabilities applied to downloaded and gossiped blocks.
//!
//! All checks are pure: the same headers and validator set snapshot always
//! give the same answer.

use containers::{headers_root, Block, BlockNumber, Bytes32, Checkpoint, Header, Milestone, ValidatorIndex, ValidatorSet};

use crate::types::PenaltyReason;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("block {number} body does not match its header")]
    BodyRootMismatch { number: BlockNumber },
    #[error("block {number} producer {} is not in the validator set", producer.0)]
    UnknownProducer {
        number: BlockNumber,
        producer: ValidatorIndex,
    },
    #[error("block {number} seal is invalid")]
    InvalidSeal { number: BlockNumber },
    #[error("block {number} does not link to its predecessor")]
    NotLinked { number: BlockNumber },
    #[error("block {number} timestamp does not increase")]
    TimestampNotIncreasing { number: BlockNumber },
    #[error("checkpoint {id} covers {start}..={end}, headers cover {got_start}..={got_end}")]
    CheckpointRange {
        id: u64,
        start: BlockNumber,
        end: BlockNumber,
        got_start: BlockNumber,
        got_end: BlockNumber,
    },
    #[error("checkpoint {id} root mismatch: expected {expected}, got {got}")]
    CheckpointRoot { id: u64, expected: Bytes32, got: Bytes32 },
    #[error("no headers to check against milestone {id}")]
    MilestoneEmpty { id: u64 },
    #[error("headers do not end at milestone {id} block {end}")]
    MilestoneRange { id: u64, end: BlockNumber },
    #[error("milestone {id} hash mismatch: expected {expected}, got {got}")]
    MilestoneHash { id: u64, expected: Bytes32, got: Bytes32 },
}

impl VerificationError {
    /// Penalty reported against the peer that served the data.
    pub fn penalty(&self) -> PenaltyReason {
        match self {
            VerificationError::CheckpointRange { .. } | VerificationError::CheckpointRoot { .. } => {
                PenaltyReason::CheckpointMismatch
            }
            VerificationError::MilestoneEmpty { .. }
            | VerificationError::MilestoneRange { .. }
            | VerificationError::MilestoneHash { .. } => PenaltyReason::MilestoneMismatch,
            _ => PenaltyReason::InvalidBlock,
        }
    }

    /// The header itself is invalid, so its hash can never become canonical.
    ///
    /// A body mismatch only condemns the peer's body, not the header.
    pub fn condemns_header(&self) -> Option<BlockNumber> {
        match self {
            VerificationError::UnknownProducer { number, .. }
            | VerificationError::InvalidSeal { number }
            | VerificationError::TimestampNotIncreasing { number } => Some(*number),
            _ => None,
        }
    }
}

/// Swappable verification strategy used by the downloader and orchestrator.
pub trait ChainVerifier: Send + Sync {
    /// Block-level rules over an ascending batch.
    fn verify_blocks(&self, blocks: &[Block], validators: &ValidatorSet) -> Result<(), VerificationError>;

    /// `headers` must be exactly the checkpoint range and reproduce its root.
    fn verify_checkpoint_headers(&self, checkpoint: &Checkpoint, headers: &[Header]) -> Result<(), VerificationError>;

    /// `headers` must be a linked run ending at the milestone block.
    fn verify_milestone_headers(&self, milestone: &Milestone, headers: &[Header]) -> Result<(), VerificationError>;
}

/// Seal-based verification against the oracle's validator set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusVerifier;

impl ConsensusVerifier {
    fn check_links(headers: &[Header]) -> Result<(), VerificationError> {
        for pair in headers.windows(2) {
            if !pair[0].is_parent_of(&pair[1]) {
                return Err(VerificationError::NotLinked { number: pair[1].number });
            }
        }
        Ok(())
    }
}

impl ChainVerifier for ConsensusVerifier {
    fn verify_blocks(&self, blocks: &[Block], validators: &ValidatorSet) -> Result<(), VerificationError> {
        let mut previous: Option<&Header> = None;
        for block in blocks {
            let header = &block.header;
            let number = header.number;

            if !block.body_matches_header() {
                return Err(VerificationError::BodyRootMismatch { number });
            }
            if !validators.contains(header.producer) {
                return Err(VerificationError::UnknownProducer {
                    number,
                    producer: header.producer,
                });
            }
            if !validators.verify_seal(header) {
                return Err(VerificationError::InvalidSeal { number });
            }
            if let Some(parent) = previous {
                if !parent.is_parent_of(header) {
                    return Err(VerificationError::NotLinked { number });
                }
                if header.timestamp <= parent.timestamp {
                    return Err(VerificationError::TimestampNotIncreasing { number });
                }
            }
            previous = Some(header);
        }
        Ok(())
    }

    fn verify_checkpoint_headers(&self, checkpoint: &Checkpoint, headers: &[Header]) -> Result<(), VerificationError> {
        let range_error = || VerificationError::CheckpointRange {
            id: checkpoint.id,
            start: checkpoint.start_block,
            end: checkpoint.end_block,
            got_start: headers.first().map(|h| h.number).unwrap_or_default(),
            got_end: headers.last().map(|h| h.number).unwrap_or_default(),
        };

        let (Some(first), Some(last)) = (headers.first(), headers.last()) else {
            return Err(range_error());
        };
        if first.number != checkpoint.start_block
            || last.number != checkpoint.end_block
            || headers.len() as u64 != checkpoint.start_block.span_to(checkpoint.end_block)
        {
            return Err(range_error());
        }
        Self::check_links(headers)?;

        let root = headers_root(headers);
        if root != checkpoint.root_hash {
            return Err(VerificationError::CheckpointRoot {
                id: checkpoint.id,
                expected: checkpoint.root_hash,
                got: root,
            });
        }
        Ok(())
    }

    fn verify_milestone_headers(&self, milestone: &Milestone, headers: &[Header]) -> Result<(), VerificationError> {
        let (Some(first), Some(last)) = (headers.first(), headers.last()) else {
            return Err(VerificationError::MilestoneEmpty { id: milestone.id });
        };
        if first.number < milestone.start_block || last.number != milestone.end_block {
            return Err(VerificationError::MilestoneRange {
                id: milestone.id,
                end: milestone.end_block,
            });
        }
        Self::check_links(headers)?;

        let hash = last.hash();
        if hash != milestone.hash {
            return Err(VerificationError::MilestoneHash {
                id: milestone.id,
                expected: milestone.hash,
                got: hash,
            });
        }
        Ok(())
    }
}
