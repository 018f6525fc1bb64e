use crate::{BlockNumber, Bytes32};
use serde::{Deserialize, Serialize};

/// Oracle-attested finality over an inclusive block range.
///
/// Once accepted, every block up to `end_block` is final. Checkpoints are
/// issued with strictly increasing ranges.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: u64,
    pub start_block: BlockNumber,
    pub end_block: BlockNumber,
    /// Root over the hashes of every header in the range.
    pub root_hash: Bytes32,
}

impl Checkpoint {
    pub fn contains(&self, number: BlockNumber) -> bool {
        self.start_block <= number && number <= self.end_block
    }

    pub fn len(&self) -> u64 {
        self.start_block.span_to(self.end_block)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Oracle-attested hash of a single block, the end of `start_block..=end_block`.
///
/// Weaker than a checkpoint, but authoritative for discarding forks that
/// disagree with it above the last checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: u64,
    pub start_block: BlockNumber,
    pub end_block: BlockNumber,
    pub hash: Bytes32,
}

impl Milestone {
    pub fn contains(&self, number: BlockNumber) -> bool {
        self.start_block <= number && number <= self.end_block
    }
}
