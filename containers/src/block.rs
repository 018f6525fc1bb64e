use crate::{BlockNumber, Bytes32, ValidatorIndex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Consensus-relevant part of a block.
///
/// A header is immutable once sealed: its hash covers every field including
/// the producer seal, so any modification yields a different identity.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub number: BlockNumber,
    pub parent_hash: Bytes32,
    pub producer: ValidatorIndex,
    pub timestamp: u64,
    pub body_root: Bytes32,
    /// Producer seal over [`Header::seal_hash`].
    pub seal: Bytes32,
}

impl Header {
    /// Digest of every field except the seal. This is what producers sign.
    pub fn seal_hash(&self) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(self.number.0.to_le_bytes());
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(self.producer.0.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.body_root.as_bytes());
        finish(hasher)
    }

    pub fn hash(&self) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(self.seal_hash().as_bytes());
        hasher.update(self.seal.as_bytes());
        finish(hasher)
    }

    pub fn is_parent_of(&self, child: &Header) -> bool {
        child.parent_hash == self.hash() && child.number == self.number.next()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockBody {
    pub transactions: Vec<Vec<u8>>,
}

impl BlockBody {
    pub fn root(&self) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update((self.transactions.len() as u64).to_le_bytes());
        for tx in &self.transactions {
            hasher.update((tx.len() as u64).to_le_bytes());
            hasher.update(tx);
        }
        finish(hasher)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub body: BlockBody,
}

impl Block {
    pub fn new(header: Header, body: BlockBody) -> Self {
        Self { header, body }
    }

    pub fn hash(&self) -> Bytes32 {
        self.header.hash()
    }

    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    pub fn parent_hash(&self) -> Bytes32 {
        self.header.parent_hash
    }

    /// Check that the body matches the root committed in the header.
    pub fn body_matches_header(&self) -> bool {
        self.body.root() == self.header.body_root
    }
}

fn finish(hasher: Sha256) -> Bytes32 {
    let digest: [u8; 32] = hasher.finalize().into();
    Bytes32::from(digest)
}

/// Check that `headers` form one linked run of consecutive numbers.
pub fn is_linked(headers: &[Header]) -> bool {
    headers.windows(2).all(|pair| pair[0].is_parent_of(&pair[1]))
}
