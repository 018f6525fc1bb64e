//! Deterministic block production for the local devnet and for tests.

use crate::{Block, BlockBody, BlockNumber, Bytes32, Header, Validator, ValidatorIndex, ValidatorSet};
use sha2::{Digest, Sha256};

/// Produces sealed, linked blocks from a fixed validator set.
///
/// Each block is sealed by the in-turn producer for its number. `salt` is
/// folded into the body so two calls with different salts produce competing
/// forks from the same parent.
#[derive(Clone, Debug)]
pub struct BlockFactory {
    validators: ValidatorSet,
    block_period: u64,
}

impl BlockFactory {
    pub fn new(validator_count: u64, block_period: u64) -> Self {
        let validators = (0..validator_count.max(1))
            .map(|index| Validator {
                index: ValidatorIndex(index),
                signing_key: derive_key(index),
            })
            .collect();

        Self {
            validators: ValidatorSet::new(validators),
            block_period,
        }
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn genesis(&self) -> Block {
        self.seal(BlockNumber(0), Bytes32::ZERO, 0, BlockBody::default())
    }

    pub fn child(&self, parent: &Header, salt: u8) -> Block {
        let number = parent.number.next();
        let body = BlockBody {
            transactions: vec![[&[salt][..], &number.0.to_le_bytes()[..]].concat()],
        };
        self.seal(number, parent.hash(), parent.timestamp + self.block_period, body)
    }

    /// `count` blocks on top of `parent`, in ascending order.
    pub fn extend(&self, parent: &Header, count: usize, salt: u8) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::with_capacity(count);
        for _ in 0..count {
            let block = {
                let tip = blocks.last().map_or(parent, |block| &block.header);
                self.child(tip, salt)
            };
            blocks.push(block);
        }
        blocks
    }

    fn seal(&self, number: BlockNumber, parent_hash: Bytes32, timestamp: u64, body: BlockBody) -> Block {
        let mut header = Header {
            number,
            parent_hash,
            producer: ValidatorIndex(0),
            timestamp,
            body_root: body.root(),
            seal: Bytes32::ZERO,
        };
        if let Some(producer) = self.validators.in_turn(number.0) {
            producer.sign_header(&mut header);
        }
        Block::new(header, body)
    }
}

fn derive_key(index: u64) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(b"validator");
    hasher.update(index.to_le_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    Bytes32::from(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_linked;

    #[test]
    fn test_extend_produces_linked_sealed_chain() {
        let factory = BlockFactory::new(4, 2);
        let genesis = factory.genesis();
        let blocks = factory.extend(&genesis.header, 6, 0);

        assert_eq!(blocks.len(), 6);
        assert_eq!(blocks[0].parent_hash(), genesis.hash());
        let headers: Vec<Header> = blocks.iter().map(|b| b.header.clone()).collect();
        assert!(is_linked(&headers));
        for block in &blocks {
            assert!(factory.validators().verify_seal(&block.header));
            assert!(block.body_matches_header());
        }
    }

    #[test]
    fn test_salt_forks() {
        let factory = BlockFactory::new(4, 2);
        let genesis = factory.genesis();
        let a = factory.child(&genesis.header, 0);
        let b = factory.child(&genesis.header, 1);
        assert_eq!(a.number(), b.number());
        assert_ne!(a.hash(), b.hash());
    }
}
