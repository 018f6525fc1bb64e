//! Shared helpers for chain builder tests

#![allow(dead_code)]

use containers::generator::BlockFactory;
use containers::{Block, Bytes32, Header};
use fork_choice::CanonicalChainBuilder;

pub fn factory() -> BlockFactory {
    BlockFactory::new(4, 2)
}

/// Factory, genesis block and a builder rooted at genesis.
pub fn setup() -> (BlockFactory, Block, CanonicalChainBuilder) {
    let factory = factory();
    let genesis = factory.genesis();
    let builder = CanonicalChainBuilder::new(genesis.header.clone());
    (factory, genesis, builder)
}

pub fn branch(factory: &BlockFactory, parent: &Header, len: usize, salt: u8) -> Vec<Block> {
    factory.extend(parent, len, salt)
}

pub fn hashes(blocks: &[Block]) -> Vec<Bytes32> {
    blocks.iter().map(Block::hash).collect()
}
