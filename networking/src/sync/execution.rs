use async_trait::async_trait;
use containers::{Block, BlockNumber, Bytes32, Header};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("parent {parent} of block {number} is unknown to the engine")]
    UnknownParent { number: BlockNumber, parent: Bytes32 },
    #[error("block {0} is unknown to the engine")]
    UnknownBlock(Bytes32),
    #[error("finalized block {0} is not on the canonical chain")]
    FinalizedNotCanonical(Bytes32),
    #[error("execution engine unavailable: {0}")]
    Unavailable(String),
}

/// Opaque execution engine: stores blocks and tracks the canonical chain.
///
/// Insertion alone never changes the canonical chain; only
/// [`update_fork_choice`](Self::update_fork_choice) does. Its acknowledgement
/// is what makes a block committed.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn insert_blocks(&self, blocks: Vec<Block>) -> Result<(), ExecutionError>;

    async fn update_fork_choice(&self, head: Bytes32, finalized: Option<Bytes32>) -> Result<(), ExecutionError>;

    /// Canonical head.
    async fn current_header(&self) -> Result<Header, ExecutionError>;

    /// Canonical header at `number`.
    async fn header_by_number(&self, number: BlockNumber) -> Result<Option<Header>, ExecutionError>;

    /// Any stored header, canonical or not.
    async fn header_by_hash(&self, hash: Bytes32) -> Result<Option<Header>, ExecutionError>;
}

/// Execution client used by the store.
#[derive(Clone)]
pub struct ExecutionClient {
    engine: Arc<dyn ExecutionEngine>,
}

impl ExecutionClient {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self { engine }
    }

    pub async fn insert_blocks(&self, blocks: Vec<Block>) -> Result<(), ExecutionError> {
        self.engine.insert_blocks(blocks).await
    }

    pub async fn update_fork_choice(&self, head: Bytes32, finalized: Option<Bytes32>) -> Result<(), ExecutionError> {
        self.engine.update_fork_choice(head, finalized).await
    }

    pub async fn current_header(&self) -> Result<Header, ExecutionError> {
        self.engine.current_header().await
    }

    pub async fn header_by_number(&self, number: BlockNumber) -> Result<Option<Header>, ExecutionError> {
        self.engine.header_by_number(number).await
    }

    pub async fn header_by_hash(&self, hash: Bytes32) -> Result<Option<Header>, ExecutionError> {
        self.engine.header_by_hash(hash).await
    }

    /// Whether `header` is the canonical header at its number.
    pub async fn is_canonical(&self, header: &Header) -> Result<bool, ExecutionError> {
        let canonical = self.engine.header_by_number(header.number).await?;
        Ok(canonical.is_some_and(|canonical| canonical == *header))
    }

    /// Canonical headers `from..=to`, stopping at the first gap.
    pub async fn canonical_headers(&self, from: BlockNumber, to: BlockNumber) -> Result<Vec<Header>, ExecutionError> {
        let mut headers = Vec::with_capacity(from.span_to(to) as usize);
        for number in from.0..=to.0 {
            match self.engine.header_by_number(BlockNumber(number)).await? {
                Some(header) => headers.push(header),
                None => break,
            }
        }
        Ok(headers)
    }
}

#[derive(Debug)]
struct EngineState {
    blocks: HashMap<Bytes32, Block>,
    canonical: BTreeMap<BlockNumber, Bytes32>,
    head: Bytes32,
    finalized: Option<Bytes32>,
    inserted: usize,
}

/// Execution engine that keeps every block in memory.
///
/// Used by the local devnet and by tests.
#[derive(Debug)]
pub struct InMemoryExecutionEngine {
    state: Mutex<EngineState>,
}

impl InMemoryExecutionEngine {
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.hash();
        let mut canonical = BTreeMap::new();
        canonical.insert(genesis.number(), hash);
        let mut blocks = HashMap::new();
        blocks.insert(hash, genesis);

        Self {
            state: Mutex::new(EngineState {
                blocks,
                canonical,
                head: hash,
                finalized: None,
                inserted: 0,
            }),
        }
    }

    /// Blocks accepted by `insert_blocks`, duplicates excluded.
    pub fn inserted_count(&self) -> usize {
        self.state.lock().inserted
    }

    pub fn finalized(&self) -> Option<Bytes32> {
        self.state.lock().finalized
    }

    pub fn head(&self) -> Bytes32 {
        self.state.lock().head
    }
}

#[async_trait]
impl ExecutionEngine for InMemoryExecutionEngine {
    async fn insert_blocks(&self, blocks: Vec<Block>) -> Result<(), ExecutionError> {
        let mut state = self.state.lock();
        for block in blocks {
            let hash = block.hash();
            if state.blocks.contains_key(&hash) {
                continue;
            }
            if !state.blocks.contains_key(&block.parent_hash()) {
                return Err(ExecutionError::UnknownParent {
                    number: block.number(),
                    parent: block.parent_hash(),
                });
            }
            state.blocks.insert(hash, block);
            state.inserted += 1;
        }
        Ok(())
    }

    async fn update_fork_choice(&self, head: Bytes32, finalized: Option<Bytes32>) -> Result<(), ExecutionError> {
        let mut state = self.state.lock();
        let head_number = state
            .blocks
            .get(&head)
            .map(Block::number)
            .ok_or(ExecutionError::UnknownBlock(head))?;

        // Rewrite the canonical index from the new head down to the fork point.
        let mut rewrites = Vec::new();
        let mut current = head;
        loop {
            let block = state.blocks.get(&current).ok_or(ExecutionError::UnknownBlock(current))?;
            let number = block.number();
            if state.canonical.get(&number) == Some(&current) {
                break;
            }
            rewrites.push((number, current));
            match number.prev() {
                Some(_) => current = block.parent_hash(),
                None => break,
            }
        }
        let depth = rewrites.len();
        for (number, hash) in rewrites {
            state.canonical.insert(number, hash);
        }
        state.canonical.split_off(&head_number.next());
        state.head = head;

        if let Some(finalized) = finalized {
            let canonical = state
                .blocks
                .get(&finalized)
                .is_some_and(|block| state.canonical.get(&block.number()) == Some(&finalized));
            if !canonical {
                return Err(ExecutionError::FinalizedNotCanonical(finalized));
            }
            state.finalized = Some(finalized);
        }

        debug!(head = head_number.0, rewritten = depth, "Updated fork choice");
        Ok(())
    }

    async fn current_header(&self) -> Result<Header, ExecutionError> {
        let state = self.state.lock();
        state
            .blocks
            .get(&state.head)
            .map(|block| block.header.clone())
            .ok_or(ExecutionError::UnknownBlock(state.head))
    }

    async fn header_by_number(&self, number: BlockNumber) -> Result<Option<Header>, ExecutionError> {
        let state = self.state.lock();
        Ok(state
            .canonical
            .get(&number)
            .and_then(|hash| state.blocks.get(hash))
            .map(|block| block.header.clone()))
    }

    async fn header_by_hash(&self, hash: Bytes32) -> Result<Option<Header>, ExecutionError> {
        Ok(self.state.lock().blocks.get(&hash).map(|block| block.header.clone()))
    }
}
