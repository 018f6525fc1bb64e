use anyhow::{bail, Result};
use containers::{Block, BlockNumber, Bytes32, Header};
use metrics::SharedMetrics;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bridge::{BridgeError, BridgeRelay};
use super::config::STORE_QUEUE_CAPACITY;
use super::execution::{ExecutionClient, ExecutionError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("block {number} does not follow the previous block in the segment")]
    NotContiguous { number: BlockNumber },
    #[error("segment starts at {start} but the canonical head is {head}")]
    Gap { start: BlockNumber, head: BlockNumber },
    #[error("parent {parent} of block {number} is not canonical")]
    ParentNotCanonical { number: BlockNumber, parent: Bytes32 },
    #[error("block {number} would replace finalized block {finalized}")]
    BelowFinalized {
        number: BlockNumber,
        finalized: BlockNumber,
    },
    #[error("finalized block {hash} is not canonical")]
    FinalizedNotCanonical { hash: Bytes32 },
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("store is not running")]
    Closed,
}

impl StoreError {
    /// The segment disagrees with the committed chain. Recoverable by
    /// re-anchoring; everything else is a broken collaborator.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            StoreError::NotContiguous { .. }
                | StoreError::Gap { .. }
                | StoreError::ParentNotCanonical { .. }
                | StoreError::BelowFinalized { .. }
                | StoreError::FinalizedNotCanonical { .. }
        )
    }
}

/// Result of an acknowledged commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Canonical head after the commit.
    pub head: Header,
    /// Blocks that were not canonical before.
    pub inserted: usize,
    /// Set when the commit replaced canonical blocks above this number.
    pub unwound_to: Option<BlockNumber>,
}

enum StoreCommand {
    Commit {
        blocks: Vec<Block>,
        finalized: Option<Bytes32>,
        ack: oneshot::Sender<Result<CommitReceipt, StoreError>>,
    },
}

/// Single writer in front of the execution client.
///
/// Commits are queued to [`run`](Self::run) and applied one at a time, so
/// inserts and fork-choice updates never interleave between callers.
pub struct Store {
    execution: ExecutionClient,
    bridge: Arc<dyn BridgeRelay>,
    commands: mpsc::Sender<StoreCommand>,
    receiver: Mutex<Option<mpsc::Receiver<StoreCommand>>>,
    finalized: Mutex<Option<Header>>,
    metrics: Option<SharedMetrics>,
}

impl Store {
    pub fn new(execution: ExecutionClient, bridge: Arc<dyn BridgeRelay>, metrics: Option<SharedMetrics>) -> Self {
        let (commands, receiver) = mpsc::channel(STORE_QUEUE_CAPACITY);
        Self {
            execution,
            bridge,
            commands,
            receiver: Mutex::new(Some(receiver)),
            finalized: Mutex::new(None),
            metrics,
        }
    }

    /// Commit an ascending, linked segment and make its last block the head.
    ///
    /// Blocks already canonical are skipped, so committing the same segment
    /// twice is a no-op. A segment with nothing new still moves the finalized
    /// block to `finalized`.
    pub async fn commit(&self, blocks: Vec<Block>, finalized: Option<Bytes32>) -> Result<CommitReceipt, StoreError> {
        let (ack, response) = oneshot::channel();
        self.commands
            .send(StoreCommand::Commit { blocks, finalized, ack })
            .await
            .map_err(|_| StoreError::Closed)?;
        response.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn canonical_head(&self) -> Result<Header, StoreError> {
        Ok(self.execution.current_header().await?)
    }

    /// Canonical headers `from..=to`, shorter if the chain ends earlier.
    pub async fn canonical_headers(&self, from: BlockNumber, to: BlockNumber) -> Result<Vec<Header>, StoreError> {
        Ok(self.execution.canonical_headers(from, to).await?)
    }

    /// Latest finalized header acknowledged by the engine.
    pub fn finalized(&self) -> Option<Header> {
        self.finalized.lock().clone()
    }

    /// Apply queued commits until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let Some(mut receiver) = self.receiver.lock().take() else {
            bail!("store write loop already started");
        };
        info!("Store write loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = receiver.recv() => match command {
                    Some(StoreCommand::Commit { blocks, finalized, ack }) => {
                        let result = self.apply(blocks, finalized).await;
                        if let Err(err) = &result {
                            warn!(error = %err, "Commit rejected");
                        }
                        // The caller may have been cancelled while waiting.
                        let _ = ack.send(result);
                    }
                    None => break,
                },
            }
        }

        debug!("Store write loop stopped");
        Ok(())
    }

    async fn apply(&self, blocks: Vec<Block>, finalized: Option<Bytes32>) -> Result<CommitReceipt, StoreError> {
        for pair in blocks.windows(2) {
            if !pair[0].header.is_parent_of(&pair[1].header) {
                return Err(StoreError::NotContiguous {
                    number: pair[1].number(),
                });
            }
        }

        let head = self.execution.current_header().await?;

        let mut skip = 0;
        for block in &blocks {
            if !self.execution.is_canonical(&block.header).await? {
                break;
            }
            skip += 1;
        }
        let segment: Vec<Block> = blocks.into_iter().skip(skip).collect();
        let Some(first) = segment.first() else {
            self.advance_finalized(&head, finalized).await?;
            return Ok(CommitReceipt {
                head,
                inserted: 0,
                unwound_to: None,
            });
        };

        let start = first.number();
        let parent = start.prev().map(|number| (number, first.parent_hash()));
        match parent {
            Some((number, _)) if number > head.number => {
                return Err(StoreError::Gap {
                    start,
                    head: head.number,
                });
            }
            Some((number, hash)) => {
                let canonical = self.execution.header_by_number(number).await?;
                if canonical.map(|header| header.hash()) != Some(hash) {
                    return Err(StoreError::ParentNotCanonical { number: start, parent: hash });
                }
            }
            None => {
                return Err(StoreError::ParentNotCanonical {
                    number: start,
                    parent: first.parent_hash(),
                });
            }
        }

        let unwound_to = if start <= head.number {
            let ancestor = BlockNumber(start.0 - 1);
            let finalized_number = self.finalized.lock().as_ref().map(|header| header.number);
            if let Some(finalized) = finalized_number.filter(|finalized| start <= *finalized) {
                return Err(StoreError::BelowFinalized {
                    number: start,
                    finalized,
                });
            }
            self.bridge.unwind(ancestor).await?;
            info!(
                from = head.number.0,
                to = ancestor.0,
                "Unwinding canonical chain"
            );
            Some(ancestor)
        } else {
            None
        };

        let headers: Vec<Header> = segment.iter().map(|block| block.header.clone()).collect();
        let inserted = segment.len();
        let Some(new_head) = headers.last().cloned() else {
            return Ok(CommitReceipt {
                head,
                inserted: 0,
                unwound_to,
            });
        };

        self.execution.insert_blocks(segment).await?;
        self.execution.update_fork_choice(new_head.hash(), finalized).await?;
        if let Some(hash) = finalized {
            if let Some(header) = self.execution.header_by_hash(hash).await? {
                *self.finalized.lock() = Some(header);
            }
        }
        self.bridge.process_new_blocks(&headers).await?;

        if let Some(metrics) = &self.metrics {
            metrics.inc_committed_blocks(inserted as u64);
            metrics.set_head_number(new_head.number.0);
        }
        debug!(
            start = start.0,
            head = new_head.number.0,
            hash = %new_head.hash().short(),
            inserted,
            "Committed segment"
        );

        Ok(CommitReceipt {
            head: new_head,
            inserted,
            unwound_to,
        })
    }

    /// Mark an already canonical block as finalized without moving the head.
    async fn advance_finalized(&self, head: &Header, finalized: Option<Bytes32>) -> Result<(), StoreError> {
        let Some(hash) = finalized else {
            return Ok(());
        };
        if self.finalized.lock().as_ref().map(Header::hash) == Some(hash) {
            return Ok(());
        }

        let header = match self.execution.header_by_hash(hash).await? {
            Some(header) if self.execution.is_canonical(&header).await? => header,
            _ => return Err(StoreError::FinalizedNotCanonical { hash }),
        };
        self.execution.update_fork_choice(head.hash(), Some(hash)).await?;
        debug!(number = header.number.0, hash = %hash.short(), "Advanced finalized block");
        *self.finalized.lock() = Some(header);
        Ok(())
    }
}
