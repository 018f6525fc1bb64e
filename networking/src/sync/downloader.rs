//! Block downloader.
//!
//! Fetches block ranges from peers and only hands out batches that passed
//! checkpoint, milestone and block-level verification, in that order. A
//! checkpoint or milestone mismatch rejects the batch before bodies are
//! even requested.

use containers::{Block, BlockNumber, Bytes32, Checkpoint, Header, Milestone, ValidatorSet};
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::SyncConfig;
use super::oracle::{FinalityOracle, OracleError};
use super::peer_manager::PeerManager;
use super::store::{Store, StoreError};
use super::verification::{ChainVerifier, VerificationError};
use crate::transport::{PeerTransport, TransportError};
use crate::types::PenaltyReason;

/// Where a download should end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadTarget {
    Number(BlockNumber),
    /// The block at `number` must hash to `hash`.
    Hash { hash: Bytes32, number: BlockNumber },
}

impl DownloadTarget {
    pub fn number(&self) -> BlockNumber {
        match self {
            DownloadTarget::Number(number) => *number,
            DownloadTarget::Hash { number, .. } => *number,
        }
    }
}

/// Why a single request to a single peer was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError {
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("block {0} is known to be invalid")]
    KnownBad(Bytes32),
    #[error("block {number} hash {got} does not match requested {expected}")]
    TargetMismatch {
        number: BlockNumber,
        expected: Bytes32,
        got: Bytes32,
    },
    #[error(transparent)]
    Verification(#[from] VerificationError),
}

impl AttemptError {
    pub fn penalty(&self) -> PenaltyReason {
        match self {
            AttemptError::Timeout => PenaltyReason::Timeout,
            AttemptError::Transport(_) => PenaltyReason::Transport,
            AttemptError::Malformed(_) => PenaltyReason::Malformed,
            AttemptError::KnownBad(_) => PenaltyReason::InvalidBlock,
            AttemptError::TargetMismatch { .. } => PenaltyReason::MilestoneMismatch,
            AttemptError::Verification(err) => err.penalty(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("no peers available")]
    NoPeers,
    #[error("download failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: AttemptError },
    #[error("download cancelled")]
    Cancelled,
    #[error("empty download range {from}..={to}")]
    EmptyRange { from: BlockNumber, to: BlockNumber },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
}

/// Bounded memory of block hashes that failed verification.
#[derive(Debug)]
pub struct BadBlocks {
    order: VecDeque<Bytes32>,
    set: HashSet<Bytes32>,
    capacity: usize,
}

impl BadBlocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, hash: Bytes32) {
        if !self.set.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }

    pub fn contains(&self, hash: &Bytes32) -> bool {
        self.set.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone)]
struct BatchPlan {
    /// First block the caller asked for.
    from: BlockNumber,
    /// Requested range. `start` may sit below `from` when a checkpoint has to
    /// be fetched whole.
    start: BlockNumber,
    end: BlockNumber,
    target: DownloadTarget,
    /// Checkpoint to verify, with the committed headers preceding `start`.
    checkpoint: Option<(Checkpoint, Vec<Header>)>,
    milestone: Option<Milestone>,
}

pub struct BlockDownloader {
    config: SyncConfig,
    transport: Arc<dyn PeerTransport>,
    oracle: Arc<dyn FinalityOracle>,
    verifier: Arc<dyn ChainVerifier>,
    store: Arc<Store>,
    peers: Mutex<PeerManager>,
    bad_blocks: Mutex<BadBlocks>,
    metrics: Option<SharedMetrics>,
}

impl BlockDownloader {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn PeerTransport>,
        oracle: Arc<dyn FinalityOracle>,
        verifier: Arc<dyn ChainVerifier>,
        store: Arc<Store>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        let bad_blocks = BadBlocks::new(config.bad_block_cache_size);
        Self {
            config,
            transport,
            oracle,
            verifier,
            store,
            peers: Mutex::new(PeerManager::new()),
            bad_blocks: Mutex::new(bad_blocks),
            metrics,
        }
    }

    /// Snapshot of the peer-quality table.
    pub fn peer_manager(&self) -> PeerManager {
        self.peers.lock().clone()
    }

    pub fn is_bad_block(&self, hash: &Bytes32) -> bool {
        self.bad_blocks.lock().contains(hash)
    }

    pub fn mark_bad_block(&self, hash: Bytes32) {
        self.bad_blocks.lock().insert(hash);
    }

    /// Penalize a peer for data received outside of a download, e.g. gossip.
    pub fn penalize(&self, peer: PeerId, reason: PenaltyReason) {
        {
            let mut peers = self.peers.lock();
            peers.sync_connected(&self.transport.peers());
            peers.on_request_failure(&peer, reason);
        }
        self.transport.penalize(peer, reason);
        if let Some(metrics) = &self.metrics {
            metrics.inc_peer_penalty(reason.as_str());
        }
    }

    /// Download and verify the next batch from `from` towards `target`.
    ///
    /// Returns at most one batch: `block_limit` blocks, or a whole checkpoint
    /// range when `from` falls inside one. Checkpoint batches may exceed
    /// `block_limit` since the root is only checked over the full range. For a hash target the batch never
    /// extends past the target block. Each failed attempt penalizes the peer
    /// and moves on to the least recently failed peer not yet tried.
    pub async fn download_blocks(
        &self,
        token: &CancellationToken,
        from: BlockNumber,
        target: DownloadTarget,
    ) -> Result<Vec<Block>, DownloadError> {
        let to = target.number();
        if to < from {
            return Err(DownloadError::EmptyRange { from, to });
        }

        let plan = self.plan_batch(from, target).await?;
        let validators = self.oracle.validator_set(plan.start).await?;
        let started = Instant::now();
        let attempts = self.config.max_download_attempts;
        let mut tried: HashSet<PeerId> = HashSet::new();
        let mut last_error: Option<AttemptError> = None;

        for attempt in 1..=attempts {
            let peer = {
                let mut peers = self.peers.lock();
                peers.sync_connected(&self.transport.peers());
                let peer = peers.select_peer(&tried);
                if let Some(peer) = &peer {
                    peers.on_request_start(peer);
                }
                peer
            };
            let Some(peer) = peer else {
                return Err(match last_error {
                    Some(last) => DownloadError::Exhausted {
                        attempts: attempt - 1,
                        last,
                    },
                    None => DownloadError::NoPeers,
                });
            };
            tried.insert(peer);

            debug!(
                %peer,
                attempt,
                start = plan.start.0,
                end = plan.end.0,
                "Requesting blocks"
            );

            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    self.peers.lock().on_request_complete(&peer);
                    return Err(DownloadError::Cancelled);
                }
                outcome = self.attempt(peer, &plan, &validators) => outcome,
            };

            match outcome {
                Ok(blocks) => {
                    self.peers.lock().on_request_complete(&peer);
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_download_duration(started.elapsed().as_secs_f64());
                    }
                    debug!(%peer, count = blocks.len(), "Downloaded verified batch");
                    return Ok(blocks);
                }
                Err(err) => {
                    let reason = err.penalty();
                    warn!(%peer, attempt, %reason, error = %err, "Download attempt rejected");
                    self.peers.lock().on_request_failure(&peer, reason);
                    self.transport.penalize(peer, reason);
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_peer_penalty(reason.as_str());
                        metrics.inc_download_failure(reason.as_str());
                    }
                    last_error = Some(err);

                    if attempt < attempts {
                        tokio::select! {
                            _ = token.cancelled() => return Err(DownloadError::Cancelled),
                            _ = tokio::time::sleep(self.config.retry_backoff()) => {}
                        }
                    }
                }
            }
        }

        Err(match last_error {
            Some(last) => DownloadError::Exhausted { attempts, last },
            None => DownloadError::NoPeers,
        })
    }

    async fn plan_batch(&self, from: BlockNumber, target: DownloadTarget) -> Result<BatchPlan, DownloadError> {
        let to = target.number();
        let limit = self.config.block_limit.max(1);
        let mut start = from;
        let mut end = BlockNumber(to.0.min(from.0.saturating_add(limit - 1)));
        let mut checkpoint = None;

        if let Some(covering) = self.oracle.checkpoint_covering(from).await? {
            end = covering.end_block;
            let mut prefix = Vec::new();
            if let Some(last_committed) = from.prev().filter(|n| *n >= covering.start_block) {
                prefix = self.store.canonical_headers(covering.start_block, last_committed).await?;
                if prefix.len() as u64 != covering.start_block.span_to(last_committed) {
                    // Not committed yet: fetch the checkpoint from its start.
                    prefix.clear();
                    start = covering.start_block;
                }
            }
            checkpoint = Some((covering, prefix));
        } else if let Some(next) = self.oracle.checkpoint_covering(end).await? {
            if next.start_block > from {
                // Stop short so the next batch starts on the checkpoint boundary.
                end = BlockNumber(next.start_block.0 - 1);
            }
        }

        let milestone = self
            .oracle
            .latest_milestone()
            .await?
            .filter(|m| m.end_block >= start && m.end_block <= end);

        Ok(BatchPlan {
            from,
            start,
            end,
            target,
            checkpoint,
            milestone,
        })
    }

    async fn attempt(&self, peer: PeerId, plan: &BatchPlan, validators: &ValidatorSet) -> Result<Vec<Block>, AttemptError> {
        let timeout = self.config.request_timeout();

        let headers = tokio::time::timeout(timeout, self.transport.fetch_headers(peer, plan.start, plan.end))
            .await
            .map_err(|_| AttemptError::Timeout)??;

        let expected = plan.start.span_to(plan.end) as usize;
        if headers.len() != expected {
            return Err(AttemptError::Malformed(format!(
                "expected {expected} headers, got {}",
                headers.len()
            )));
        }
        for (offset, header) in headers.iter().enumerate() {
            let number = BlockNumber(plan.start.0 + offset as u64);
            if header.number != number {
                return Err(AttemptError::Malformed(format!(
                    "header {} at position of block {number}",
                    header.number
                )));
            }
        }

        let known_bad = {
            let bad_blocks = self.bad_blocks.lock();
            headers.iter().map(Header::hash).find(|hash| bad_blocks.contains(hash))
        };
        if let Some(hash) = known_bad {
            return Err(AttemptError::KnownBad(hash));
        }

        if let Some((checkpoint, prefix)) = &plan.checkpoint {
            let span: Vec<Header> = prefix
                .iter()
                .chain(headers.iter().filter(|h| h.number <= checkpoint.end_block))
                .cloned()
                .collect();
            self.verifier.verify_checkpoint_headers(checkpoint, &span)?;
        }

        if let Some(milestone) = &plan.milestone {
            let span: Vec<Header> = headers
                .iter()
                .filter(|h| h.number >= milestone.start_block && h.number <= milestone.end_block)
                .cloned()
                .collect();
            self.verifier.verify_milestone_headers(milestone, &span)?;
        }

        if let DownloadTarget::Hash { hash, number } = plan.target {
            if let Some(header) = headers.iter().find(|h| h.number == number) {
                let got = header.hash();
                if got != hash {
                    return Err(AttemptError::TargetMismatch {
                        number,
                        expected: hash,
                        got,
                    });
                }
            }
        }

        let bodies = tokio::time::timeout(timeout, self.transport.fetch_bodies(peer, &headers))
            .await
            .map_err(|_| AttemptError::Timeout)??;
        if bodies.len() != headers.len() {
            return Err(AttemptError::Malformed(format!(
                "expected {} bodies, got {}",
                headers.len(),
                bodies.len()
            )));
        }

        let blocks: Vec<Block> = headers.into_iter().zip(bodies).map(|(h, b)| Block::new(h, b)).collect();
        if let Err(err) = self.verifier.verify_blocks(&blocks, validators) {
            if let Some(number) = err.condemns_header() {
                if let Some(block) = blocks.iter().find(|b| b.number() == number) {
                    self.mark_bad_block(block.hash());
                }
            }
            return Err(err.into());
        }

        let last = match plan.target {
            DownloadTarget::Hash { number, .. } => number,
            DownloadTarget::Number(_) => plan.end,
        };
        Ok(blocks
            .into_iter()
            .filter(|b| b.number() >= plan.from && b.number() <= last)
            .collect())
    }
}
