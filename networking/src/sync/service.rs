//! Sync orchestrator.
//!
//! Drives the chain tip from tip events:
//! 1. Before following peers, catch up with the latest checkpoint or
//!    milestone by committing verified batches straight through the store
//! 2. Gossiped blocks are verified and connected to the chain builder; an
//!    unknown parent triggers a download of the missing branch
//! 3. Milestones and checkpoints prune the builder; if they discard the
//!    committed head, the branch they attest to is downloaded and committed
//! 4. Whenever fork choice moves the head, the segment from the common
//!    ancestor is committed through the store

use containers::{Block, BlockNumber, Bytes32, Checkpoint, Header, Milestone};
use fork_choice::{CanonicalChainBuilder, ChainBuilderError, FinalityBoundary};
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    config::SyncConfig,
    downloader::{BlockDownloader, DownloadError, DownloadTarget},
    oracle::{FinalityOracle, OracleError},
    states::SyncState,
    store::{Store, StoreError},
    tip_events::{TipEvent, TipEvents},
    verification::ChainVerifier,
};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Builder(#[from] ChainBuilderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("no known branch matches checkpoint {id}")]
    CheckpointUnresolved { id: u64 },
    #[error("block {number} does not extend the synced chain at {head}")]
    UnlinkedBatch { number: BlockNumber, head: Bytes32 },
    #[error("giving up after {attempts} consecutive recoveries: {last}")]
    RecoveryExhausted { attempts: usize, last: Box<SyncError> },
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Download(DownloadError::Cancelled))
    }

    /// Local chain state disagrees with the committed chain or with finality.
    pub fn is_consistency(&self) -> bool {
        match self {
            SyncError::Store(err) | SyncError::Download(DownloadError::Store(err)) => err.is_consistency(),
            SyncError::Builder(ChainBuilderError::FinalityConflict { .. }) => true,
            SyncError::CheckpointUnresolved { .. } => true,
            _ => false,
        }
    }

    /// Store and execution failures end the service; everything else is
    /// retried after a backoff.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Store(err) | SyncError::Download(DownloadError::Store(err)) => !err.is_consistency(),
            SyncError::RecoveryExhausted { .. } => true,
            _ => false,
        }
    }
}

pub struct SyncService {
    config: SyncConfig,
    oracle: Arc<dyn FinalityOracle>,
    verifier: Arc<dyn ChainVerifier>,
    downloader: Arc<BlockDownloader>,
    store: Arc<Store>,
    tip_events: Arc<TipEvents>,
    metrics: Option<SharedMetrics>,
    state: SyncState,
    builder: CanonicalChainBuilder,
    committed: Header,
    latest_checkpoint: Option<Checkpoint>,
    latest_milestone: Option<Milestone>,
    consecutive_recoveries: usize,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        oracle: Arc<dyn FinalityOracle>,
        verifier: Arc<dyn ChainVerifier>,
        downloader: Arc<BlockDownloader>,
        store: Arc<Store>,
        tip_events: Arc<TipEvents>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            config,
            oracle,
            verifier,
            downloader,
            store,
            tip_events,
            metrics,
            state: SyncState::default(),
            builder: CanonicalChainBuilder::new(Header::default()),
            committed: Header::default(),
            latest_checkpoint: None,
            latest_milestone: None,
            consecutive_recoveries: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn builder(&self) -> &CanonicalChainBuilder {
        &self.builder
    }

    /// Head last acknowledged by the store.
    pub fn committed_head(&self) -> &Header {
        &self.committed
    }

    /// Run until `token` is cancelled or an unrecoverable error occurs.
    pub async fn run(&mut self, token: CancellationToken) -> Result<(), SyncError> {
        info!("Sync service started");

        loop {
            if token.is_cancelled() {
                self.stop();
                return Ok(());
            }
            match self.sync_to_tip(&token).await {
                Ok(()) => break,
                Err(err) => self.recover(&token, err).await?,
            }
        }
        self.consecutive_recoveries = 0;

        let events = self.tip_events.clone();
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.stop();
                    return Ok(());
                }
                event = events.next_event() => self.handle_event(&token, event).await,
                _ = tick.tick() => self.on_tick(&token).await,
            };

            match result {
                Ok(()) => self.consecutive_recoveries = 0,
                Err(err) => self.recover(&token, err).await?,
            }
        }
    }

    fn transition(&mut self, target: SyncState) {
        if self.state == target {
            return;
        }
        if !self.state.can_transition_to(target) {
            warn!(from = %self.state, to = %target, "Invalid state transition attempted");
            return;
        }
        debug!(from = %self.state, to = %target, "Sync state transition");
        self.state = target;
        if let Some(metrics) = &self.metrics {
            metrics.set_sync_state(target.code());
        }
    }

    fn stop(&mut self) {
        self.transition(SyncState::Stopped);
        info!(head = self.committed.number.0, "Sync service stopped");
    }

    async fn recover(&mut self, token: &CancellationToken, err: SyncError) -> Result<(), SyncError> {
        if err.is_cancelled() || token.is_cancelled() {
            return Ok(());
        }

        self.transition(SyncState::Faulted);
        if err.is_fatal() {
            error!(error = %err, "Sync failed");
            return Err(err);
        }

        if err.is_consistency() {
            self.consecutive_recoveries += 1;
            if self.consecutive_recoveries > self.config.max_reorg_recoveries {
                error!(error = %err, attempts = self.consecutive_recoveries, "Reorg recovery exhausted");
                return Err(SyncError::RecoveryExhausted {
                    attempts: self.consecutive_recoveries,
                    last: Box::new(err),
                });
            }
            warn!(error = %err, attempt = self.consecutive_recoveries, "Chain inconsistent, re-anchoring");
            self.reanchor().await?;
        } else {
            warn!(error = %err, "Sync attempt failed");
        }

        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.config.fault_backoff()) => {}
        }
        self.transition(SyncState::AwaitingTip);
        Ok(())
    }

    /// Drop every unfinalized branch and restart from the last finalized
    /// header known to the store, or the committed head if none.
    async fn reanchor(&mut self) -> Result<(), SyncError> {
        let head = self.store.canonical_head().await?;
        let anchor = self.store.finalized().unwrap_or_else(|| head.clone());
        info!(
            anchor = anchor.number.0,
            head = head.number.0,
            "Re-anchoring chain builder"
        );
        self.builder.reset(anchor);
        self.committed = head;
        Ok(())
    }

    /// Commit verified batches up to the latest finality boundary.
    ///
    /// Everything below the boundary is final, so there is no fork choice to
    /// make and the builder is only anchored once the boundary is reached.
    /// A batch that passed block checks only is held back until a later batch
    /// ends on a checkpoint end or on the milestone block, and the whole run
    /// is committed as finalized at that block.
    async fn sync_to_tip(&mut self, token: &CancellationToken) -> Result<(), SyncError> {
        let mut head = self.store.canonical_head().await?;
        let mut pending: Vec<Block> = Vec::new();

        while let Some(target) = self.finality_target().await?.filter(|t| t.number() > head.number) {
            let tip = pending.last().map_or_else(|| head.clone(), |block| block.header.clone());
            self.transition(SyncState::Downloading);
            let blocks = self
                .downloader
                .download_blocks(token, tip.number.next(), target)
                .await?;
            let Some(last) = blocks.last().map(|block| block.header.clone()) else {
                break;
            };

            if let Some(first) = blocks.iter().find(|block| block.number() == tip.number.next()) {
                if first.parent_hash() != tip.hash() {
                    warn!(
                        number = first.number().0,
                        held = pending.len(),
                        "Downloaded batch does not extend the synced chain, dropping held blocks"
                    );
                    return Err(SyncError::UnlinkedBatch {
                        number: first.number(),
                        head: tip.hash(),
                    });
                }
            }

            let boundary = self.ends_on_boundary(&last, target).await?;
            pending.extend(blocks);
            if !boundary {
                debug!(held = pending.len(), last = last.number.0, "Holding batch until the next finality boundary");
                continue;
            }

            self.transition(SyncState::Committing);
            let receipt = self.store.commit(std::mem::take(&mut pending), Some(last.hash())).await?;
            head = receipt.head;
            debug!(head = head.number.0, target = target.number().0, "Initial sync progress");
        }

        info!(head = head.number.0, hash = %head.hash().short(), "Reached finality tip, following peers");
        if let Some(metrics) = &self.metrics {
            metrics.set_head_number(head.number.0);
            if let Some(finalized) = self.store.finalized() {
                metrics.set_finalized_number(finalized.number.0);
            }
        }
        self.builder.reset(head.clone());
        self.committed = head;
        self.transition(SyncState::AwaitingTip);
        Ok(())
    }

    /// Whether a downloaded batch ending at `last` was checked against
    /// finality: the downloader verifies whole checkpoints and the hash of
    /// a target block.
    async fn ends_on_boundary(&self, last: &Header, target: DownloadTarget) -> Result<bool, SyncError> {
        if let DownloadTarget::Hash { hash, .. } = target {
            if last.hash() == hash {
                return Ok(true);
            }
        }
        let covering = self.oracle.checkpoint_covering(last.number).await?;
        Ok(covering.is_some_and(|checkpoint| checkpoint.end_block == last.number))
    }

    /// Highest of the latest checkpoint end and the latest milestone.
    async fn finality_target(&mut self) -> Result<Option<DownloadTarget>, SyncError> {
        let checkpoint = self.oracle.latest_checkpoint().await?;
        let milestone = self.oracle.latest_milestone().await?;

        let by_checkpoint = checkpoint.as_ref().map(|cp| DownloadTarget::Number(cp.end_block));
        let by_milestone = milestone.as_ref().map(|m| DownloadTarget::Hash {
            hash: m.hash,
            number: m.end_block,
        });
        self.latest_checkpoint = checkpoint;
        self.latest_milestone = milestone;

        Ok(match (by_checkpoint, by_milestone) {
            (Some(cp), Some(m)) if m.number() >= cp.number() => Some(m),
            (Some(cp), _) => Some(cp),
            (None, m) => m,
        })
    }

    async fn handle_event(&mut self, token: &CancellationToken, event: TipEvent) -> Result<(), SyncError> {
        match event {
            TipEvent::NewBlock { peer, block } => self.on_new_block(token, peer, block).await,
            TipEvent::NewBlockHashes { peer, hashes } => self.on_new_block_hashes(token, peer, hashes).await,
            TipEvent::NewMilestone(milestone) => self.on_milestone(token, milestone).await,
            TipEvent::NewCheckpoint(checkpoint) => self.on_checkpoint(token, checkpoint).await,
        }
    }

    async fn on_new_block(&mut self, token: &CancellationToken, peer: PeerId, block: Block) -> Result<(), SyncError> {
        let hash = block.hash();
        let number = block.number();
        let root = self.builder.root().number;

        if self.builder.is_known(&hash) || number <= root {
            return Ok(());
        }
        if self.downloader.is_bad_block(&hash) {
            debug!(%peer, number = number.0, "Ignoring known bad block");
            return Ok(());
        }

        let validators = self.oracle.validator_set(number).await?;
        if let Err(err) = self.verifier.verify_blocks(std::slice::from_ref(&block), &validators) {
            warn!(%peer, number = number.0, error = %err, "Rejected gossiped block");
            if err.condemns_header().is_some() {
                self.downloader.mark_bad_block(hash);
            }
            self.downloader.penalize(peer, err.penalty());
            return Ok(());
        }

        let parent = block.parent_hash();
        if !self.builder.is_known(&parent) {
            let parent_number = BlockNumber(number.0 - 1);
            if parent_number <= root {
                debug!(%peer, number = number.0, "Gossiped block forks below the finality boundary");
                return Ok(());
            }
            self.fetch_branch(
                token,
                DownloadTarget::Hash {
                    hash: parent,
                    number: parent_number,
                },
            )
            .await?;
        }

        self.transition(SyncState::Verifying);
        match self.builder.connect(block) {
            Ok(connection) => debug!(number = number.0, hash = %hash.short(), ?connection, "Connected block"),
            Err(err @ ChainBuilderError::MilestoneMismatch { .. }) => {
                debug!(%peer, error = %err, "Dropping block that conflicts with a milestone");
                self.transition(SyncState::AwaitingTip);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        self.reconcile().await
    }

    async fn on_new_block_hashes(
        &mut self,
        token: &CancellationToken,
        peer: PeerId,
        hashes: Vec<(Bytes32, BlockNumber)>,
    ) -> Result<(), SyncError> {
        let root = self.builder.root().number;
        let best = hashes
            .into_iter()
            .filter(|(hash, number)| {
                *number > root && !self.builder.is_known(hash) && !self.downloader.is_bad_block(hash)
            })
            .max_by_key(|(_, number)| *number);
        let Some((hash, number)) = best else {
            return Ok(());
        };

        debug!(%peer, number = number.0, hash = %hash.short(), "Fetching announced block");
        self.fetch_branch(token, DownloadTarget::Hash { hash, number }).await?;
        self.reconcile().await
    }

    async fn on_milestone(&mut self, token: &CancellationToken, milestone: Milestone) -> Result<(), SyncError> {
        let boundary = FinalityBoundary::from(&milestone);
        if boundary.number <= self.builder.root().number {
            debug!(milestone = milestone.id, number = boundary.number.0, "Ignoring stale milestone");
            return Ok(());
        }
        self.latest_milestone = Some(milestone.clone());
        self.transition(SyncState::Reconciling);

        if !self.builder.contains(&boundary.hash) {
            let outcome = self.builder.prune(boundary)?;
            if outcome.reorg {
                info!(
                    milestone = milestone.id,
                    number = boundary.number.0,
                    removed = outcome.removed,
                    "Milestone discarded the canonical branch"
                );
            }
            self.fetch_branch(
                token,
                DownloadTarget::Hash {
                    hash: boundary.hash,
                    number: boundary.number,
                },
            )
            .await?;
            if !self.builder.contains(&boundary.hash) {
                warn!(milestone = milestone.id, number = boundary.number.0, "Milestone block not available yet");
                self.transition(SyncState::AwaitingTip);
                return Ok(());
            }
        }

        self.finalize(boundary).await?;
        self.reconcile().await
    }

    async fn on_checkpoint(&mut self, token: &CancellationToken, checkpoint: Checkpoint) -> Result<(), SyncError> {
        if checkpoint.end_block <= self.builder.root().number {
            debug!(checkpoint = checkpoint.id, end = checkpoint.end_block.0, "Ignoring stale checkpoint");
            return Ok(());
        }
        self.latest_checkpoint = Some(checkpoint.clone());
        self.transition(SyncState::Reconciling);

        let hash = match self.resolve_checkpoint(&checkpoint).await? {
            Some(hash) => hash,
            None => {
                let from = self.builder.root().number.next();
                self.fill(token, from, DownloadTarget::Number(checkpoint.end_block)).await?;
                self.resolve_checkpoint(&checkpoint)
                    .await?
                    .ok_or(SyncError::CheckpointUnresolved { id: checkpoint.id })?
            }
        };

        info!(checkpoint = checkpoint.id, end = checkpoint.end_block.0, hash = %hash.short(), "Accepted checkpoint");
        self.finalize(FinalityBoundary {
            number: checkpoint.end_block,
            hash,
        })
        .await?;
        self.reconcile().await
    }

    /// Hash of the known block at the checkpoint end whose chain reproduces
    /// the checkpoint root.
    async fn resolve_checkpoint(&self, checkpoint: &Checkpoint) -> Result<Option<Bytes32>, SyncError> {
        let candidates: Vec<Bytes32> = self
            .builder
            .headers_at(checkpoint.end_block)
            .into_iter()
            .map(Header::hash)
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let root = self.builder.root().number;
        let committed_prefix = if checkpoint.start_block <= root {
            self.store.canonical_headers(checkpoint.start_block, root).await?
        } else {
            Vec::new()
        };

        for candidate in candidates {
            let mut headers = committed_prefix.clone();
            headers.extend(
                self.builder
                    .path_from_root(&candidate)
                    .into_iter()
                    .map(|block| block.header.clone())
                    .filter(|header| header.number >= checkpoint.start_block),
            );
            if self.verifier.verify_checkpoint_headers(checkpoint, &headers).is_ok() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Move the committed chain onto `boundary`, then re-root the builder there.
    ///
    /// The commit has to come first: once re-rooted, the blocks between the
    /// old root and the boundary are no longer in the builder.
    async fn finalize(&mut self, boundary: FinalityBoundary) -> Result<(), SyncError> {
        self.commit_to(boundary.hash, boundary.hash).await?;

        self.transition(SyncState::Reconciling);
        let outcome = self.builder.prune(boundary)?;
        debug!(
            number = boundary.number.0,
            rerooted = outcome.rerooted,
            removed = outcome.removed,
            "Applied finality boundary"
        );
        if let Some(metrics) = &self.metrics {
            metrics.set_finalized_number(self.builder.root().number.0);
        }
        Ok(())
    }

    /// Download the branch ending at `target` into the builder.
    ///
    /// Starts right above the local head, which is enough when the branch
    /// extends it; otherwise falls back to the builder root.
    async fn fetch_branch(&mut self, token: &CancellationToken, target: DownloadTarget) -> Result<(), SyncError> {
        let root = self.builder.root().number;
        let head = self.builder.head_header().number;
        let from = if head < target.number() { head.next() } else { root.next() };

        match self.fill(token, from, target).await {
            Err(SyncError::Builder(ChainBuilderError::UnknownParent { .. })) if from > root.next() => {
                debug!(from = from.0, target = target.number().0, "Branch does not extend the head, refetching from the root");
                self.fill(token, root.next(), target).await
            }
            other => other,
        }
    }

    async fn fill(&mut self, token: &CancellationToken, from: BlockNumber, target: DownloadTarget) -> Result<(), SyncError> {
        let mut next = from;
        while next <= target.number() {
            self.transition(SyncState::Downloading);
            let blocks = self.downloader.download_blocks(token, next, target).await?;
            let Some(last) = blocks.last().map(Block::number) else {
                break;
            };

            self.transition(SyncState::Verifying);
            let connected = self.builder.connect_all(blocks)?;
            debug!(from = next.0, to = last.0, connected, "Connected downloaded batch");
            next = last.next();
        }
        Ok(())
    }

    /// Re-evaluate fork choice and commit the head if it moved.
    async fn reconcile(&mut self) -> Result<(), SyncError> {
        self.transition(SyncState::Reconciling);
        let head = self.builder.evaluate_head();
        if head != self.committed.hash() {
            let finalized = self.builder.root_hash();
            self.commit_to(head, finalized).await?;
        }
        self.transition(SyncState::AwaitingTip);
        Ok(())
    }

    /// Commit the builder's path to `target`, starting at its common ancestor
    /// with the committed head, and mark `finalized` as final.
    ///
    /// When the committed head already descends from `target` only the
    /// finalized marker is sent.
    async fn commit_to(&mut self, target: Bytes32, finalized: Bytes32) -> Result<(), SyncError> {
        let committed = self.committed.hash();
        let segment: Vec<Block> = match self.builder.lowest_common_ancestor(&committed, &target) {
            Some(ancestor) if ancestor == target => Vec::new(),
            Some(ancestor) => self.builder.blocks_after(&ancestor, &target),
            // The committed head was pruned: let the store find the fork point.
            None => self.builder.path_from_root(&target).into_iter().cloned().collect(),
        };
        let finality_known = self.store.finalized().map(|header| header.hash()) == Some(finalized);
        if segment.is_empty() && finality_known {
            return Ok(());
        }

        self.transition(SyncState::Committing);
        let previous = self.committed.number;
        let receipt = self.store.commit(segment, Some(finalized)).await?;

        if let Some(ancestor) = receipt.unwound_to {
            let depth = previous.0.saturating_sub(ancestor.0);
            info!(
                from = previous.0,
                to = receipt.head.number.0,
                ancestor = ancestor.0,
                depth,
                "Canonical chain reorganised"
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc_reorgs();
                metrics.observe_reorg_depth(depth as f64);
            }
        }
        self.committed = receipt.head;
        Ok(())
    }

    async fn on_tick(&mut self, token: &CancellationToken) -> Result<(), SyncError> {
        if let Some(metrics) = &self.metrics {
            metrics.set_peers(self.downloader.peer_manager().connected_count() as i64);
        }

        // Catch finality we missed or could not apply yet.
        let root = self.builder.root().number;
        if let Some(checkpoint) = self.oracle.latest_checkpoint().await? {
            if checkpoint.end_block > root {
                return self.on_checkpoint(token, checkpoint).await;
            }
        }
        if let Some(milestone) = self.oracle.latest_milestone().await? {
            if milestone.end_block > root {
                return self.on_milestone(token, milestone).await;
            }
        }
        Ok(())
    }
}
