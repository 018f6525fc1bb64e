//! In-process devnet: simulated peers, finality oracle and bridge.
//!
//! Peers share one chain that grows every block period. The oracle issues a
//! checkpoint for every `CHECKPOINT_LENGTH` blocks and a milestone trailing
//! the tip, so the node goes through initial sync, tip following and
//! finality handling without external services.

use anyhow::Result;
use async_trait::async_trait;
use chain::ChainConfig;
use containers::generator::BlockFactory;
use containers::{headers_root, Block, BlockBody, BlockNumber, Checkpoint, Header, Milestone, ValidatorSet};
use libp2p_identity::PeerId;
use networking::sync::{BridgeError, BridgeRelay, FinalityEvent, FinalityOracle, InMemoryExecutionEngine, OracleError};
use networking::{PeerAnnouncement, PeerTransport, PenaltyReason, TransportError};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHECKPOINT_LENGTH: u64 = 16;
/// Blocks between the tip and the latest milestone.
const MILESTONE_LAG: u64 = 2;
/// Every n-th block is announced by hash only.
const HASH_ANNOUNCE_EVERY: u64 = 4;

struct DevnetChain {
    factory: BlockFactory,
    /// Indexed by block number.
    blocks: RwLock<Vec<Block>>,
}

impl DevnetChain {
    fn new(factory: BlockFactory, initial: usize) -> Self {
        let genesis = factory.genesis();
        let mut blocks = vec![genesis.clone()];
        blocks.extend(factory.extend(&genesis.header, initial, 0));
        Self {
            factory,
            blocks: RwLock::new(blocks),
        }
    }

    fn genesis(&self) -> Block {
        self.factory.genesis()
    }

    fn tip(&self) -> BlockNumber {
        BlockNumber(self.blocks.read().len() as u64 - 1)
    }

    fn produce(&self) -> Block {
        let mut blocks = self.blocks.write();
        let block = match blocks.last() {
            Some(tip) => self.factory.child(&tip.header, 0),
            None => self.factory.genesis(),
        };
        blocks.push(block.clone());
        block
    }

    fn headers(&self, start: BlockNumber, end: BlockNumber) -> Vec<Header> {
        let blocks = self.blocks.read();
        (start.0..=end.0)
            .map_while(|number| blocks.get(number as usize))
            .map(|block| block.header.clone())
            .collect()
    }

    fn body(&self, header: &Header) -> Option<BlockBody> {
        let blocks = self.blocks.read();
        blocks
            .get(header.number.0 as usize)
            .filter(|block| block.header == *header)
            .map(|block| block.body.clone())
    }
}

/// Peers that all serve the shared devnet chain.
pub struct DevnetTransport {
    chain: Arc<DevnetChain>,
    peers: Vec<PeerId>,
    block_period: Duration,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PeerAnnouncement>>>,
}

impl DevnetTransport {
    fn announce(&self, block: Block) {
        let Some(peer) = self.peers.choose(&mut rand::thread_rng()).copied() else {
            return;
        };
        let number = block.number();
        let announcement = if number.0 % HASH_ANNOUNCE_EVERY == 0 {
            PeerAnnouncement::NewBlockHashes {
                peer,
                hashes: vec![(block.hash(), number)],
            }
        } else {
            PeerAnnouncement::NewBlock { peer, block }
        };
        debug!(%announcement, "Devnet announcement");
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(announcement.clone()).is_ok());
    }
}

#[async_trait]
impl PeerTransport for DevnetTransport {
    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(peers = self.peers.len(), tip = self.chain.tip().0, "Devnet transport started");
        let mut interval = tokio::time::interval(self.block_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let block = self.chain.produce();
                    self.announce(block);
                }
            }
        }
        Ok(())
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.clone()
    }

    async fn fetch_headers(
        &self,
        peer: PeerId,
        start: BlockNumber,
        end: BlockNumber,
    ) -> Result<Vec<Header>, TransportError> {
        if !self.peers.contains(&peer) {
            return Err(TransportError::PeerNotConnected(peer));
        }
        Ok(self.chain.headers(start, end))
    }

    async fn fetch_bodies(&self, peer: PeerId, headers: &[Header]) -> Result<Vec<BlockBody>, TransportError> {
        if !self.peers.contains(&peer) {
            return Err(TransportError::PeerNotConnected(peer));
        }
        headers
            .iter()
            .map(|header| {
                self.chain.body(header).ok_or_else(|| TransportError::Request {
                    peer,
                    reason: format!("unknown block {}", header.number),
                })
            })
            .collect()
    }

    fn subscribe_announcements(&self) -> mpsc::UnboundedReceiver<PeerAnnouncement> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    fn penalize(&self, peer: PeerId, reason: PenaltyReason) {
        warn!(%peer, %reason, "Devnet peer penalized");
    }
}

#[derive(Default)]
struct Finality {
    checkpoints: Vec<Checkpoint>,
    milestone: Option<Milestone>,
}

/// Issues checkpoints and milestones over the devnet chain.
pub struct DevnetOracle {
    chain: Arc<DevnetChain>,
    poll_interval: Duration,
    finality: RwLock<Finality>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<FinalityEvent>>>,
}

impl DevnetOracle {
    fn new(chain: Arc<DevnetChain>, poll_interval: Duration) -> Self {
        let oracle = Self {
            chain,
            poll_interval,
            finality: RwLock::new(Finality::default()),
            subscribers: Mutex::new(Vec::new()),
        };
        oracle.update();
        oracle
    }

    /// Issue whatever finality the current tip allows.
    fn update(&self) {
        let Some(finalizable) = self.chain.tip().0.checked_sub(MILESTONE_LAG) else {
            return;
        };
        let mut events = Vec::new();
        {
            let mut finality = self.finality.write();

            loop {
                let start = finality.checkpoints.last().map_or(BlockNumber(1), |cp| cp.end_block.next());
                let end = BlockNumber(start.0 + CHECKPOINT_LENGTH - 1);
                if end.0 > finalizable {
                    break;
                }
                let headers = self.chain.headers(start, end);
                let checkpoint = Checkpoint {
                    id: finality.checkpoints.len() as u64 + 1,
                    start_block: start,
                    end_block: end,
                    root_hash: headers_root(&headers),
                };
                finality.checkpoints.push(checkpoint.clone());
                events.push(FinalityEvent::Checkpoint(checkpoint));
            }

            let previous_end = finality.milestone.as_ref().map_or(BlockNumber(0), |m| m.end_block);
            let end = BlockNumber(finalizable);
            if end > previous_end {
                let hash = self.chain.headers(end, end).first().map(Header::hash);
                if let Some(hash) = hash {
                    let milestone = Milestone {
                        id: finality.milestone.as_ref().map_or(1, |m| m.id + 1),
                        start_block: previous_end.next(),
                        end_block: end,
                        hash,
                    };
                    finality.milestone = Some(milestone.clone());
                    events.push(FinalityEvent::Milestone(milestone));
                }
            }
        }

        let mut subscribers = self.subscribers.lock();
        for event in events {
            debug!(?event, "Devnet finality issued");
            subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        }
    }
}

#[async_trait]
impl FinalityOracle for DevnetOracle {
    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Devnet oracle started");
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.update(),
            }
        }
        Ok(())
    }

    async fn latest_checkpoint(&self) -> Result<Option<Checkpoint>, OracleError> {
        Ok(self.finality.read().checkpoints.last().cloned())
    }

    async fn latest_milestone(&self) -> Result<Option<Milestone>, OracleError> {
        Ok(self.finality.read().milestone.clone())
    }

    async fn checkpoint_covering(&self, number: BlockNumber) -> Result<Option<Checkpoint>, OracleError> {
        let finality = self.finality.read();
        Ok(finality
            .checkpoints
            .iter()
            .find(|checkpoint| checkpoint.contains(number))
            .cloned())
    }

    async fn validator_set(&self, _number: BlockNumber) -> Result<ValidatorSet, OracleError> {
        Ok(self.chain.factory.validators().clone())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<FinalityEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(sender);
        receiver
    }
}

/// Bridge that only checks event continuity and logs.
pub struct LoggingBridge {
    processed: Mutex<BlockNumber>,
}

#[async_trait]
impl BridgeRelay for LoggingBridge {
    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        shutdown.cancelled().await;
        Ok(())
    }

    async fn process_new_blocks(&self, headers: &[Header]) -> Result<(), BridgeError> {
        let (Some(first), Some(last)) = (headers.first(), headers.last()) else {
            return Ok(());
        };
        let mut processed = self.processed.lock();
        if first.number != processed.next() {
            return Err(BridgeError::Rejected {
                start: first.number,
                end: last.number,
                reason: format!("expected block {}", processed.next()),
            });
        }
        *processed = last.number;
        debug!(start = first.number.0, end = last.number.0, "Bridge processed blocks");
        Ok(())
    }

    async fn unwind(&self, number: BlockNumber) -> Result<(), BridgeError> {
        let mut processed = self.processed.lock();
        if number < *processed {
            info!(from = processed.0, to = number.0, "Bridge unwound");
            *processed = number;
        }
        Ok(())
    }
}

pub struct Devnet {
    chain: Arc<DevnetChain>,
    transport: Arc<DevnetTransport>,
    oracle: Arc<DevnetOracle>,
    bridge: Arc<LoggingBridge>,
}

impl Devnet {
    /// A devnet with `peers` peers sharing `blocks` pre-produced blocks.
    pub fn new(config: &ChainConfig, peers: usize, blocks: usize) -> Self {
        let factory = BlockFactory::new(config.producer_count, config.block_period_secs);
        let chain = Arc::new(DevnetChain::new(factory, blocks));
        let block_period = Duration::from_secs(config.block_period_secs.max(1));

        let transport = Arc::new(DevnetTransport {
            chain: chain.clone(),
            peers: (0..peers.max(1)).map(|_| PeerId::random()).collect(),
            block_period,
            subscribers: Mutex::new(Vec::new()),
        });
        let oracle = Arc::new(DevnetOracle::new(chain.clone(), block_period));
        let bridge = Arc::new(LoggingBridge {
            processed: Mutex::new(BlockNumber(0)),
        });

        Self {
            chain,
            transport,
            oracle,
            bridge,
        }
    }

    pub fn transport(&self) -> Arc<DevnetTransport> {
        self.transport.clone()
    }

    pub fn oracle(&self) -> Arc<DevnetOracle> {
        self.oracle.clone()
    }

    pub fn bridge(&self) -> Arc<LoggingBridge> {
        self.bridge.clone()
    }

    /// Fresh execution engine holding only the devnet genesis.
    pub fn engine(&self) -> Arc<InMemoryExecutionEngine> {
        Arc::new(InMemoryExecutionEngine::new(self.chain.genesis()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn devnet(blocks: usize) -> Devnet {
        Devnet::new(&ChainConfig::default(), 2, blocks)
    }

    #[tokio::test]
    async fn test_initial_finality_covers_prebuilt_chain() {
        let devnet = devnet(40);
        let oracle = devnet.oracle();

        let checkpoint = oracle.latest_checkpoint().await.unwrap().unwrap();
        assert_eq!(checkpoint.start_block, BlockNumber(17));
        assert_eq!(checkpoint.end_block, BlockNumber(32));

        let milestone = oracle.latest_milestone().await.unwrap().unwrap();
        assert_eq!(milestone.end_block, BlockNumber(38));
        let headers = devnet.chain.headers(BlockNumber(38), BlockNumber(38));
        assert_eq!(milestone.hash, headers[0].hash());
    }

    #[tokio::test]
    async fn test_produced_blocks_extend_the_chain() {
        let devnet = devnet(4);
        let block = devnet.chain.produce();
        assert_eq!(block.number(), BlockNumber(5));

        let transport = devnet.transport();
        let peer = transport.peers()[0];
        let bodies = transport.fetch_bodies(peer, &[block.header.clone()]).await.unwrap();
        assert_eq!(bodies, vec![block.body]);
    }

    #[tokio::test]
    async fn test_bridge_rejects_gaps() {
        let devnet = devnet(4);
        let headers = devnet.chain.headers(BlockNumber(1), BlockNumber(4));
        let bridge = devnet.bridge();

        assert!(bridge.process_new_blocks(&headers[2..]).await.is_err());
        bridge.process_new_blocks(&headers).await.unwrap();
        bridge.unwind(BlockNumber(2)).await.unwrap();
        bridge.process_new_blocks(&headers[2..]).await.unwrap();
    }
}
