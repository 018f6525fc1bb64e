use anyhow::Result;
use containers::{Block, BlockNumber, Bytes32, Checkpoint, Milestone};
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::oracle::{FinalityEvent, FinalityOracle};
use crate::transport::PeerTransport;
use crate::types::PeerAnnouncement;

/// Unified input of the sync orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TipEvent {
    NewBlock { peer: PeerId, block: Block },
    NewBlockHashes {
        peer: PeerId,
        hashes: Vec<(Bytes32, BlockNumber)>,
    },
    NewMilestone(Milestone),
    NewCheckpoint(Checkpoint),
}

impl TipEvent {
    pub fn is_finality(&self) -> bool {
        matches!(self, TipEvent::NewMilestone(_) | TipEvent::NewCheckpoint(_))
    }

    fn block_hash(&self) -> Option<Bytes32> {
        match self {
            TipEvent::NewBlock { block, .. } => Some(block.hash()),
            _ => None,
        }
    }
}

impl From<PeerAnnouncement> for TipEvent {
    fn from(announcement: PeerAnnouncement) -> Self {
        match announcement {
            PeerAnnouncement::NewBlock { peer, block } => TipEvent::NewBlock { peer, block },
            PeerAnnouncement::NewBlockHashes { peer, hashes } => TipEvent::NewBlockHashes { peer, hashes },
        }
    }
}

impl From<FinalityEvent> for TipEvent {
    fn from(event: FinalityEvent) -> Self {
        match event {
            FinalityEvent::Checkpoint(checkpoint) => TipEvent::NewCheckpoint(checkpoint),
            FinalityEvent::Milestone(milestone) => TipEvent::NewMilestone(milestone),
        }
    }
}

#[derive(Debug, Default)]
struct EventQueue {
    events: VecDeque<TipEvent>,
    gossip: usize,
    dropped: u64,
    coalesced: u64,
}

/// Merges peer gossip and oracle finality notifications into one queue.
///
/// Finality events are never dropped. Gossip is bounded: when the queue holds
/// `capacity` gossip events the oldest one is evicted, and a block already
/// waiting in the queue is not queued twice.
pub struct TipEvents {
    transport: Arc<dyn PeerTransport>,
    oracle: Arc<dyn FinalityOracle>,
    capacity: usize,
    queue: Mutex<EventQueue>,
    notify: Notify,
}

impl TipEvents {
    pub fn new(transport: Arc<dyn PeerTransport>, oracle: Arc<dyn FinalityOracle>, capacity: usize) -> Self {
        Self {
            transport,
            oracle,
            capacity: capacity.max(1),
            queue: Mutex::new(EventQueue::default()),
            notify: Notify::new(),
        }
    }

    /// Forward announcements and finality events until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut announcements = self.transport.subscribe_announcements();
        let mut finality = self.oracle.subscribe();
        let mut gossip_open = true;
        let mut finality_open = true;
        info!("Tip events started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                announcement = announcements.recv(), if gossip_open => match announcement {
                    Some(announcement) => self.push(announcement.into()),
                    None => {
                        debug!("Peer announcement stream closed");
                        gossip_open = false;
                    }
                },
                event = finality.recv(), if finality_open => match event {
                    Some(event) => self.push(event.into()),
                    None => {
                        debug!("Finality event stream closed");
                        finality_open = false;
                    }
                },
            }
        }

        Ok(())
    }

    pub fn push(&self, event: TipEvent) {
        {
            let mut queue = self.queue.lock();
            if !event.is_finality() {
                if let Some(hash) = event.block_hash() {
                    if queue.events.iter().any(|queued| queued.block_hash() == Some(hash)) {
                        queue.coalesced += 1;
                        return;
                    }
                }
                if queue.gossip >= self.capacity {
                    let oldest = queue.events.iter().position(|queued| !queued.is_finality());
                    if let Some(index) = oldest {
                        queue.events.remove(index);
                        queue.gossip -= 1;
                        queue.dropped += 1;
                    }
                }
                queue.gossip += 1;
            }
            queue.events.push_back(event);
        }
        self.notify.notify_one();
    }

    pub fn try_next(&self) -> Option<TipEvent> {
        let mut queue = self.queue.lock();
        let event = queue.events.pop_front()?;
        if !event.is_finality() {
            queue.gossip -= 1;
        }
        Some(event)
    }

    /// Wait for the next event. Cancel safe.
    pub async fn next_event(&self) -> TipEvent {
        loop {
            if let Some(event) = self.try_next() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gossip events evicted to respect the capacity.
    pub fn dropped(&self) -> u64 {
        self.queue.lock().dropped
    }

    /// Duplicate block announcements folded into an already queued one.
    pub fn coalesced(&self) -> u64 {
        self.queue.lock().coalesced
    }
}
