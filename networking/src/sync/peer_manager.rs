use super::config::{MAX_CONCURRENT_REQUESTS, MAX_TRACKED_PEERS};
use crate::types::{ConnectionState, PenaltyReason};
use libp2p_identity::PeerId;
/// Peer-quality bookkeeping for the block downloader.
///
/// Tracks which peers failed recently so requests go to the least recently
/// failed peer first.
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

/// Sync-specific peer state.
#[derive(Debug, Clone)]
pub struct SyncPeer {
    pub peer_id: PeerId,
    pub connection_state: ConnectionState,
    pub requests_in_flight: usize,
    pub failures: u32,
    pub last_failure: Option<Instant>,
    pub last_penalty: Option<PenaltyReason>,
    /// Order in which the peer was first seen.
    added: u64,
}

impl SyncPeer {
    pub fn new(peer_id: PeerId, connection_state: ConnectionState) -> Self {
        Self {
            peer_id,
            connection_state,
            requests_in_flight: 0,
            failures: 0,
            last_failure: None,
            last_penalty: None,
            added: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Connected and below MAX_CONCURRENT_REQUESTS.
    pub fn is_available(&self) -> bool {
        self.is_connected() && self.requests_in_flight < MAX_CONCURRENT_REQUESTS
    }

    pub fn on_request_start(&mut self) {
        self.requests_in_flight += 1;
    }

    pub fn on_request_complete(&mut self) {
        self.requests_in_flight = self.requests_in_flight.saturating_sub(1);
    }

    pub fn on_request_failure(&mut self, reason: PenaltyReason) {
        self.on_request_complete();
        self.failures += 1;
        self.last_failure = Some(Instant::now());
        self.last_penalty = Some(reason);
    }
}

#[derive(Debug, Clone)]
pub struct PeerManager {
    peers: HashMap<PeerId, SyncPeer>,
    max_peers: usize,
    next_added: u64,
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::with_capacity(MAX_TRACKED_PEERS)
    }
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
            next_added: 0,
        }
    }

    /// Add a peer, ignoring it when the table is full.
    pub fn add_peer(&mut self, peer_id: PeerId, connection_state: ConnectionState) -> Option<&mut SyncPeer> {
        if !self.peers.contains_key(&peer_id) {
            if self.peers.len() >= self.max_peers {
                return None;
            }
            let mut peer = SyncPeer::new(peer_id, connection_state);
            peer.added = self.next_added;
            self.next_added += 1;
            self.peers.insert(peer_id, peer);
        }
        self.peers.get_mut(&peer_id)
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<SyncPeer> {
        self.peers.remove(peer_id)
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&SyncPeer> {
        self.peers.get(peer_id)
    }

    pub fn update_connection_state(&mut self, peer_id: &PeerId, state: ConnectionState) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.connection_state = state;
        }
    }

    /// Align the table with the transport's current peer list.
    ///
    /// New peers are added as connected; tracked peers missing from the list
    /// are marked disconnected but keep their failure history.
    pub fn sync_connected(&mut self, connected: &[PeerId]) {
        let current: HashSet<&PeerId> = connected.iter().collect();
        for peer in self.peers.values_mut() {
            peer.connection_state = if current.contains(&peer.peer_id) {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
        }
        for peer_id in connected {
            self.add_peer(*peer_id, ConnectionState::Connected);
        }
    }

    /// Select an available peer, least recently failed first.
    ///
    /// Peers that never failed come before any that did; ties go to the
    /// peer seen first. Peers in `exclude` are only considered once every
    /// other available peer is exhausted.
    pub fn select_peer(&self, exclude: &HashSet<PeerId>) -> Option<PeerId> {
        let rank = |peer: &&SyncPeer| (peer.last_failure, peer.added);
        let available = || self.peers.values().filter(|peer| peer.is_available());

        available()
            .filter(|peer| !exclude.contains(&peer.peer_id))
            .min_by_key(rank)
            .or_else(|| available().min_by_key(rank))
            .map(|peer| peer.peer_id)
    }

    pub fn on_request_start(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_request_start();
        }
    }

    pub fn on_request_complete(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_request_complete();
        }
    }

    pub fn on_request_failure(&mut self, peer_id: &PeerId, reason: PenaltyReason) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_request_failure(reason);
        }
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.is_connected()).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get_all_peers(&self) -> impl Iterator<Item = &SyncPeer> {
        self.peers.values()
    }
}
