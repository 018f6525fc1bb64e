use anyhow::Result;
use async_trait::async_trait;
use containers::{BlockBody, BlockNumber, Header};
use libp2p_identity::PeerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{PeerAnnouncement, PenaltyReason};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    PeerNotConnected(PeerId),
    #[error("request to {peer} failed: {reason}")]
    Request { peer: PeerId, reason: String },
    #[error("transport is shut down")]
    Closed,
}

/// Peer-to-peer layer the sync engine pulls blocks from.
///
/// Abstracts discovery, request/response messaging and gossip so the
/// downloader and tip events can be driven by mocks in tests.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Drive the transport until `shutdown` is cancelled.
    async fn run(&self, shutdown: CancellationToken) -> Result<()>;

    /// Currently connected peers.
    fn peers(&self) -> Vec<PeerId>;

    /// Headers `start..=end` from `peer`, ascending.
    async fn fetch_headers(
        &self,
        peer: PeerId,
        start: BlockNumber,
        end: BlockNumber,
    ) -> Result<Vec<Header>, TransportError>;

    /// Bodies for `headers` from `peer`, in the same order.
    async fn fetch_bodies(
        &self,
        peer: PeerId,
        headers: &[Header],
    ) -> Result<Vec<BlockBody>, TransportError>;

    /// Stream of new-block announcements. Each call returns a fresh subscription.
    fn subscribe_announcements(&self) -> mpsc::UnboundedReceiver<PeerAnnouncement>;

    /// Report misbehaviour so the transport can lower the peer's score.
    fn penalize(&self, peer: PeerId, reason: PenaltyReason);
}
