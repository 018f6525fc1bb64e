use containers::{Block, BlockNumber, Bytes32};
use libp2p_identity::PeerId;
use serde::Serialize;
use std::fmt::{self, Display};

/// Peer connection state as reported by the transport.
///
/// DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTING -> DISCONNECTED
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Why a peer lost standing with the downloader.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyReason {
    /// Request did not complete within the configured timeout.
    Timeout,
    /// Request failed at the transport level.
    Transport,
    /// Response was empty, partial or out of range.
    Malformed,
    /// Headers or bodies failed block-level verification.
    InvalidBlock,
    /// Headers did not reproduce an oracle checkpoint root.
    CheckpointMismatch,
    /// Headers disagreed with an oracle milestone or requested hash.
    MilestoneMismatch,
}

impl PenaltyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PenaltyReason::Timeout => "timeout",
            PenaltyReason::Transport => "transport",
            PenaltyReason::Malformed => "malformed",
            PenaltyReason::InvalidBlock => "invalid_block",
            PenaltyReason::CheckpointMismatch => "checkpoint_mismatch",
            PenaltyReason::MilestoneMismatch => "milestone_mismatch",
        }
    }
}

impl Display for PenaltyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// New chain data announced by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAnnouncement {
    /// A full block pushed by a peer.
    NewBlock { peer: PeerId, block: Block },
    /// Hashes and numbers of blocks the peer has, without bodies.
    NewBlockHashes {
        peer: PeerId,
        hashes: Vec<(Bytes32, BlockNumber)>,
    },
}

impl PeerAnnouncement {
    pub fn peer(&self) -> PeerId {
        match self {
            PeerAnnouncement::NewBlock { peer, .. } => *peer,
            PeerAnnouncement::NewBlockHashes { peer, .. } => *peer,
        }
    }
}

impl Display for PeerAnnouncement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAnnouncement::NewBlock { peer, block } => {
                write!(f, "NewBlock(#{} {} from {peer})", block.number(), block.hash().short())
            }
            PeerAnnouncement::NewBlockHashes { peer, hashes } => {
                write!(f, "NewBlockHashes({} from {peer})", hashes.len())
            }
        }
    }
}
