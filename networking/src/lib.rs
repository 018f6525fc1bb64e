pub mod sync;
pub mod transport;
pub mod types;

pub use transport::{PeerTransport, TransportError};
pub use types::{ConnectionState, PeerAnnouncement, PenaltyReason};
