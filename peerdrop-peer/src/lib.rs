pub mod channel;
pub mod engine;
pub mod negotiation;
pub mod relay;
pub mod service;
pub mod session;
pub mod task;
pub mod transport;

use peerdrop_core::PeerId;
use thiserror::Error;

pub use channel::{ByteChannel, ChannelEvent, ChannelEvents, memory_channel};
pub use negotiation::{Negotiation, NegotiationState};
pub use relay::RelayConnection;
pub use service::{PeerService, RosterPeer, run};
pub use session::{ChunkFile, FileSource, TransferSession};
pub use task::{Direction, Task, TaskId, TaskRegistry, TaskState};
pub use transport::{MemoryTransport, Transport};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {0} is not in the roster")]
    UnknownPeer(PeerId),
    #[error("no active session for peer {0}")]
    UnknownSession(PeerId),
    #[error("peer {0} already has an active transfer")]
    PeerBusy(PeerId),
    #[error("no pending offer from peer {0}")]
    NoPendingOffer(PeerId),
    #[error("unexpected {kind} description in state {state}")]
    UnexpectedDescription {
        kind: &'static str,
        state: &'static str,
    },
    #[error("data channel is closed")]
    ChannelClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("relay connection error: {0}")]
    Relay(String),
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] peerdrop_core::CoreError),
}
