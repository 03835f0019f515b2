//! Pluggable connection transport behind the negotiation controller.
//!
//! The descriptor/candidate vocabulary matches WebRTC-style
//! offer/answer/ICE exchange, but the trait is deliberately opaque: any
//! environment able to turn the exchanged strings into an open
//! [`ByteChannel`](crate::channel::ByteChannel) can back a transfer.

use peerdrop_core::TransferConfig;

use crate::PeerError;
use crate::channel::{ByteChannel, ChannelEvents, memory_channel};

pub trait Transport: Send {
    /// Local description for the offering (sending) side.
    fn create_offer(&mut self) -> Result<String, PeerError>;
    /// Applies a remote offer and returns the local answer.
    fn accept_offer(&mut self, offer: &str) -> Result<String, PeerError>;
    /// Applies the remote answer on the offering side.
    fn accept_answer(&mut self, answer: &str) -> Result<(), PeerError>;
    /// Adds one remote connectivity candidate.
    fn add_candidate(&mut self, candidate: &str) -> Result<(), PeerError>;
    /// Locally gathered candidates to relay to the remote peer, drained.
    fn drain_candidates(&mut self) -> Vec<String>;
    /// The opened byte channel, available once the handshake completed.
    fn take_channel(&mut self) -> Option<(ByteChannel, ChannelEvents)>;
    fn close(&mut self);
}

/// In-process loopback transport: both halves of a pair share one
/// [`memory_channel`], and the handshake is the offer/answer strings
/// themselves. Used by the integration tests and any single-process
/// deployment of two peers.
#[derive(Debug)]
pub struct MemoryTransport {
    endpoint: Option<(ByteChannel, ChannelEvents)>,
    handshake_complete: bool,
    closed: bool,
}

const MEMORY_OFFER: &str = "memory:offer";
const MEMORY_ANSWER: &str = "memory:answer";

impl MemoryTransport {
    pub fn pair(config: &TransferConfig) -> (Self, Self) {
        // One extra slot for the Open event and one for a trailing Closed.
        let capacity = config.window as usize + 2;
        let (left, right) = memory_channel(capacity);
        (Self::from_endpoint(left), Self::from_endpoint(right))
    }

    fn from_endpoint(endpoint: (ByteChannel, ChannelEvents)) -> Self {
        Self {
            endpoint: Some(endpoint),
            handshake_complete: false,
            closed: false,
        }
    }
}

impl Transport for MemoryTransport {
    fn create_offer(&mut self) -> Result<String, PeerError> {
        if self.closed {
            return Err(PeerError::Transport("transport closed".to_owned()));
        }
        Ok(MEMORY_OFFER.to_owned())
    }

    fn accept_offer(&mut self, offer: &str) -> Result<String, PeerError> {
        if offer != MEMORY_OFFER {
            return Err(PeerError::Transport(format!(
                "unrecognized offer {offer:?}"
            )));
        }
        self.handshake_complete = true;
        Ok(MEMORY_ANSWER.to_owned())
    }

    fn accept_answer(&mut self, answer: &str) -> Result<(), PeerError> {
        if answer != MEMORY_ANSWER {
            return Err(PeerError::Transport(format!(
                "unrecognized answer {answer:?}"
            )));
        }
        self.handshake_complete = true;
        Ok(())
    }

    fn add_candidate(&mut self, _candidate: &str) -> Result<(), PeerError> {
        // Loopback needs no connectivity checks.
        Ok(())
    }

    fn drain_candidates(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn take_channel(&mut self) -> Option<(ByteChannel, ChannelEvents)> {
        if self.handshake_complete {
            self.endpoint.take()
        } else {
            None
        }
    }

    fn close(&mut self) {
        self.closed = true;
        if let Some((mut channel, _events)) = self.endpoint.take() {
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_is_withheld_until_handshake() {
        let config = TransferConfig::default();
        let (mut sender, mut receiver) = MemoryTransport::pair(&config);

        assert!(sender.take_channel().is_none());

        let offer = sender.create_offer().unwrap();
        let answer = receiver.accept_offer(&offer).unwrap();
        sender.accept_answer(&answer).unwrap();

        assert!(sender.take_channel().is_some());
        assert!(receiver.take_channel().is_some());
    }

    #[test]
    fn mismatched_handshake_is_rejected() {
        let config = TransferConfig::default();
        let (_sender, mut receiver) = MemoryTransport::pair(&config);
        assert!(receiver.accept_offer("garbage").is_err());
    }
}
