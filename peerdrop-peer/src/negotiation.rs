//! Negotiation controller: the offer/answer/candidate state machine that
//! turns a relayed descriptor exchange into an open byte channel.
//!
//! ```text
//! Idle --initiate--> OfferPending --answer--> Connecting --open--> Ready
//! Idle --offer(+answer sent)--> AnswerPending --open--> Ready
//! any --close--> Closed
//! ```

use peerdrop_core::{DescriptionKind, SessionDescription};

use crate::PeerError;
use crate::channel::{ByteChannel, ChannelEvents};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferPending,
    Connecting,
    AnswerPending,
    Ready,
    Closed,
}

impl NegotiationState {
    fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferPending => "offer-pending",
            NegotiationState::Connecting => "connecting",
            NegotiationState::AnswerPending => "answer-pending",
            NegotiationState::Ready => "ready",
            NegotiationState::Closed => "closed",
        }
    }
}

#[derive(Debug)]
pub struct Negotiation<T: Transport> {
    state: NegotiationState,
    transport: T,
}

impl<T: Transport> Negotiation<T> {
    pub fn new(transport: T) -> Self {
        Self {
            state: NegotiationState::Idle,
            transport,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Send side: produce the local offer to relay to the remote peer.
    pub fn initiate(&mut self) -> Result<SessionDescription, PeerError> {
        if self.state != NegotiationState::Idle {
            return Err(PeerError::UnexpectedDescription {
                kind: "offer",
                state: self.state.as_str(),
            });
        }
        let sdp = self.transport.create_offer()?;
        self.state = NegotiationState::OfferPending;
        Ok(SessionDescription {
            kind: DescriptionKind::Offer,
            sdp,
        })
    }

    /// Applies a relayed remote description. A remote offer (receive side)
    /// yields the local answer to relay back; a remote answer (send side)
    /// yields nothing.
    pub fn on_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<Option<SessionDescription>, PeerError> {
        match (desc.kind, self.state) {
            (DescriptionKind::Answer, NegotiationState::OfferPending) => {
                self.transport.accept_answer(&desc.sdp)?;
                self.state = NegotiationState::Connecting;
                Ok(None)
            }
            (DescriptionKind::Offer, NegotiationState::Idle) => {
                let sdp = self.transport.accept_offer(&desc.sdp)?;
                self.state = NegotiationState::AnswerPending;
                Ok(Some(SessionDescription {
                    kind: DescriptionKind::Answer,
                    sdp,
                }))
            }
            (kind, state) => Err(PeerError::UnexpectedDescription {
                kind: match kind {
                    DescriptionKind::Offer => "offer",
                    DescriptionKind::Answer => "answer",
                },
                state: state.as_str(),
            }),
        }
    }

    /// A missing candidate value is an end-of-candidates signal, not an
    /// error.
    pub fn on_candidate(&mut self, candidate: Option<&str>) -> Result<(), PeerError> {
        let Some(candidate) = candidate else {
            return Ok(());
        };
        if self.state == NegotiationState::Closed {
            return Ok(());
        }
        self.transport.add_candidate(candidate)
    }

    pub fn drain_candidates(&mut self) -> Vec<String> {
        self.transport.drain_candidates()
    }

    /// The opened channel, once the transport has completed its handshake.
    pub fn take_channel(&mut self) -> Option<(ByteChannel, ChannelEvents)> {
        match self.state {
            NegotiationState::Connecting
            | NegotiationState::AnswerPending
            | NegotiationState::Ready => self.transport.take_channel(),
            _ => None,
        }
    }

    /// The channel reported "open".
    pub fn mark_open(&mut self) {
        if matches!(
            self.state,
            NegotiationState::Connecting | NegotiationState::AnswerPending
        ) {
            self.state = NegotiationState::Ready;
        }
    }

    /// Idempotent: the underlying transport is closed exactly once.
    pub fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.transport.close();
        self.state = NegotiationState::Closed;
    }
}
