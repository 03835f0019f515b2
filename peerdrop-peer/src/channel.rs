//! The opaque byte-chunk channel two peers exchange file data over.
//!
//! The concrete transport (a WebRTC data channel in the reference
//! deployment) is external; this module only fixes the surface the
//! transfer engine needs: ordered chunk delivery plus open/close/error
//! signals. [`memory_channel`] provides the in-process loopback pair used
//! by the loopback transport and the tests.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::PeerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Closed,
    Error(String),
}

/// Write half of a channel. Chunks land on the remote end's event stream
/// in send order.
#[derive(Debug)]
pub struct ByteChannel {
    tx: mpsc::Sender<ChannelEvent>,
    closed: bool,
}

impl ByteChannel {
    pub async fn send(&self, chunk: Bytes) -> Result<(), PeerError> {
        if self.closed {
            return Err(PeerError::ChannelClosed);
        }
        self.tx
            .send(ChannelEvent::Message(chunk))
            .await
            .map_err(|_| PeerError::ChannelClosed)
    }

    /// Signals close to the remote end. Further sends fail.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(TrySendError::Full(_)) = self.tx.try_send(ChannelEvent::Closed) {
            // The remote end still has queued events; it will observe the
            // dropped sender as a close instead.
        }
    }
}

/// Read half of a channel: the stream of events the local side observes.
#[derive(Debug)]
pub struct ChannelEvents {
    rx: mpsc::Receiver<ChannelEvent>,
}

impl ChannelEvents {
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<ChannelEvent, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn poll_recv(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<ChannelEvent>> {
        self.rx.poll_recv(cx)
    }
}

/// An entangled pair of channel endpoints. Both event streams start with
/// [`ChannelEvent::Open`]. `capacity` must exceed the transfer window so a
/// full window of unacknowledged chunks never blocks the sender.
pub fn memory_channel(
    capacity: usize,
) -> ((ByteChannel, ChannelEvents), (ByteChannel, ChannelEvents)) {
    let (left_tx, left_rx) = mpsc::channel(capacity);
    let (right_tx, right_rx) = mpsc::channel(capacity);

    // The channel "opens" as soon as the pair exists.
    let _ = left_tx.try_send(ChannelEvent::Open);
    let _ = right_tx.try_send(ChannelEvent::Open);

    let left = (
        ByteChannel {
            tx: right_tx,
            closed: false,
        },
        ChannelEvents { rx: left_rx },
    );
    let right = (
        ByteChannel {
            tx: left_tx,
            closed: false,
        },
        ChannelEvents { rx: right_rx },
    );
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn both_ends_open_then_deliver_in_order() {
        let ((left_tx, mut left_rx), (right_tx, mut right_rx)) = memory_channel(8);

        assert_eq!(left_rx.recv().await, Some(ChannelEvent::Open));
        assert_eq!(right_rx.recv().await, Some(ChannelEvent::Open));

        left_tx.send(Bytes::from_static(b"one")).await.unwrap();
        left_tx.send(Bytes::from_static(b"two")).await.unwrap();
        right_tx.send(Bytes::from_static(b"back")).await.unwrap();

        assert_eq!(
            right_rx.recv().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"one")))
        );
        assert_eq!(
            right_rx.recv().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"two")))
        );
        assert_eq!(
            left_rx.recv().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"back")))
        );
    }

    #[tokio::test]
    async fn close_signals_remote_and_rejects_local_sends() {
        let ((mut left_tx, _left_rx), (_right_tx, mut right_rx)) = memory_channel(8);
        assert_eq!(right_rx.recv().await, Some(ChannelEvent::Open));

        left_tx.close();
        assert_eq!(right_rx.recv().await, Some(ChannelEvent::Closed));

        let err = left_tx.send(Bytes::from_static(b"late")).await.unwrap_err();
        assert!(matches!(err, PeerError::ChannelClosed));
    }

    #[tokio::test]
    async fn dropped_sender_reads_as_end_of_stream() {
        let ((left_tx, _left_rx), (_right_tx, mut right_rx)) = memory_channel(8);
        assert_eq!(right_rx.recv().await, Some(ChannelEvent::Open));
        drop(left_tx);
        assert_eq!(right_rx.recv().await, None);
    }
}
