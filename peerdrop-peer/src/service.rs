//! The peer-side controller: owns the roster, active transfer sessions
//! and the task registry, reacts to relayed server messages and channel
//! events, and drives the send window.
//!
//! A `PeerService` is single-owner state driven from one loop ([`run`]);
//! nothing here is shared across tasks, so no locking is involved.

use std::collections::HashMap;
use std::path::Path;
use std::task::Poll;
use std::time::Instant;

use futures::future::poll_fn;
use peerdrop_core::{
    AbortPayload, CandidatePayload, ClientMessage, DescPayload, FileMeta, IncomingOffer,
    NameAnnouncement, PeerId, PeerInfo, ReceiveReply, SendRequest, ServerMessage, TransferConfig,
    TransferPhase, TransferStatus, validate_display_name, validate_file_meta,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, warn};

use crate::PeerError;
use crate::channel::ChannelEvent;
use crate::negotiation::Negotiation;
use crate::relay::RelayConnection;
use crate::session::{ChunkFile, FileSource, TransferSession};
use crate::task::{Direction, Task, TaskId, TaskListener, TaskRegistry};
use crate::transport::Transport;

/// Builds a fresh transport for a transfer with the given remote peer.
pub type TransportFactory<T> = Box<dyn FnMut(&PeerId) -> Result<T, PeerError> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterPeer {
    pub info: PeerInfo,
    pub is_transferring: bool,
}

struct PendingOffer {
    meta: FileMeta,
    task_id: TaskId,
}

enum CloseOutcome {
    /// Transfer completed; the task was already finished by the caller.
    Finished,
    /// Declined, aborted or the peer departed; the task is rejected.
    Rejected,
    /// The channel dropped out from under us; the task keeps its last
    /// observed state.
    ChannelLost,
}

pub struct PeerService<T: Transport> {
    display_name: String,
    config: TransferConfig,
    roster: Vec<RosterPeer>,
    sessions: HashMap<PeerId, TransferSession<T>>,
    pending_offers: HashMap<PeerId, PendingOffer>,
    tasks: TaskRegistry,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    connect: TransportFactory<T>,
}

impl<T: Transport> PeerService<T> {
    pub fn new(
        display_name: &str,
        config: TransferConfig,
        outbox: mpsc::UnboundedSender<ClientMessage>,
        connect: TransportFactory<T>,
    ) -> Result<Self, PeerError> {
        validate_display_name(display_name)?;
        config.validate()?;
        Ok(Self {
            display_name: display_name.to_owned(),
            config,
            roster: Vec::new(),
            sessions: HashMap::new(),
            pending_offers: HashMap::new(),
            tasks: TaskRegistry::new(),
            outbox,
            connect,
        })
    }

    /// Registers the display name with the relay. Must be the first
    /// message on a fresh connection.
    pub fn announce(&self) {
        self.send_signal(ClientMessage::Name(NameAnnouncement {
            display_name: self.display_name.clone(),
        }));
    }

    pub fn subscribe_tasks(&mut self, listener: TaskListener) {
        self.tasks.subscribe(listener);
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.snapshot()
    }

    pub fn roster(&self) -> &[RosterPeer] {
        &self.roster
    }

    /// Commits to sending `path` to `remote` and announces the offer.
    /// One transfer per peer pair: a second commit while one is active is
    /// refused.
    pub async fn commit_send(
        &mut self,
        remote: &PeerId,
        path: &Path,
        mime_type: Option<String>,
    ) -> Result<TaskId, PeerError> {
        if self.sessions.contains_key(remote) || self.pending_offers.contains_key(remote) {
            return Err(PeerError::PeerBusy(remote.clone()));
        }
        let remote_name = self
            .roster
            .iter()
            .find(|peer| peer.info.id == *remote)
            .map(|peer| peer.info.display_name.clone())
            .ok_or_else(|| PeerError::UnknownPeer(remote.clone()))?;

        let (file, size) = ChunkFile::open(path).await?;
        let meta = FileMeta {
            name: path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("unnamed")
                .to_owned(),
            size,
            mime_type: mime_type.unwrap_or_else(|| "application/octet-stream".to_owned()),
        };
        validate_file_meta(&meta)?;

        let task_id = self.tasks.create_send(&remote_name, &meta);
        let session = TransferSession::new_send(
            remote.clone(),
            meta.clone(),
            file,
            task_id,
            &self.config,
        );
        self.sessions.insert(remote.clone(), session);
        self.set_transferring(remote, true);

        self.send_signal(ClientMessage::Send(SendRequest {
            remote_peer_id: remote.clone(),
            file_name: meta.name,
            file_size: meta.size,
            mime_type: meta.mime_type,
        }));
        Ok(task_id)
    }

    /// Answers a pending inbound offer. Accepting creates the receive
    /// session and its transport; declining rejects the task.
    pub fn respond(&mut self, remote: &PeerId, accepted: bool) -> Result<TaskId, PeerError> {
        if !self.pending_offers.contains_key(remote) {
            return Err(PeerError::NoPendingOffer(remote.clone()));
        }
        // Build the transport before consuming the offer so a factory
        // failure leaves the offer answerable.
        let transport = if accepted {
            Some((self.connect)(remote)?)
        } else {
            None
        };
        let pending = self
            .pending_offers
            .remove(remote)
            .ok_or_else(|| PeerError::NoPendingOffer(remote.clone()))?;

        self.send_signal(ClientMessage::Receive(ReceiveReply {
            remote_peer_id: remote.clone(),
            accepted,
        }));

        match transport {
            Some(transport) => {
                let mut session = TransferSession::new_receive(
                    remote.clone(),
                    pending.meta,
                    pending.task_id,
                    &self.config,
                );
                session.negotiation = Some(Negotiation::new(transport));
                self.sessions.insert(remote.clone(), session);
                self.set_transferring(remote, true);
                self.tasks.start(pending.task_id);
            }
            None => {
                self.set_transferring(remote, false);
                self.tasks.reject(pending.task_id);
            }
        }
        Ok(pending.task_id)
    }

    /// Aborts whatever is in flight with `remote`, session or pending
    /// offer, and tells the remote peer.
    pub fn abort(&mut self, remote: &PeerId) {
        self.send_signal(ClientMessage::Abort(AbortPayload {
            remote_peer_id: remote.clone(),
        }));
        if self.sessions.contains_key(remote) {
            self.close_session(remote, CloseOutcome::Rejected);
        } else if let Some(pending) = self.pending_offers.remove(remote) {
            self.set_transferring(remote, false);
            self.tasks.reject(pending.task_id);
        }
    }

    pub async fn handle_server_message(
        &mut self,
        message: ServerMessage,
    ) -> Result<(), PeerError> {
        match message {
            ServerMessage::Users(users) => {
                self.apply_roster(users);
                Ok(())
            }
            ServerMessage::ConfirmReceive(offer) => self.on_incoming_offer(offer),
            ServerMessage::ConfirmSend(reply) => self.on_send_verdict(reply),
            ServerMessage::Desc(payload) => self.on_description(payload),
            ServerMessage::Candidate(payload) => self.on_candidate(payload),
            ServerMessage::ReceiveState(status) => self.on_receive_state(status).await,
            ServerMessage::Abort(payload) => {
                self.on_remote_abort(&payload.remote_peer_id);
                Ok(())
            }
            ServerMessage::Error(info) => {
                warn!(reason = %info.reason, "relay reported an error");
                Ok(())
            }
        }
    }

    /// Processes one event from a session's data channel.
    pub async fn on_channel_event(
        &mut self,
        remote: &PeerId,
        event: ChannelEvent,
    ) -> Result<(), PeerError> {
        match event {
            ChannelEvent::Open => {
                let is_sender = {
                    let Some(session) = self.sessions.get_mut(remote) else {
                        return Ok(());
                    };
                    if let Some(negotiation) = session.negotiation.as_mut() {
                        negotiation.mark_open();
                    }
                    session.direction == Direction::Send
                };
                if is_sender {
                    self.pump_send(remote).await?;
                }
                Ok(())
            }
            ChannelEvent::Message(chunk) => self.on_chunk(remote, chunk).await,
            ChannelEvent::Closed => {
                debug!(peer = %remote, "data channel closed");
                self.on_channel_gone(remote);
                Ok(())
            }
            ChannelEvent::Error(reason) => {
                warn!(peer = %remote, %reason, "data channel error");
                self.on_channel_gone(remote);
                Ok(())
            }
        }
    }

    /// Non-blocking poll of all session channels; used by tests and by
    /// callers embedding the service in their own loop.
    pub fn try_next_channel_event(&mut self) -> Option<(PeerId, ChannelEvent)> {
        let mut disconnected = None;
        for (peer, session) in self.sessions.iter_mut() {
            let Some(events) = session.events.as_mut() else {
                continue;
            };
            match events.try_recv() {
                Ok(event) => return Some((peer.clone(), event)),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    disconnected = Some(peer.clone());
                    break;
                }
            }
        }
        if let Some(peer) = disconnected {
            if let Some(session) = self.sessions.get_mut(&peer) {
                session.events = None;
            }
            return Some((peer.clone(), ChannelEvent::Closed));
        }
        None
    }

    /// Waits for the next event on any session channel. Pends forever
    /// while no session has an attached channel, which is the idle state
    /// inside [`run`]'s select loop.
    pub async fn next_channel_event(&mut self) -> (PeerId, ChannelEvent) {
        poll_fn(|cx| {
            let mut disconnected = None;
            for (peer, session) in self.sessions.iter_mut() {
                let Some(events) = session.events.as_mut() else {
                    continue;
                };
                match events.poll_recv(cx) {
                    Poll::Ready(Some(event)) => return Poll::Ready((peer.clone(), event)),
                    Poll::Ready(None) => {
                        disconnected = Some(peer.clone());
                        break;
                    }
                    Poll::Pending => {}
                }
            }
            if let Some(peer) = disconnected {
                if let Some(session) = self.sessions.get_mut(&peer) {
                    session.events = None;
                }
                return Poll::Ready((peer, ChannelEvent::Closed));
            }
            Poll::Pending
        })
        .await
    }

    fn apply_roster(&mut self, users: Vec<PeerInfo>) {
        let departed: Vec<PeerId> = self
            .sessions
            .keys()
            .chain(self.pending_offers.keys())
            .filter(|id| !users.iter().any(|user| user.id == **id))
            .cloned()
            .collect();
        for id in departed {
            debug!(peer = %id, "peer left with a transfer in flight");
            self.close_session(&id, CloseOutcome::Rejected);
            if let Some(pending) = self.pending_offers.remove(&id) {
                self.tasks.reject(pending.task_id);
            }
        }
        self.roster = users
            .into_iter()
            .map(|info| RosterPeer {
                is_transferring: self.sessions.contains_key(&info.id)
                    || self.pending_offers.contains_key(&info.id),
                info,
            })
            .collect();
    }

    fn on_incoming_offer(&mut self, offer: IncomingOffer) -> Result<(), PeerError> {
        let remote = offer.remote_peer_id.clone();
        if self.sessions.contains_key(&remote) || self.pending_offers.contains_key(&remote) {
            warn!(peer = %remote, "declining offer while a transfer with the peer is active");
            self.send_signal(ClientMessage::Receive(ReceiveReply {
                remote_peer_id: remote,
                accepted: false,
            }));
            return Ok(());
        }
        let meta = offer.file_meta();
        if let Err(err) = validate_file_meta(&meta) {
            warn!(peer = %remote, error = %err, "declining offer with invalid metadata");
            self.send_signal(ClientMessage::Receive(ReceiveReply {
                remote_peer_id: remote,
                accepted: false,
            }));
            return Ok(());
        }
        let task_id = self.tasks.create_receive(&offer.remote_name, &meta);
        self.pending_offers
            .insert(remote.clone(), PendingOffer { meta, task_id });
        self.set_transferring(&remote, true);
        Ok(())
    }

    /// The remote peer answered our send offer. Acceptance starts the
    /// connection handshake; refusal tears the session down.
    fn on_send_verdict(&mut self, reply: ReceiveReply) -> Result<(), PeerError> {
        let remote = reply.remote_peer_id;
        if !reply.accepted {
            debug!(peer = %remote, "send offer declined");
            self.close_session(&remote, CloseOutcome::Rejected);
            return Ok(());
        }
        // Validate the session before building a transport, so a stale
        // verdict never leaves an unclosed transport behind.
        match self.sessions.get(&remote) {
            None => return Err(PeerError::UnknownSession(remote.clone())),
            Some(session) if session.direction != Direction::Send => {
                return Err(PeerError::ProtocolViolation(
                    "confirmSend for a receive session".to_owned(),
                ));
            }
            Some(_) => {}
        }
        let transport = (self.connect)(&remote)?;
        let (offer, candidates) = {
            let session = self
                .sessions
                .get_mut(&remote)
                .ok_or_else(|| PeerError::UnknownSession(remote.clone()))?;
            let mut negotiation = Negotiation::new(transport);
            let offer = negotiation.initiate()?;
            let candidates = negotiation.drain_candidates();
            session.negotiation = Some(negotiation);
            (offer, candidates)
        };
        self.send_signal(ClientMessage::Desc(DescPayload {
            remote_peer_id: remote.clone(),
            desc: offer,
        }));
        for candidate in candidates {
            self.send_signal(ClientMessage::Candidate(CandidatePayload {
                remote_peer_id: remote.clone(),
                candidate: Some(candidate),
            }));
        }
        Ok(())
    }

    fn on_description(&mut self, payload: DescPayload) -> Result<(), PeerError> {
        let remote = payload.remote_peer_id;
        let (answer, candidates) = {
            let session = self
                .sessions
                .get_mut(&remote)
                .ok_or_else(|| PeerError::UnknownSession(remote.clone()))?;
            let negotiation = session.negotiation.as_mut().ok_or_else(|| {
                PeerError::ProtocolViolation("description before negotiation started".to_owned())
            })?;
            let answer = negotiation.on_description(&payload.desc)?;
            let candidates = negotiation.drain_candidates();
            session.try_attach_channel();
            (answer, candidates)
        };
        if let Some(answer) = answer {
            self.send_signal(ClientMessage::Desc(DescPayload {
                remote_peer_id: remote.clone(),
                desc: answer,
            }));
        }
        for candidate in candidates {
            self.send_signal(ClientMessage::Candidate(CandidatePayload {
                remote_peer_id: remote.clone(),
                candidate: Some(candidate),
            }));
        }
        Ok(())
    }

    fn on_candidate(&mut self, payload: CandidatePayload) -> Result<(), PeerError> {
        let Some(session) = self.sessions.get_mut(&payload.remote_peer_id) else {
            // Candidates can trail an already torn-down session.
            debug!(peer = %payload.remote_peer_id, "dropping candidate without a session");
            return Ok(());
        };
        let Some(negotiation) = session.negotiation.as_mut() else {
            debug!(peer = %payload.remote_peer_id, "dropping candidate before negotiation");
            return Ok(());
        };
        negotiation.on_candidate(payload.candidate.as_deref())?;
        session.try_attach_channel();
        Ok(())
    }

    /// Receiver acknowledgment on the send side: `InProgress` releases
    /// the next window, `Finished` completes the task.
    async fn on_receive_state(&mut self, status: TransferStatus) -> Result<(), PeerError> {
        let remote = status.remote_peer_id;
        match status.state {
            TransferPhase::Finished => {
                let Some(session) = self.sessions.get(&remote) else {
                    // The channel can close before the relayed ack lands.
                    debug!(peer = %remote, "finished ack without a session");
                    return Ok(());
                };
                let task_id = session.task_id;
                self.tasks.finish(task_id, None);
                self.close_session(&remote, CloseOutcome::Finished);
                Ok(())
            }
            TransferPhase::InProgress => {
                let sample = {
                    let Some(session) = self.sessions.get_mut(&remote) else {
                        debug!(peer = %remote, "progress ack without a session");
                        return Ok(());
                    };
                    let Some(window) = session.send_window.as_mut() else {
                        return Err(PeerError::ProtocolViolation(
                            "progress ack for a receive session".to_owned(),
                        ));
                    };
                    window.acknowledge();
                    let speed = session.speed.sample(Instant::now());
                    (session.task_id, speed)
                };
                let (task_id, speed) = sample;
                if let Some(progress) = status.progress {
                    self.tasks.set_progress(task_id, progress);
                }
                self.tasks.set_speed(task_id, speed);
                self.pump_send(&remote).await
            }
        }
    }

    fn on_remote_abort(&mut self, remote: &PeerId) {
        if self.sessions.contains_key(remote) {
            self.close_session(remote, CloseOutcome::Rejected);
        } else if let Some(pending) = self.pending_offers.remove(remote) {
            self.set_transferring(remote, false);
            self.tasks.reject(pending.task_id);
        } else {
            debug!(peer = %remote, "abort without a transfer");
        }
    }

    async fn on_chunk(&mut self, remote: &PeerId, chunk: bytes::Bytes) -> Result<(), PeerError> {
        let step = {
            let session = self
                .sessions
                .get_mut(remote)
                .ok_or_else(|| PeerError::UnknownSession(remote.clone()))?;
            let task_id = session.task_id;
            match session.receive.as_mut() {
                None => Err(PeerError::ProtocolViolation(
                    "chunk delivered to a send session".to_owned(),
                )),
                Some(buffer) => buffer.push(chunk).map(|outcome| {
                    let speed = outcome
                        .progress_ack
                        .map(|_| session.speed.sample(Instant::now()));
                    (task_id, outcome, speed)
                }),
            }
        };
        match step {
            Err(err) => {
                warn!(peer = %remote, error = %err, "aborting transfer");
                self.send_signal(ClientMessage::Abort(AbortPayload {
                    remote_peer_id: remote.clone(),
                }));
                self.close_session(remote, CloseOutcome::Rejected);
                Err(err)
            }
            Ok((task_id, outcome, speed)) => {
                if let Some(progress) = outcome.progress_ack {
                    self.tasks.set_progress(task_id, progress);
                    if let Some(speed) = speed {
                        self.tasks.set_speed(task_id, speed);
                    }
                    self.send_signal(ClientMessage::ReceiveState(TransferStatus {
                        remote_peer_id: remote.clone(),
                        state: TransferPhase::InProgress,
                        progress: Some(progress),
                    }));
                }
                if let Some(data) = outcome.finished {
                    self.tasks.finish(task_id, Some(data));
                    self.send_signal(ClientMessage::ReceiveState(TransferStatus {
                        remote_peer_id: remote.clone(),
                        state: TransferPhase::Finished,
                        progress: None,
                    }));
                    self.close_session(remote, CloseOutcome::Finished);
                }
                Ok(())
            }
        }
    }

    /// Fills the send window: read, send, repeat until the window is full
    /// or the file is exhausted, then publish sender-side progress.
    async fn pump_send(&mut self, remote: &PeerId) -> Result<(), PeerError> {
        loop {
            let outcome = {
                let Some(session) = self.sessions.get_mut(remote) else {
                    return Ok(());
                };
                if session.channel.is_none() {
                    return Ok(());
                }
                let Some(slice) = session
                    .send_window
                    .as_ref()
                    .and_then(|window| window.next_slice())
                else {
                    break;
                };
                read_and_send(session, slice).await
            };
            if let Err(err) = outcome {
                match err {
                    PeerError::ChannelClosed => {
                        self.close_session(remote, CloseOutcome::ChannelLost);
                    }
                    _ => {
                        warn!(peer = %remote, error = %err, "aborting transfer");
                        self.send_signal(ClientMessage::Abort(AbortPayload {
                            remote_peer_id: remote.clone(),
                        }));
                        self.close_session(remote, CloseOutcome::Rejected);
                    }
                }
                return Err(err);
            }
        }
        let update = self.sessions.get(remote).and_then(|session| {
            session
                .send_window
                .as_ref()
                .map(|window| (session.task_id, window.progress()))
        });
        if let Some((task_id, progress)) = update {
            self.tasks.set_progress(task_id, progress);
        }
        Ok(())
    }

    /// The data channel dropped out. A sender that has already pushed the
    /// whole file keeps its session: the receiver tears the channel down
    /// before its relayed `finished` acknowledgment crosses the relay, so
    /// the local close event always arrives first and the task still needs
    /// that ack (or an abort) to reach its terminal state.
    fn on_channel_gone(&mut self, remote: &PeerId) {
        let awaiting_final_ack = self.sessions.get(remote).is_some_and(|session| {
            session.direction == Direction::Send
                && session
                    .send_window
                    .as_ref()
                    .is_some_and(|window| window.is_exhausted())
        });
        if awaiting_final_ack {
            if let Some(session) = self.sessions.get_mut(remote) {
                session.events = None;
            }
            return;
        }
        self.close_session(remote, CloseOutcome::ChannelLost);
    }

    fn close_session(&mut self, remote: &PeerId, outcome: CloseOutcome) {
        let Some(mut session) = self.sessions.remove(remote) else {
            return;
        };
        session.close();
        self.set_transferring(remote, false);
        if matches!(outcome, CloseOutcome::Rejected) {
            self.tasks.reject(session.task_id);
        }
    }

    fn set_transferring(&mut self, remote: &PeerId, value: bool) {
        if let Some(peer) = self.roster.iter_mut().find(|peer| peer.info.id == *remote) {
            peer.is_transferring = value;
        }
    }

    /// The outbox is drained by the relay writer; a send only fails once
    /// the connection is gone, at which point there is nobody to tell.
    fn send_signal(&self, message: ClientMessage) {
        let _ = self.outbox.send(message);
    }
}

async fn read_and_send<T: Transport>(
    session: &mut TransferSession<T>,
    slice: (u64, usize),
) -> Result<(), PeerError> {
    let (offset, len) = slice;
    let FileSource::LocalFile(file) = &mut session.source else {
        return Err(PeerError::ProtocolViolation(
            "send session has no local file".to_owned(),
        ));
    };
    let chunk = file.read_chunk(offset, len).await?;
    if chunk.len() != len {
        return Err(PeerError::ProtocolViolation(
            "source file truncated during transfer".to_owned(),
        ));
    }
    let Some(channel) = session.channel.as_ref() else {
        return Err(PeerError::ChannelClosed);
    };
    channel.send(chunk).await?;
    if let Some(window) = session.send_window.as_mut() {
        window.record_sent(len);
    }
    Ok(())
}

/// Drives a service against a live relay connection until the relay
/// closes the socket. Per-message errors are logged, not fatal.
pub async fn run<T: Transport>(
    service: &mut PeerService<T>,
    relay: &mut RelayConnection,
) -> Result<(), PeerError> {
    loop {
        tokio::select! {
            message = relay.next() => {
                match message {
                    Some(Ok(message)) => {
                        if let Err(err) = service.handle_server_message(message).await {
                            warn!(error = %err, "failed to handle relay message");
                        }
                    }
                    Some(Err(err)) => warn!(error = %err, "bad relay frame"),
                    None => return Ok(()),
                }
            }
            (peer, event) = service.next_channel_event() => {
                if let Err(err) = service.on_channel_event(&peer, event).await {
                    warn!(peer = %peer, error = %err, "channel event failed");
                }
            }
        }
    }
}
